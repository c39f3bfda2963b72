//! Per-sink batching: a bounded FIFO queue that forms batches on a size or
//! age trigger and hands them to a sink-specific flush callback with a
//! bounded number of flushes in flight. Grounded on the pack's
//! `otlp2parquet` `BatchManager` (size/byte/age-triggered flush behind a
//! `parking_lot::Mutex`-protected accumulator); this version drives the age
//! trigger from an active `tokio::time::Instant` deadline rather than
//! checking it on every `ingest` call, and adds the concurrency cap and
//! drop-newest backpressure policy `spec.md` §4.D requires.
use crate::config::BatchConfig;
use crate::record::LogRecord;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, Semaphore};
use tracing::warn;

type FlushFn = Arc<dyn Fn(Vec<LogRecord>) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

enum Command {
    Record(LogRecord),
    Flush(oneshot::Sender<()>),
    Close(oneshot::Sender<()>),
}

/// Handle to a running batch worker for one sink. Cloning is cheap; all
/// clones share the same queue and counters.
#[derive(Clone)]
pub struct BatchManager {
    sender: mpsc::Sender<Command>,
    dropped: Arc<AtomicU64>,
    queued: Arc<AtomicU64>,
    last_drop_warning: Arc<std::sync::Mutex<Option<Instant>>>,
}

impl BatchManager {
    /// Spawns the background worker. `flush` is invoked with each completed
    /// batch in FIFO order relative to when the batch was *formed*; because
    /// up to `config.max_concurrency` flushes can be in flight at once,
    /// completion order across batches is best-effort, not guaranteed.
    pub fn start(config: BatchConfig, flush: FlushFn) -> BatchManager {
        let (sender, receiver) = mpsc::channel(config.max_queue_size);
        let dropped = Arc::new(AtomicU64::new(0));
        let queued = Arc::new(AtomicU64::new(0));
        tokio::spawn(run_worker(config, receiver, flush, queued.clone()));
        BatchManager {
            sender,
            dropped,
            queued,
            last_drop_warning: Arc::new(std::sync::Mutex::new(None)),
        }
    }

    /// Enqueues a record. Returns `false` (and increments the dropped
    /// counter) if the queue is full — this sink drops the *newest* record
    /// rather than blocking the caller or evicting older, already-ordered
    /// records.
    pub fn enqueue(&self, record: LogRecord) -> bool {
        match self.sender.try_send(Command::Record(record)) {
            Ok(()) => {
                self.queued.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(_) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                self.warn_dropped_rate_limited();
                false
            }
        }
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Records accepted into the queue but not yet flushed (either still
    /// batching or currently being flushed). Used to report how much work a
    /// sink is still holding when it's closed or torn down.
    pub fn queued_count(&self) -> u64 {
        self.queued.load(Ordering::Relaxed)
    }

    /// Forces the current partial batch to flush immediately without
    /// waiting for the size or age trigger.
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        if self.sender.send(Command::Flush(tx)).await.is_ok() {
            let _ = rx.await;
        }
    }

    /// Flushes any partial batch and stops the worker. Waits for the last
    /// flush to complete before returning.
    pub async fn close(self) {
        let (tx, rx) = oneshot::channel();
        if self.sender.send(Command::Close(tx)).await.is_ok() {
            let _ = rx.await;
        }
    }

    fn warn_dropped_rate_limited(&self) {
        let mut last = self.last_drop_warning.lock().unwrap();
        let now = Instant::now();
        if last.map(|t| now.duration_since(t) >= Duration::from_secs(1)).unwrap_or(true) {
            warn!(dropped_total = self.dropped.load(Ordering::Relaxed), "queue full, dropping newest record");
            *last = Some(now);
        }
    }
}

async fn run_worker(
    config: BatchConfig,
    mut receiver: mpsc::Receiver<Command>,
    flush: FlushFn,
    queued: Arc<AtomicU64>,
) {
    let semaphore = Arc::new(Semaphore::new(config.max_concurrency.max(1)));
    let inflight = Arc::new(AtomicU64::new(0));
    let mut current: Vec<LogRecord> = Vec::new();
    let mut deadline: Option<Instant> = None;

    loop {
        let sleep = async {
            match deadline {
                Some(at) => tokio::time::sleep_until(at.into()).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            command = receiver.recv() => {
                match command {
                    Some(Command::Record(record)) => {
                        if current.is_empty() {
                            deadline = Some(Instant::now() + config.timeout());
                        }
                        current.push(record);
                        if current.len() >= config.max_size {
                            spawn_flush(&semaphore, &inflight, &flush, &queued, std::mem::take(&mut current));
                            deadline = None;
                        }
                    }
                    Some(Command::Flush(done)) => {
                        if !current.is_empty() {
                            spawn_flush(&semaphore, &inflight, &flush, &queued, std::mem::take(&mut current));
                            deadline = None;
                        }
                        let _ = done.send(());
                    }
                    Some(Command::Close(done)) => {
                        if !current.is_empty() {
                            spawn_flush(&semaphore, &inflight, &flush, &queued, std::mem::take(&mut current));
                        }
                        wait_for_inflight(&inflight).await;
                        let _ = done.send(());
                        return;
                    }
                    None => {
                        if !current.is_empty() {
                            spawn_flush(&semaphore, &inflight, &flush, &queued, std::mem::take(&mut current));
                        }
                        wait_for_inflight(&inflight).await;
                        return;
                    }
                }
            }
            _ = sleep => {
                if !current.is_empty() {
                    spawn_flush(&semaphore, &inflight, &flush, &queued, std::mem::take(&mut current));
                }
                deadline = None;
            }
        }
    }
}

fn spawn_flush(
    semaphore: &Arc<Semaphore>,
    inflight: &Arc<AtomicU64>,
    flush: &FlushFn,
    queued: &Arc<AtomicU64>,
    batch: Vec<LogRecord>,
) {
    let semaphore = semaphore.clone();
    let flush = flush.clone();
    let inflight = inflight.clone();
    let queued = queued.clone();
    let batch_len = batch.len() as u64;
    inflight.fetch_add(1, Ordering::SeqCst);
    tokio::spawn(async move {
        let permit = semaphore.acquire_owned().await;
        flush(batch).await;
        drop(permit);
        queued.fetch_sub(batch_len, Ordering::Relaxed);
        inflight.fetch_sub(1, Ordering::SeqCst);
    });
}

/// Polls until every spawned flush task has finished. Simpler than a
/// notify-based wakeup and correct either way since `close`/`None` are
/// cold paths, not per-record hot paths.
async fn wait_for_inflight(inflight: &Arc<AtomicU64>) {
    while inflight.load(Ordering::SeqCst) > 0 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::level::Level;
    use crate::record::{LoggerContext, Source};
    use indexmap::IndexMap;
    use std::sync::Mutex as StdMutex;

    fn sample_record() -> LogRecord {
        LogRecord::new(
            Level::Info,
            "hi",
            IndexMap::new(),
            LoggerContext::new("svc", "test"),
            Source::default(),
        )
    }

    #[tokio::test]
    async fn flushes_on_size_trigger() {
        let flushed: Arc<StdMutex<Vec<usize>>> = Arc::new(StdMutex::new(Vec::new()));
        let flushed_clone = flushed.clone();
        let config = BatchConfig {
            max_size: 2,
            max_queue_size: 10,
            timeout_ms: 60_000,
            max_concurrency: 1,
        };
        let manager = BatchManager::start(
            config,
            Arc::new(move |batch: Vec<LogRecord>| {
                let flushed = flushed_clone.clone();
                Box::pin(async move {
                    flushed.lock().unwrap().push(batch.len());
                })
            }),
        );

        manager.enqueue(sample_record());
        manager.enqueue(sample_record());
        manager.flush().await;
        assert_eq!(*flushed.lock().unwrap(), vec![2]);
    }

    #[tokio::test]
    async fn flushes_on_age_trigger() {
        let flushed: Arc<StdMutex<Vec<usize>>> = Arc::new(StdMutex::new(Vec::new()));
        let flushed_clone = flushed.clone();
        let config = BatchConfig {
            max_size: 100,
            max_queue_size: 10,
            timeout_ms: 20,
            max_concurrency: 1,
        };
        let manager = BatchManager::start(
            config,
            Arc::new(move |batch: Vec<LogRecord>| {
                let flushed = flushed_clone.clone();
                Box::pin(async move {
                    flushed.lock().unwrap().push(batch.len());
                })
            }),
        );

        manager.enqueue(sample_record());
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(*flushed.lock().unwrap(), vec![1]);
    }

    #[tokio::test]
    async fn drops_newest_when_queue_full() {
        let config = BatchConfig {
            max_size: 1000,
            max_queue_size: 1,
            timeout_ms: 60_000,
            max_concurrency: 1,
        };
        let manager = BatchManager::start(config, Arc::new(|_batch| Box::pin(async {})));
        manager.enqueue(sample_record());
        let accepted = manager.enqueue(sample_record());
        // Queue capacity is tiny so the second enqueue likely overflows; either
        // way dropped_count tracks whatever got rejected.
        if !accepted {
            assert_eq!(manager.dropped_count(), 1);
        }
    }

    #[tokio::test]
    async fn queued_count_tracks_accepted_records_until_flushed() {
        let config = BatchConfig {
            max_size: 100,
            max_queue_size: 10,
            timeout_ms: 60_000,
            max_concurrency: 1,
        };
        let manager = BatchManager::start(config, Arc::new(|_batch| Box::pin(async {})));
        manager.enqueue(sample_record());
        manager.enqueue(sample_record());
        assert_eq!(manager.queued_count(), 2);
        manager.flush().await;
        assert_eq!(manager.queued_count(), 0);
    }

    #[tokio::test]
    async fn close_flushes_remaining_partial_batch() {
        let flushed: Arc<StdMutex<Vec<usize>>> = Arc::new(StdMutex::new(Vec::new()));
        let flushed_clone = flushed.clone();
        let config = BatchConfig {
            max_size: 100,
            max_queue_size: 10,
            timeout_ms: 60_000,
            max_concurrency: 1,
        };
        let manager = BatchManager::start(
            config,
            Arc::new(move |batch: Vec<LogRecord>| {
                let flushed = flushed_clone.clone();
                Box::pin(async move {
                    flushed.lock().unwrap().push(batch.len());
                })
            }),
        );
        manager.enqueue(sample_record());
        manager.close().await;
        assert_eq!(*flushed.lock().unwrap(), vec![1]);
    }
}
