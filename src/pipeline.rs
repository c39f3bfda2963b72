//! Wires sinks, batch managers, circuit breakers and the retry manager
//! together and fans each record out to every enabled sink. See `spec.md`
//! §4.H. Health/metrics plumbing is grounded in the teacher's
//! `metrics.rs::IntakeMetricsCollector` pattern — one small struct per
//! concern, registered once with the global registry.
use crate::batch::BatchManager;
use crate::circuit_breaker::{BreakerState, CircuitBreaker, SinkHealth};
use crate::config::ConfigDocument;
use crate::level::Level;
use crate::metrics::PipelineMetrics;
use crate::record::LogRecord;
use crate::retry::RetryManager;
use crate::sink::{ConsoleSink, FileSink, OtlpSink, RedisSink, Sink, SinkError};
use parking_lot::RwLock;
use rand::Rng;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, warn};

/// How long the fallback stderr summary waits between prints while every
/// sink is unhealthy. See `spec.md` §4.H.
const FLOOD_WINDOW: Duration = Duration::from_secs(5);

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SinkState {
    Initializing,
    Ready,
    Degraded,
    Closing,
    Closed,
}

struct SinkRuntime {
    name: String,
    sink: Arc<dyn Sink>,
    batch: BatchManager,
    breaker: Arc<CircuitBreaker>,
    state: Arc<AtomicU8>,
    /// Per-sink level floor (`spec.md` §4.I); `None` means the sink accepts
    /// anything the global logger level admits.
    level: Option<Level>,
}

impl SinkRuntime {
    fn set_state(&self, state: SinkState) {
        self.state.store(state as u8, Ordering::Relaxed);
    }

    fn state(&self) -> SinkState {
        load_state(&self.state)
    }
}

fn load_state(state: &AtomicU8) -> SinkState {
    match state.load(Ordering::Relaxed) {
        0 => SinkState::Initializing,
        1 => SinkState::Ready,
        2 => SinkState::Degraded,
        3 => SinkState::Closing,
        _ => SinkState::Closed,
    }
}

/// Moves a sink between `Ready` and `Degraded` based on its breaker state,
/// called after every flush attempt. `spec.md` §4.H's `ready → degraded
/// (breaker open) → ready` transition lives here; a sink already `Closing`
/// or `Closed` is left alone since those states only move forward toward
/// teardown.
fn update_health_state(state: &Arc<AtomicU8>, breaker_state: BreakerState) {
    match load_state(state) {
        SinkState::Closing | SinkState::Closed => return,
        _ => {}
    }
    let next = match breaker_state {
        BreakerState::Open => SinkState::Degraded,
        BreakerState::Closed | BreakerState::HalfOpen => SinkState::Ready,
    };
    state.store(next as u8, Ordering::Relaxed);
}

/// Owns every configured sink and is the single point of entry for
/// submitting a [`LogRecord`]. See `spec.md` §4.H.
pub struct Pipeline {
    sinks: RwLock<Vec<Arc<SinkRuntime>>>,
    metrics: PipelineMetrics,
    sampling_debug_info_rate: RwLock<f64>,
    closed: AtomicBool,
}

fn build_sinks(config: &ConfigDocument, metrics: &PipelineMetrics) -> Result<Vec<Arc<SinkRuntime>>, SinkError> {
    let mut sinks = Vec::new();

    if let Some(console) = &config.sinks.console {
        sinks.push(build_runtime(
            "console",
            Arc::new(ConsoleSink::new(console.pretty, console.colorize)),
            config,
            metrics,
            console.level.as_deref(),
        ));
    }
    if let Some(file) = &config.sinks.file {
        let sink = FileSink::new(file.clone()).map_err(SinkError::from)?;
        sinks.push(build_runtime("file", Arc::new(sink), config, metrics, file.level.as_deref()));
    }
    if let Some(otlp) = &config.sinks.otlp {
        let sink = OtlpSink::new(otlp.clone())?;
        sinks.push(build_runtime("otlp", Arc::new(sink), config, metrics, otlp.level.as_deref()));
    }
    if let Some(redis) = &config.sinks.redis {
        let sink = RedisSink::new(redis.clone())?;
        sinks.push(build_runtime("redis", Arc::new(sink), config, metrics, redis.level.as_deref()));
    }
    Ok(sinks)
}

impl Pipeline {
    /// Builds the pipeline and spawns its flood-watch task. Returns an
    /// already-`Arc`-wrapped pipeline since the flood watch holds a live
    /// handle to `self` for the process lifetime (sinks can be swapped out
    /// later by [`reload`](Self::reload), so it re-reads `self.sinks` on
    /// every tick rather than snapshotting it once).
    pub fn new(config: &ConfigDocument, metrics: PipelineMetrics) -> Result<Arc<Pipeline>, SinkError> {
        let sinks = build_sinks(config, &metrics)?;

        let pipeline = Arc::new(Pipeline {
            sinks: RwLock::new(sinks),
            metrics,
            sampling_debug_info_rate: RwLock::new(config.sampling.debug_info_rate),
            closed: AtomicBool::new(false),
        });
        pipeline.clone().spawn_flood_watch();
        Ok(pipeline)
    }

    /// Applies a [`crate::config::ReloadEvent`] document produced by
    /// [`crate::config::ConfigWatcher`]. Sampling and per-sink batch/retry
    /// tuning apply without disturbing running sinks; when `critical` is set
    /// (the event was a [`crate::config::ReloadEvent::CriticalChange`]) every
    /// sink is closed and reinstantiated against the new document instead,
    /// since their connection targets may have changed. See `spec.md` §4.C.
    pub async fn reload(&self, config: &ConfigDocument, critical: bool) -> Result<(), SinkError> {
        *self.sampling_debug_info_rate.write() = config.sampling.debug_info_rate;

        if !critical {
            return Ok(());
        }

        let new_sinks = build_sinks(config, &self.metrics)?;
        let old_sinks = std::mem::replace(&mut *self.sinks.write(), new_sinks);
        for runtime in old_sinks {
            runtime.set_state(SinkState::Closing);
            let batch = runtime.batch.clone();
            let sink = runtime.sink.clone();
            batch.close().await;
            let _ = sink.close().await;
            runtime.set_state(SinkState::Closed);
        }
        Ok(())
    }

    /// `true` once [`close_all`](Self::close_all) has started tearing sinks
    /// down; [`crate::logger::Logger`] consults this to reject further
    /// submissions with [`crate::error::ShutdownError`] instead of silently
    /// queueing them behind closing sinks.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Fans `record` out to every enabled sink's queue. Sampling is applied
    /// here: only `debug`/`info` records are ever dropped by the sampler, so
    /// `warn`/`error`/`fatal` records are always forwarded. See `spec.md`
    /// §4.H "sampling restricted to debug/info". Records submitted after
    /// [`close_all`](Self::close_all) has started are silently dropped; the
    /// facade is expected to check [`is_closed`](Self::is_closed) first so
    /// callers see a [`crate::error::ShutdownError`] rather than a
    /// queue-full drop.
    pub fn emit(&self, record: LogRecord) {
        if self.is_closed() || self.sampled_out(&record) {
            return;
        }
        for runtime in self.sinks.read().iter() {
            if runtime.level.is_some_and(|floor| record.level < floor) {
                continue;
            }
            self.metrics.records_submitted.with_label_values(&[&runtime.name]).inc();
            if !runtime.batch.enqueue(record.clone()) {
                self.metrics.records_dropped.with_label_values(&[&runtime.name]).inc();
            }
        }
    }

    fn sampled_out(&self, record: &LogRecord) -> bool {
        if record.level >= Level::Warn {
            return false;
        }
        let rate = *self.sampling_debug_info_rate.read();
        if rate >= 1.0 {
            return false;
        }
        rand::thread_rng().gen::<f64>() >= rate
    }

    pub fn health(&self) -> Vec<SinkHealth> {
        self.sinks.read().iter().map(|r| r.breaker.health()).collect()
    }

    pub async fn flush_all(&self) {
        let runtimes: Vec<_> = self.sinks.read().clone();
        for runtime in &runtimes {
            runtime.batch.flush().await;
        }
    }

    pub async fn close_all(&self, deadline: Duration) {
        self.closed.store(true, Ordering::Release);
        let runtimes: Vec<_> = self.sinks.read().clone();
        for runtime in &runtimes {
            runtime.set_state(SinkState::Closing);
        }
        let close_futures = runtimes.iter().map(|runtime| {
            let batch = runtime.batch.clone();
            let sink = runtime.sink.clone();
            async move {
                batch.close().await;
                let _ = sink.close().await;
            }
        });
        let all = futures::future::join_all(close_futures);
        if tokio::time::timeout(deadline, all).await.is_err() {
            let still_queued: u64 = runtimes.iter().map(|r| r.batch.queued_count()).sum();
            warn!(
                records_dropped = still_queued,
                "shutdown deadline elapsed before all sinks finished draining"
            );
        }
        for runtime in &runtimes {
            runtime.set_state(SinkState::Closed);
        }
    }

    fn spawn_flood_watch(self: Arc<Self>) {
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(FLOOD_WINDOW).await;
                let sinks = self.sinks.read();
                if sinks.is_empty() {
                    continue;
                }
                let all_open = sinks.iter().all(|r| r.breaker.state() == BreakerState::Open);
                if all_open {
                    let dropped: u64 = sinks.iter().map(|r| r.batch.dropped_count()).sum();
                    error!(
                        dropped_total = dropped,
                        "every configured sink is unhealthy; records are accumulating in queues"
                    );
                }
            }
        });
    }
}

fn build_runtime(
    name: &str,
    sink: Arc<dyn Sink>,
    config: &ConfigDocument,
    metrics: &PipelineMetrics,
    level: Option<&str>,
) -> Arc<SinkRuntime> {
    let breaker = Arc::new(CircuitBreaker::new(name, config.circuit_breaker.clone()));
    let level = level.and_then(|s| Level::from_str(s).ok());
    let state = Arc::new(AtomicU8::new(SinkState::Ready as u8));
    let runtime = Arc::new(SinkRuntime {
        name: name.to_owned(),
        sink: sink.clone(),
        batch: spawn_batch(
            name.to_owned(),
            sink,
            config.clone(),
            breaker.clone(),
            metrics.clone(),
            state.clone(),
        ),
        breaker,
        state,
        level,
    });
    runtime
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::test_metrics;

    fn console_only_config() -> ConfigDocument {
        let mut config = ConfigDocument::default();
        config.sinks.console = Some(crate::config::ConsoleSinkConfig { pretty: false, ..Default::default() });
        config.sinks.file = None;
        config.sinks.otlp = None;
        config.sinks.redis = None;
        config
    }

    #[tokio::test]
    async fn reload_without_critical_flag_keeps_sinks_in_place() {
        let config = console_only_config();
        let pipeline = Pipeline::new(&config, test_metrics()).unwrap();
        let before: Vec<_> = pipeline.sinks.read().iter().map(|r| Arc::as_ptr(r)).collect();

        let mut changed = config.clone();
        changed.sampling.debug_info_rate = 0.1;
        pipeline.reload(&changed, false).await.unwrap();

        let after: Vec<_> = pipeline.sinks.read().iter().map(|r| Arc::as_ptr(r)).collect();
        assert_eq!(before, after, "non-critical reload must not touch sink identity");
        assert_eq!(*pipeline.sampling_debug_info_rate.read(), 0.1);
    }

    #[tokio::test]
    async fn reload_with_critical_flag_replaces_sinks() {
        let config = console_only_config();
        let pipeline = Pipeline::new(&config, test_metrics()).unwrap();
        let before: Vec<_> = pipeline.sinks.read().iter().map(|r| Arc::as_ptr(r)).collect();

        let mut changed = config.clone();
        changed.service = "renamed".to_owned();
        pipeline.reload(&changed, true).await.unwrap();

        let after: Vec<_> = pipeline.sinks.read().iter().map(|r| Arc::as_ptr(r)).collect();
        assert_ne!(before, after, "critical reload must rebuild sink runtimes");
        assert_eq!(pipeline.sinks.read().len(), 1);
    }

    #[tokio::test]
    async fn close_all_marks_pipeline_closed_and_drains_sinks() {
        let config = console_only_config();
        let pipeline = Pipeline::new(&config, test_metrics()).unwrap();
        pipeline.emit(LogRecord::new(
            crate::level::Level::Info,
            "hello",
            Default::default(),
            crate::record::LoggerContext::new("svc", "test"),
            crate::record::Source::default(),
        ));

        pipeline.close_all(Duration::from_secs(2)).await;

        assert!(pipeline.is_closed());
        for runtime in pipeline.sinks.read().iter() {
            assert_eq!(runtime.state(), SinkState::Closed);
        }
    }

    #[test]
    fn update_health_state_tracks_breaker_open_and_close() {
        let state = Arc::new(AtomicU8::new(SinkState::Ready as u8));
        update_health_state(&state, BreakerState::Open);
        assert_eq!(load_state(&state), SinkState::Degraded);
        update_health_state(&state, BreakerState::Closed);
        assert_eq!(load_state(&state), SinkState::Ready);
    }

    #[test]
    fn update_health_state_leaves_closing_and_closed_alone() {
        let state = Arc::new(AtomicU8::new(SinkState::Closing as u8));
        update_health_state(&state, BreakerState::Open);
        assert_eq!(load_state(&state), SinkState::Closing);

        let state = Arc::new(AtomicU8::new(SinkState::Closed as u8));
        update_health_state(&state, BreakerState::Open);
        assert_eq!(load_state(&state), SinkState::Closed);
    }

    #[tokio::test]
    async fn per_sink_level_floor_gates_submission() {
        let mut config = console_only_config();
        config.sinks.console.as_mut().unwrap().level = Some("warn".to_owned());
        // `test_metrics()` hands back a process-global, shared-across-tests
        // registry (see `test_utils`'s doc comment), so this only checks the
        // delta this test itself causes rather than an absolute count.
        let metrics = test_metrics();
        let counter = metrics.records_submitted.with_label_values(&["console"]);
        let before = counter.get();
        let pipeline = Pipeline::new(&config, metrics.clone()).unwrap();

        pipeline.emit(LogRecord::new(
            crate::level::Level::Info,
            "below the sink floor",
            Default::default(),
            crate::record::LoggerContext::new("svc", "test"),
            crate::record::Source::default(),
        ));
        pipeline.emit(LogRecord::new(
            crate::level::Level::Error,
            "at the sink floor",
            Default::default(),
            crate::record::LoggerContext::new("svc", "test"),
            crate::record::Source::default(),
        ));

        assert_eq!(counter.get() - before, 1);
    }
}

fn spawn_batch(
    name: String,
    sink: Arc<dyn Sink>,
    config: ConfigDocument,
    breaker: Arc<CircuitBreaker>,
    metrics: PipelineMetrics,
    state: Arc<AtomicU8>,
) -> BatchManager {
    BatchManager::start(
        config.batch.clone(),
        Arc::new(move |batch: Vec<LogRecord>| {
            let sink = sink.clone();
            let retry_config = config.retry.clone();
            let breaker = breaker.clone();
            let metrics = metrics.clone();
            let name = name.clone();
            let state = state.clone();
            Box::pin(async move {
                let manager = RetryManager::new(retry_config, &breaker);
                let result = manager
                    .execute(|| {
                        metrics.records_retried.with_label_values(&[&name]).inc();
                        sink.send(&batch)
                    })
                    .await;
                let breaker_state = breaker.state();
                metrics.record_breaker_state(&name, breaker_state);
                update_health_state(&state, breaker_state);
                if let Err(err) = result {
                    error!(sink = %name, error = %err, "sink send failed, batch was not delivered");
                }
            })
        }),
    )
}
