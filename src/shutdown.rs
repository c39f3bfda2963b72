//! Coordinates graceful shutdown: stop accepting new records, flush and
//! close every sink in order, bounded by a deadline. Mirrors the teacher's
//! general resource-lifecycle discipline (e.g. `work_queue.rs`'s
//! requirement that every job be dequeued before results can be taken) —
//! this coordinator won't consider a sink closed until its queue has
//! drained or the deadline elapses. See `spec.md` §4.J.
use crate::pipeline::Pipeline;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

pub struct ShutdownCoordinator {
    pipeline: Arc<Pipeline>,
    timeout: Duration,
    shutting_down: Arc<AtomicBool>,
}

impl ShutdownCoordinator {
    pub fn new(pipeline: Arc<Pipeline>, timeout: Duration) -> Self {
        ShutdownCoordinator {
            pipeline,
            timeout,
            shutting_down: Arc::new(AtomicBool::new(false)),
        }
    }

    /// `true` once [`shutdown`](Self::shutdown) has been called; a facade
    /// can use this to refuse new submissions ahead of the coordinator
    /// actually tearing sinks down.
    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    /// Stops timers, flushes every sink's batch manager and closes sinks,
    /// waiting up to `shutdownTimeoutMs` for in-flight batches to drain. Any
    /// records still queued once the deadline passes are reported, not
    /// silently discarded.
    pub async fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::Release);
        self.pipeline.close_all(self.timeout).await;
    }

    /// Flushes every sink without closing them — useful for a periodic
    /// checkpoint rather than a full teardown.
    pub async fn flush(&self) {
        self.pipeline.flush_all().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigDocument;
    use crate::test_utils::test_pipeline;

    #[tokio::test]
    async fn shutdown_marks_shutting_down_before_closing() {
        let pipeline = test_pipeline(&ConfigDocument::default());
        let coordinator = ShutdownCoordinator::new(pipeline, Duration::from_millis(100));
        assert!(!coordinator.is_shutting_down());
        coordinator.shutdown().await;
        assert!(coordinator.is_shutting_down());
    }
}
