//! Test helpers shared by unit tests and the integration suite. Kept as a
//! plain, non-`cfg(test)`-gated module the way the teacher does, so
//! `tests/integration_tests.rs` can pull in the same helpers.
use crate::config::ConfigDocument;
use crate::metrics::PipelineMetrics;
use crate::pipeline::Pipeline;
use once_cell::sync::Lazy;
use std::sync::{Arc, Once};

/// Prometheus registration is process-global: every test in this binary
/// that needs a [`Pipeline`] shares this one [`PipelineMetrics`] instead of
/// each registering its own counters and colliding on the names.
static SHARED_METRICS: Lazy<PipelineMetrics> = Lazy::new(|| PipelineMetrics::new().unwrap());

static TRACING_INIT: Once = Once::new();

/// Installs a `tracing-subscriber` writer scoped to the test harness, the
/// way the teacher's binaries call `tracing_subscriber::fmt().init()` at
/// process start — tests have no such entry point, so each test that wants
/// to see the pipeline's own diagnostic spans/events calls this instead.
/// Safe to call from many tests; only the first call installs a subscriber.
pub fn init_tracing_for_tests() {
    TRACING_INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_test_writer()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    });
}

pub fn test_metrics() -> PipelineMetrics {
    SHARED_METRICS.clone()
}

pub fn test_pipeline(config: &ConfigDocument) -> Arc<Pipeline> {
    init_tracing_for_tests();
    Pipeline::new(config, test_metrics()).expect("failed to build test pipeline")
}
