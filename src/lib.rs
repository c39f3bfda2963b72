//! Structured logging pipeline: async batching, bounded queueing, retry
//! with backoff/jitter, per-sink circuit breakers, and pluggable sinks
//! (console, rotating/compressing file, OTLP-over-HTTP, Redis).

pub mod batch;
pub mod circuit_breaker;
pub mod config;
pub mod error;
pub mod level;
pub mod logger;
pub mod metrics;
pub mod pipeline;
pub mod record;
pub mod retry;
pub mod serializer;
pub mod shutdown;
pub mod sink;
pub mod test_utils;
pub mod value;

pub use config::ConfigDocument;
pub use level::Level;
pub use logger::Logger;
pub use pipeline::Pipeline;
pub use record::{LogRecord, LoggerContext, Source};
pub use shutdown::ShutdownCoordinator;
pub use value::FieldValue;

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] config::ConfigError),
    #[error(transparent)]
    Sink(#[from] sink::SinkError),
    #[error(transparent)]
    Metrics(#[from] metrics::MetricsError),
}

/// Builds a ready-to-use [`Logger`] and its [`ShutdownCoordinator`] from a
/// loaded [`ConfigDocument`]. This is the path an application binary uses;
/// library consumers needing finer control can construct a [`Pipeline`]
/// directly instead.
pub fn build(config: ConfigDocument) -> Result<(Logger, Arc<Pipeline>, ShutdownCoordinator), Error> {
    let metrics = metrics::PipelineMetrics::new()?;
    let pipeline = Pipeline::new(&config, metrics)?;
    let context = LoggerContext::new(config.service.clone(), config.environment.clone());
    let min_level = config.level();
    let logger = Logger::new(pipeline.clone(), context, min_level);
    let shutdown = ShutdownCoordinator::new(
        pipeline.clone(),
        Duration::from_millis(config.shutdown.shutdown_timeout_ms),
    );
    Ok((logger, pipeline, shutdown))
}

pub fn parse_level(input: &str) -> Result<Level, level::LevelParseError> {
    Level::from_str(input)
}
