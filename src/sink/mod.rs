//! Pluggable sink abstraction. The async analogue of the teacher's
//! `Transport` trait (`transport.rs`): one implementation per destination,
//! shared by a common object-safe interface instead of concrete methods per
//! transport. See `spec.md` §4.G.
mod console;
mod file;
mod otlp;
mod redis;

pub use console::ConsoleSink;
pub use file::FileSink;
pub use otlp::OtlpSink;
pub use redis::RedisSink;

use crate::record::LogRecord;
use async_trait::async_trait;
use std::fmt::Debug;

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("io error writing to sink: {0}")]
    Io(#[from] std::io::Error),
    #[error("http error sending to otlp endpoint: {0}")]
    Http(#[from] reqwest::Error),
    #[error("otlp endpoint returned non-retryable status {0}")]
    HttpStatus(reqwest::StatusCode),
    #[error("otlp endpoint returned retryable status {0}")]
    HttpStatusRetryable(reqwest::StatusCode),
    #[error("redis error: {0}")]
    Redis(#[from] ::redis::RedisError),
}

impl crate::error::ErrorClassification for SinkError {
    fn is_retryable(&self) -> bool {
        match self {
            SinkError::Io(_) => true,
            SinkError::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            SinkError::HttpStatus(_) => false,
            SinkError::HttpStatusRetryable(_) => true,
            SinkError::Redis(_) => true,
        }
    }
}

/// A destination a batch of records can be shipped to. Implementations must
/// be `Send + Sync` because a single sink instance is shared across every
/// batch worker task targeting it.
#[async_trait]
pub trait Sink: Debug + Send + Sync {
    /// Ships a batch of already-serialized records. Implementations should
    /// return a [`SinkError`] classified accurately so the Retry Manager can
    /// decide whether to attempt again.
    async fn send(&self, batch: &[LogRecord]) -> Result<(), SinkError>;

    /// Flushes any internal buffering (e.g. an open file handle). Sinks with
    /// no buffering of their own may no-op.
    async fn flush(&self) -> Result<(), SinkError> {
        Ok(())
    }

    /// Releases any held resources. Called once during graceful shutdown
    /// after the last `send` has completed.
    async fn close(&self) -> Result<(), SinkError> {
        Ok(())
    }

    fn name(&self) -> &str;
}
