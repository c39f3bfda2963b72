//! Logger facade: the type application code actually calls. `withContext`
//! mirrors the teacher's `Logger::new(o!(...))` child-derivation idiom from
//! `slog`, adapted to this crate's own [`LoggerContext`]. See `spec.md`
//! §4.I.
use crate::error::ShutdownError;
use crate::level::Level;
use crate::pipeline::Pipeline;
use crate::record::{LogRecord, LoggerContext, Source};
use crate::value::FieldValue;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// A handle to a submitted record. The pipeline's own submission is
/// non-blocking (bounded by the per-sink queue, not by any I/O), so this is
/// a lightweight marker rather than a future to await — callers who need to
/// know a batch has actually left the process should call
/// [`Logger::flush`] instead. `rejected` is set when the record never
/// reached a sink queue: either the level was below the logger's minimum
/// (`rejected` stays `None`, `accepted` is `false`), or the logger had
/// already been closed (`rejected` carries [`ShutdownError`]), the only
/// caller-visible failure per `spec.md` §7.
#[derive(Debug)]
pub struct Submission {
    pub accepted: bool,
    pub rejected: Option<ShutdownError>,
}

/// Facade used by application code. Cheap to clone; every clone shares the
/// same underlying [`Pipeline`].
#[derive(Clone)]
pub struct Logger {
    pipeline: Arc<Pipeline>,
    context: LoggerContext,
    min_level: Level,
    source: Source,
    /// Nanoseconds-since-epoch of the latest timestamp this logger (or any
    /// logger derived from it via [`with_context`](Self::with_context)) has
    /// emitted, enforcing the `timestamp` monotonic-non-decreasing invariant
    /// documented on [`LogRecord`]. Shared across clones and derived
    /// loggers, never reset on a per-call basis.
    last_timestamp_nanos: Arc<AtomicI64>,
}

impl Logger {
    pub fn new(pipeline: Arc<Pipeline>, context: LoggerContext, min_level: Level) -> Self {
        Logger {
            pipeline,
            context,
            min_level,
            source: Source::default(),
            last_timestamp_nanos: Arc::new(AtomicI64::new(i64::MIN)),
        }
    }

    /// Returns a child logger whose context is `self`'s context merged with
    /// `overrides` (last-writer-wins per key; see [`LoggerContext::with_overrides`]).
    /// Shares `self`'s monotonic-timestamp clock rather than starting a new
    /// one, since the invariant is per logical logger instance, not per
    /// context derivation.
    pub fn with_context(&self, overrides: IndexMap<String, FieldValue>) -> Logger {
        Logger {
            pipeline: self.pipeline.clone(),
            context: self.context.with_overrides(&overrides),
            min_level: self.min_level,
            source: self.source.clone(),
            last_timestamp_nanos: self.last_timestamp_nanos.clone(),
        }
    }

    pub fn set_request_id(&self, request_id: impl Into<String>) -> Logger {
        let mut overrides = IndexMap::new();
        overrides.insert("requestId".to_owned(), FieldValue::str(request_id.into()));
        self.with_context(overrides)
    }

    pub fn set_correlation_id(&self, correlation_id: impl Into<String>) -> Logger {
        let mut overrides = IndexMap::new();
        overrides.insert("correlationId".to_owned(), FieldValue::str(correlation_id.into()));
        self.with_context(overrides)
    }

    #[track_caller]
    pub fn debug(&self, message: impl Into<String>, fields: IndexMap<String, FieldValue>) -> Submission {
        self.emit(Level::Debug, message, fields)
    }

    #[track_caller]
    pub fn info(&self, message: impl Into<String>, fields: IndexMap<String, FieldValue>) -> Submission {
        self.emit(Level::Info, message, fields)
    }

    #[track_caller]
    pub fn warn(&self, message: impl Into<String>, fields: IndexMap<String, FieldValue>) -> Submission {
        self.emit(Level::Warn, message, fields)
    }

    #[track_caller]
    pub fn error(&self, message: impl Into<String>, fields: IndexMap<String, FieldValue>) -> Submission {
        self.emit(Level::Error, message, fields)
    }

    #[track_caller]
    pub fn fatal(&self, message: impl Into<String>, fields: IndexMap<String, FieldValue>) -> Submission {
        self.emit(Level::Fatal, message, fields)
    }

    /// `#[track_caller]` propagates through to here from whichever public
    /// method the application called, so `Location::caller()` reports the
    /// application's own call site rather than this function. The Rust
    /// module path of that call site isn't cheaply recoverable at runtime
    /// (unlike file/line), so `source.module` stays whatever was set on this
    /// `Logger` at construction. See `spec.md` §3 "source".
    #[track_caller]
    fn emit(&self, level: Level, message: impl Into<String>, fields: IndexMap<String, FieldValue>) -> Submission {
        if self.pipeline.is_closed() {
            return Submission { accepted: false, rejected: Some(ShutdownError) };
        }
        if level < self.min_level {
            return Submission { accepted: false, rejected: None };
        }
        let location = std::panic::Location::caller();
        let source = Source {
            file: Some(location.file().to_owned()),
            line: Some(location.line()),
            ..self.source.clone()
        };
        let mut record = LogRecord::new(level, message, fields, self.context.clone(), source);
        record.timestamp = self.clamp_timestamp(record.timestamp);
        self.pipeline.emit(record);
        Submission { accepted: true, rejected: None }
    }

    /// Enforces `timestamp` is never earlier than the last one this logger
    /// emitted, clamping it forward on a backward system-clock step rather
    /// than letting it decrease.
    fn clamp_timestamp(&self, timestamp: DateTime<Utc>) -> DateTime<Utc> {
        let nanos = timestamp.timestamp_nanos_opt().unwrap_or(i64::MIN);
        let last = self.last_timestamp_nanos.fetch_max(nanos, Ordering::AcqRel).max(nanos);
        if last == nanos {
            timestamp
        } else {
            DateTime::from_timestamp(last / 1_000_000_000, (last.rem_euclid(1_000_000_000)) as u32)
                .unwrap_or(timestamp)
        }
    }

    /// Force-flushes every sink's in-flight batches; submissions may resume
    /// once this returns. See `spec.md` §4.J.
    pub async fn flush(&self) {
        self.pipeline.flush_all().await;
    }

    /// Refuses further submissions, flushes and closes every sink in
    /// dependency order, bounded by `deadline`. Equivalent to (and shares
    /// state with) [`crate::shutdown::ShutdownCoordinator::shutdown`]; either
    /// can be used to tear a [`Logger`]'s pipeline down. See `spec.md` §4.J.
    pub async fn close(&self, deadline: Duration) {
        self.pipeline.close_all(deadline).await;
    }
}
