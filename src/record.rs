//! Log record and context model. See `spec.md` §3, §4.A.
use crate::level::Level;
use crate::value::FieldValue;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;

/// Identity of the logger that produced a record.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Source {
    pub module: String,
    pub file: Option<String>,
    pub line: Option<u32>,
}

/// Append-only context that child loggers inherit. Deriving a child merges
/// parent context with an override map (last-writer-wins per key); the
/// child never mutates the parent. See `spec.md` §4.A.
#[derive(Clone, Debug, Default)]
pub struct LoggerContext {
    slots: IndexMap<String, FieldValue>,
}

/// The well-known top-level context slots spec.md calls out for shallow
/// merge semantics; all other keys are ordinary user fields.
pub const CONTEXT_SLOTS: &[&str] = &["service", "environment", "version", "request", "user", "trace"];

impl LoggerContext {
    pub fn new(service: impl Into<String>, environment: impl Into<String>) -> Self {
        let mut slots = IndexMap::new();
        slots.insert("service".to_owned(), FieldValue::str(service.into()));
        slots.insert("environment".to_owned(), FieldValue::str(environment.into()));
        LoggerContext { slots }
    }

    pub fn get(&self, key: &str) -> Option<&FieldValue> {
        self.slots.get(key)
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<FieldValue>) {
        self.slots.insert(key.into(), value.into());
    }

    pub fn service(&self) -> Option<&str> {
        match self.slots.get("service") {
            Some(FieldValue::Str(s)) => Some(s),
            _ => None,
        }
    }

    pub fn environment(&self) -> Option<&str> {
        match self.slots.get("environment") {
            Some(FieldValue::Str(s)) => Some(s),
            _ => None,
        }
    }

    /// Merges `overrides` onto `self`, returning a new context. Arrays are
    /// replaced wholesale, never concatenated; nested maps merge shallowly
    /// only for the well-known top-level slots in [`CONTEXT_SLOTS`] — any
    /// other key is simply overwritten.
    pub fn with_overrides(&self, overrides: &IndexMap<String, FieldValue>) -> LoggerContext {
        let mut merged = self.slots.clone();
        for (key, value) in overrides {
            if CONTEXT_SLOTS.contains(&key.as_str()) {
                match (merged.get(key.as_str()), value) {
                    (Some(FieldValue::Map(existing)), FieldValue::Map(incoming)) => {
                        let mut combined = existing.clone();
                        for (k, v) in incoming {
                            combined.insert(k.clone(), v.clone());
                        }
                        merged.insert(key.clone(), FieldValue::Map(combined));
                        continue;
                    }
                    _ => {}
                }
            }
            merged.insert(key.clone(), value.clone());
        }
        LoggerContext { slots: merged }
    }

    pub fn as_map(&self) -> &IndexMap<String, FieldValue> {
        &self.slots
    }
}

/// An immutable log record, built by [`crate::logger::Logger`] once per emit
/// call. `timestamp` is monotonic-non-decreasing per logger instance; see
/// `spec.md` §3 invariants.
#[derive(Clone, Debug)]
pub struct LogRecord {
    pub timestamp: DateTime<Utc>,
    pub level: Level,
    pub message: String,
    pub fields: IndexMap<String, FieldValue>,
    pub context: LoggerContext,
    pub source: Source,
}

impl LogRecord {
    pub fn new(
        level: Level,
        message: impl Into<String>,
        fields: IndexMap<String, FieldValue>,
        context: LoggerContext,
        source: Source,
    ) -> Self {
        LogRecord {
            timestamp: Utc::now(),
            level,
            message: message.into(),
            fields,
            context,
            source,
        }
    }
}
