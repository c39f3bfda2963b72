//! Environment-variable overlay, applied after the file layer and before
//! validation. Follows the teacher's convention of plain `std::env::var`
//! lookups rather than a derive-macro env loader. A present-but-malformed
//! variable fails config load rather than silently falling back to the
//! prior value — `spec.md` §6 treats this layer the same as the file layer:
//! invalid input fails loading, it doesn't get ignored.
use super::{ConfigDocument, ConfigError};
use std::env;

const PREFIX: &str = "LOGFLOW_";

pub fn apply_env_overrides(doc: &mut ConfigDocument) -> Result<(), ConfigError> {
    if let Some(v) = var("LEVEL") {
        doc.level = v;
    }
    if let Some(v) = var("SERVICE") {
        doc.service = v;
    }
    if let Some(v) = var("ENVIRONMENT") {
        doc.environment = v;
    }
    if let Some(v) = var_f64("SAMPLING_DEBUG_INFO_RATE")? {
        doc.sampling.debug_info_rate = v;
    }
    if let Some(v) = var_usize("BATCH_MAX_SIZE")? {
        doc.batch.max_size = v;
    }
    if let Some(v) = var_usize("BATCH_MAX_QUEUE_SIZE")? {
        doc.batch.max_queue_size = v;
    }
    if let Some(v) = var_u64("BATCH_TIMEOUT_MS")? {
        doc.batch.timeout_ms = v;
    }
    if let Some(v) = var_u32("RETRY_MAX_ATTEMPTS")? {
        doc.retry.max_attempts = v;
    }
    if let Some(v) = var("SINKS_OTLP_ENDPOINT") {
        doc.sinks.otlp.get_or_insert_with(Default::default).endpoint = v;
    }
    if let Some(v) = var("SINKS_REDIS_URL") {
        doc.sinks.redis.get_or_insert_with(Default::default).url = v;
    }
    if let Some(v) = var_bool("METRICS_ENABLED")? {
        doc.metrics.enabled = v;
    }
    Ok(())
}

fn var(name: &str) -> Option<String> {
    env::var(format!("{}{}", PREFIX, name)).ok()
}

fn invalid(name: &str, raw: &str, expected: &str) -> ConfigError {
    ConfigError::Validation {
        field: format!("{}{}", PREFIX, name),
        message: format!("invalid value `{}`, expected {}", raw, expected),
    }
}

/// Parses a boolean the way `spec.md` §6 requires: `true|false|1|0|yes|no`,
/// case-insensitively. A set-but-unrecognized value is an error, not a
/// silent fallback to the default.
fn var_bool(name: &str) -> Result<Option<bool>, ConfigError> {
    match var(name) {
        None => Ok(None),
        Some(raw) => match raw.to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" => Ok(Some(true)),
            "false" | "0" | "no" => Ok(Some(false)),
            _ => Err(invalid(name, &raw, "one of true|false|1|0|yes|no")),
        },
    }
}

fn var_u32(name: &str) -> Result<Option<u32>, ConfigError> {
    match var(name) {
        None => Ok(None),
        Some(raw) => raw
            .parse()
            .map(Some)
            .map_err(|_| invalid(name, &raw, "an unsigned 32-bit integer")),
    }
}

fn var_u64(name: &str) -> Result<Option<u64>, ConfigError> {
    match var(name) {
        None => Ok(None),
        Some(raw) => raw
            .parse()
            .map(Some)
            .map_err(|_| invalid(name, &raw, "an unsigned 64-bit integer")),
    }
}

fn var_usize(name: &str) -> Result<Option<usize>, ConfigError> {
    match var(name) {
        None => Ok(None),
        Some(raw) => raw
            .parse()
            .map(Some)
            .map_err(|_| invalid(name, &raw, "an unsigned integer")),
    }
}

fn var_f64(name: &str) -> Result<Option<f64>, ConfigError> {
    match var(name) {
        None => Ok(None),
        Some(raw) => raw
            .parse()
            .map(Some)
            .map_err(|_| invalid(name, &raw, "a floating-point number")),
    }
}
