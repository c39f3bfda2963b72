//! Turns a [`LogRecord`] into bytes for a sink. Two output forms (JSON,
//! pretty/ANSI text), cycle detection, sensitive-field masking and
//! size-bounded truncation all live here. See `spec.md` §4.B.
use crate::record::LogRecord;
use crate::value::FieldValue;
use indexmap::IndexMap;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashSet;

/// Default cap on a single serialized record, past which the largest field
/// is recursively truncated. See `spec.md` §4.B.
pub const DEFAULT_MAX_SERIALIZED_BYTES: usize = 64 * 1024;

/// Output shape a sink asks the serializer for.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Format {
    Json,
    Pretty,
}

#[derive(Clone, Debug)]
pub struct SerializerConfig {
    pub format: Format,
    pub max_bytes: usize,
    /// Case-insensitive field-name patterns whose values get replaced with
    /// `"***REDACTED***"` rather than serialized.
    pub mask_patterns: Vec<String>,
    /// Whether [`Format::Pretty`] may emit ANSI color codes. Ignored for
    /// [`Format::Json`]. See `spec.md` §4.G.
    pub colorize: bool,
}

impl Default for SerializerConfig {
    fn default() -> Self {
        SerializerConfig {
            format: Format::Json,
            max_bytes: DEFAULT_MAX_SERIALIZED_BYTES,
            mask_patterns: DEFAULT_MASK_PATTERNS.iter().map(|s| s.to_string()).collect(),
            colorize: true,
        }
    }
}

const DEFAULT_MASK_PATTERNS: &[&str] = &[
    "password", "token", "secret", "apikey", "authorization", "cookie", "ssn", "creditcard", "cvv",
];

static MASK_REGEX_CACHE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"password|token|secret|apikey|authorization|cookie|ssn|creditcard|cvv").unwrap()
});

const REDACTED: &str = "***REDACTED***";

pub struct Serializer {
    config: SerializerConfig,
    mask_regex: Regex,
}

impl Serializer {
    pub fn new(config: SerializerConfig) -> Self {
        let mask_regex = if config.mask_patterns
            == DEFAULT_MASK_PATTERNS.iter().map(|s| s.to_string()).collect::<Vec<_>>()
        {
            MASK_REGEX_CACHE.clone()
        } else {
            let pattern = config.mask_patterns.join("|");
            Regex::new(&format!("(?i){}", pattern)).unwrap_or_else(|_| MASK_REGEX_CACHE.clone())
        };
        Serializer { config, mask_regex }
    }

    fn is_masked_key(&self, key: &str) -> bool {
        self.mask_regex.is_match(&key.to_ascii_lowercase())
    }

    /// Serializes a record to bytes. Never returns an `Err` the caller must
    /// handle: if anything goes wrong the failure is instead encoded as a
    /// `"[SerializeError:reason]"` fallback envelope, per spec.md §4.B.
    pub fn serialize(&self, record: &LogRecord) -> Vec<u8> {
        match self.try_serialize(record) {
            Ok(bytes) => bytes,
            Err(reason) => fallback_envelope(record, &reason).into_bytes(),
        }
    }

    fn try_serialize(&self, record: &LogRecord) -> Result<Vec<u8>, String> {
        let mut visited = HashSet::new();
        let fields = self.render_map(&record.fields, &mut visited);
        let context = self.render_map(record.context.as_map(), &mut visited);

        let envelope = serde_json::json!({
            "timestamp": record.timestamp.to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            "level": record.level.as_str(),
            "message": record.message,
            "fields": fields.clone(),
            "context": context.clone(),
            "source": {
                "module": record.source.module,
                "file": record.source.file,
                "line": record.source.line,
            },
        });

        let bytes = match self.config.format {
            Format::Json => serde_json::to_vec(&envelope).map_err(|e| e.to_string())?,
            Format::Pretty => render_pretty(record, &envelope, self.config.colorize).into_bytes(),
        };

        if bytes.len() > self.config.max_bytes {
            Ok(self.truncate(record, fields, context, bytes.len()))
        } else {
            Ok(bytes)
        }
    }

    fn render_map(
        &self,
        map: &IndexMap<String, FieldValue>,
        visited: &mut HashSet<usize>,
    ) -> serde_json::Value {
        let mut out = serde_json::Map::new();
        for (key, value) in map {
            let rendered = if self.is_masked_key(key) {
                serde_json::Value::String(REDACTED.to_owned())
            } else {
                self.render_value(value, visited)
            };
            out.insert(key.clone(), rendered);
        }
        serde_json::Value::Object(out)
    }

    fn render_value(&self, value: &FieldValue, visited: &mut HashSet<usize>) -> serde_json::Value {
        match value {
            FieldValue::Null => serde_json::Value::Null,
            FieldValue::Bool(b) => serde_json::Value::Bool(*b),
            FieldValue::Int(i) => serde_json::Value::from(*i),
            FieldValue::Float(f) => serde_json::Value::from(*f),
            FieldValue::Str(s) => serde_json::Value::String(s.clone()),
            FieldValue::Array(items) => {
                serde_json::Value::Array(items.iter().map(|v| self.render_value(v, visited)).collect())
            }
            FieldValue::Map(map) => self.render_map(map, visited),
            FieldValue::Shared(inner) => {
                let ptr = value.shared_ptr().expect("Shared variant always has a pointer");
                if !visited.insert(ptr) {
                    return serde_json::Value::String("[Circular]".to_owned());
                }
                let rendered = self.render_value(inner, visited);
                visited.remove(&ptr);
                rendered
            }
        }
    }

    /// Repeatedly replaces the single largest field with a `[Truncated:N]`
    /// marker (`N` the byte length of the value it replaced), re-measuring
    /// after each pass, until the envelope fits `max_bytes`. Once every
    /// field has been marked, falls back to shrinking `message`, and if the
    /// envelope still doesn't fit, drops to [`Self::minimal_envelope`] —
    /// which is sized to always fit — so the result never exceeds the cap.
    fn truncate(
        &self,
        record: &LogRecord,
        fields: serde_json::Value,
        context: serde_json::Value,
        original_len: usize,
    ) -> Vec<u8> {
        let mut fields = match fields {
            serde_json::Value::Object(map) => map,
            _ => serde_json::Map::new(),
        };
        let mut message = record.message.clone();
        let mut already_truncated: HashSet<String> = HashSet::new();

        for _ in 0..MAX_TRUNCATION_PASSES {
            let envelope = build_envelope(record, &fields, &context, &message);
            match serde_json::to_vec(&envelope) {
                Ok(bytes) if bytes.len() <= self.config.max_bytes => return bytes,
                Ok(_) => {}
                Err(_) => return fallback_envelope(record, "truncation failed").into_bytes(),
            }

            if let Some(key) = largest_untouched_field(&fields, &already_truncated) {
                let dropped = fields
                    .get(&key)
                    .map(|v| v.to_string().len())
                    .unwrap_or(0);
                fields.insert(key.clone(), serde_json::Value::String(format!("[Truncated:{}]", dropped)));
                already_truncated.insert(key);
            } else if !message.is_empty() {
                // Every field is already marked and the envelope still
                // doesn't fit; dropping `message` outright is the last thing
                // left to try before falling back to `minimal_envelope`.
                message.clear();
            } else {
                break;
            }
        }

        self.minimal_envelope(record, original_len)
    }

    /// Last-resort envelope: keeps only `timestamp`, `level` and a
    /// `[Truncated:N]` message, guaranteed to fit any sane `max_bytes` —
    /// used when per-field truncation alone can't bring the envelope under
    /// the cap (e.g. a single oversized field dwarfing a tight budget).
    fn minimal_envelope(&self, record: &LogRecord, original_len: usize) -> Vec<u8> {
        let envelope = serde_json::json!({
            "timestamp": record.timestamp.to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            "level": record.level.as_str(),
            "message": format!("[Truncated:{}]", original_len),
        });
        serde_json::to_vec(&envelope).unwrap_or_else(|_| {
            fallback_envelope(record, "truncation failed").into_bytes()
        })
    }
}

/// Passes after which [`Serializer::truncate`] gives up on field-by-field
/// shrinking and falls back to [`Serializer::minimal_envelope`].
const MAX_TRUNCATION_PASSES: usize = 32;

fn build_envelope(
    record: &LogRecord,
    fields: &serde_json::Map<String, serde_json::Value>,
    context: &serde_json::Value,
    message: &str,
) -> serde_json::Value {
    serde_json::json!({
        "timestamp": record.timestamp.to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
        "level": record.level.as_str(),
        "message": message,
        "fields": fields,
        "context": context,
        "source": {
            "module": record.source.module,
            "file": record.source.file,
            "line": record.source.line,
        },
    })
}

fn largest_untouched_field(
    fields: &serde_json::Map<String, serde_json::Value>,
    already_truncated: &HashSet<String>,
) -> Option<String> {
    fields
        .iter()
        .filter(|(key, _)| !already_truncated.contains(*key))
        .max_by_key(|(_, value)| value.to_string().len())
        .map(|(key, _)| key.clone())
}

fn render_pretty(record: &LogRecord, envelope: &serde_json::Value, colorize: bool) -> String {
    let (color, reset) = if colorize {
        let color = match record.level {
            crate::level::Level::Debug => "\x1b[90m",
            crate::level::Level::Info => "\x1b[32m",
            crate::level::Level::Warn => "\x1b[33m",
            crate::level::Level::Error => "\x1b[31m",
            crate::level::Level::Fatal => "\x1b[35m",
        };
        (color, "\x1b[0m")
    } else {
        ("", "")
    };
    let fields = envelope
        .get("fields")
        .map(|f| f.to_string())
        .unwrap_or_default();
    format!(
        "{}[{}] {}{} {} {}",
        color,
        record.level.as_str().to_uppercase(),
        reset,
        record.timestamp.to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
        record.message,
        fields
    )
}

fn fallback_envelope(record: &LogRecord, reason: &str) -> String {
    format!(
        "{{\"timestamp\":\"{}\",\"level\":\"{}\",\"message\":\"[SerializeError:{}]\"}}",
        record.timestamp.to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
        record.level.as_str(),
        reason.replace('"', "'"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::level::Level;
    use crate::record::{LoggerContext, Source};
    use std::sync::Arc;

    fn record_with_fields(fields: IndexMap<String, FieldValue>) -> LogRecord {
        LogRecord::new(
            Level::Info,
            "hello",
            fields,
            LoggerContext::new("svc", "test"),
            Source {
                module: "test".to_owned(),
                file: None,
                line: None,
            },
        )
    }

    #[test]
    fn masks_sensitive_fields_case_insensitively() {
        let serializer = Serializer::new(SerializerConfig::default());
        let mut fields = IndexMap::new();
        fields.insert("Password".to_owned(), FieldValue::str("hunter2"));
        let record = record_with_fields(fields);
        let out = String::from_utf8(serializer.serialize(&record)).unwrap();
        assert!(out.contains(REDACTED));
        assert!(!out.contains("hunter2"));
    }

    #[test]
    fn detects_cycles_via_shared_pointer_identity() {
        let serializer = Serializer::new(SerializerConfig::default());
        let mut inner_map = IndexMap::new();
        inner_map.insert("leaf".to_owned(), FieldValue::str("v"));
        let shared = Arc::new(FieldValue::Map(inner_map));

        let mut fields = IndexMap::new();
        fields.insert("a".to_owned(), FieldValue::Shared(shared.clone()));
        fields.insert("b".to_owned(), FieldValue::Shared(shared));
        let record = record_with_fields(fields);

        let out = String::from_utf8(serializer.serialize(&record)).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&out).unwrap();
        assert_eq!(parsed["fields"]["a"]["leaf"], "v");
        assert_eq!(parsed["fields"]["b"]["leaf"], "v");
    }

    #[test]
    fn pretty_format_omits_ansi_codes_when_colorize_is_off() {
        let config = SerializerConfig {
            format: Format::Pretty,
            colorize: false,
            ..SerializerConfig::default()
        };
        let serializer = Serializer::new(config);
        let record = record_with_fields(IndexMap::new());
        let out = String::from_utf8(serializer.serialize(&record)).unwrap();
        assert!(!out.contains('\x1b'));
    }

    #[test]
    fn pretty_format_includes_ansi_codes_when_colorize_is_on() {
        let config = SerializerConfig {
            format: Format::Pretty,
            colorize: true,
            ..SerializerConfig::default()
        };
        let serializer = Serializer::new(config);
        let record = record_with_fields(IndexMap::new());
        let out = String::from_utf8(serializer.serialize(&record)).unwrap();
        assert!(out.contains('\x1b'));
    }

    #[test]
    fn truncates_oversized_records() {
        let config = SerializerConfig {
            max_bytes: 128,
            ..SerializerConfig::default()
        };
        let serializer = Serializer::new(config);
        let mut fields = IndexMap::new();
        fields.insert("big".to_owned(), FieldValue::str("x".repeat(10_000)));
        let record = record_with_fields(fields);
        let bytes = serializer.serialize(&record);
        assert!(bytes.len() <= 128);
        let out = String::from_utf8(bytes).unwrap();
        assert!(out.contains("Truncated"));
    }

    #[test]
    fn truncation_marks_only_the_oversized_field_when_budget_allows() {
        let config = SerializerConfig {
            max_bytes: 512,
            ..SerializerConfig::default()
        };
        let serializer = Serializer::new(config);
        let mut fields = IndexMap::new();
        fields.insert("small".to_owned(), FieldValue::str("ok"));
        fields.insert("big".to_owned(), FieldValue::str("x".repeat(5_000)));
        let record = record_with_fields(fields);
        let bytes = serializer.serialize(&record);
        assert!(bytes.len() <= 512);
        let parsed: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(parsed["fields"]["small"], "ok");
        assert!(parsed["fields"]["big"].as_str().unwrap().contains("Truncated"));
    }

    #[test]
    fn never_panics_and_always_produces_bytes() {
        let serializer = Serializer::new(SerializerConfig::default());
        let record = record_with_fields(IndexMap::new());
        let out = serializer.serialize(&record);
        assert!(!out.is_empty());
    }
}
