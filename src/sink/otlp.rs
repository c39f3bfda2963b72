//! OTLP-over-HTTP sink. Modeled on the teacher's `http.rs::RetryingAgent`,
//! ported from sync `ureq` to async `reqwest` since the Batch Manager's
//! non-blocking contract requires an async client (enrichment grounded in
//! the pack's pervasive `reqwest` usage — `quanghuy1242-mpc`,
//! `harborgrid-justin-phantom-spire`).
use super::{Sink, SinkError};
use crate::config::OtlpSinkConfig;
use crate::record::LogRecord;
use crate::serializer::{Format, Serializer, SerializerConfig};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_ENCODING, CONTENT_TYPE};
use std::io::Write;
use std::time::Duration;

const GZIP_THRESHOLD_BYTES: usize = 1024;

#[derive(Debug)]
pub struct OtlpSink {
    client: reqwest::Client,
    config: OtlpSinkConfig,
    serializer: Serializer,
}

impl OtlpSink {
    pub fn new(config: OtlpSinkConfig) -> Result<OtlpSink, SinkError> {
        let mut headers = HeaderMap::new();
        for (key, value) in &config.headers {
            if let (Ok(name), Ok(val)) = (HeaderName::try_from(key.as_str()), HeaderValue::from_str(value)) {
                headers.insert(name, val);
            }
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .default_headers(headers)
            .build()?;
        Ok(OtlpSink {
            client,
            config,
            serializer: Serializer::new(SerializerConfig {
                format: Format::Json,
                ..SerializerConfig::default()
            }),
        })
    }

    /// Renders the batch as a bare JSON array of records, per the resolved
    /// Open Question in `spec.md`/`SPEC_FULL.md` §4.G: the OTLP-HTTP body is
    /// the array directly, not wrapped in a `{"logs": [...]}` envelope.
    fn render_body(&self, batch: &[LogRecord]) -> Vec<u8> {
        let mut out = Vec::with_capacity(batch.len() * 256 + 2);
        out.push(b'[');
        for (i, record) in batch.iter().enumerate() {
            if i > 0 {
                out.push(b',');
            }
            out.extend_from_slice(&self.serializer.serialize(record));
        }
        out.push(b']');
        out
    }
}

#[async_trait]
impl Sink for OtlpSink {
    async fn send(&self, batch: &[LogRecord]) -> Result<(), SinkError> {
        let body = self.render_body(batch);

        let mut request = self.client.post(&self.config.endpoint).header(CONTENT_TYPE, "application/json");

        let payload = if self.config.gzip && body.len() > GZIP_THRESHOLD_BYTES {
            request = request.header(CONTENT_ENCODING, "gzip");
            gzip(&body)
        } else {
            body
        };

        let response = request.body(payload).send().await?;
        let status = response.status();

        if status.is_success() {
            return Ok(());
        }

        if status.as_u16() == 429 {
            if let Some(retry_after) = parse_retry_after(response.headers()) {
                tokio::time::sleep(retry_after).await;
            }
            return Err(SinkError::HttpStatusRetryable(status));
        }

        if status.as_u16() == 408 || status.is_server_error() {
            return Err(SinkError::HttpStatusRetryable(status));
        }

        Err(SinkError::HttpStatus(status))
    }

    fn name(&self) -> &str {
        "otlp"
    }
}

fn gzip(data: &[u8]) -> Vec<u8> {
    use flate2::write::GzEncoder;
    use flate2::Compression;

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    let _ = encoder.write_all(data);
    encoder.finish().unwrap_or_default()
}

fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    let value = headers.get(reqwest::header::RETRY_AFTER)?.to_str().ok()?;
    if let Ok(seconds) = value.parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }
    let at = chrono::DateTime::parse_from_rfc2822(value).ok()?;
    let delta = at.with_timezone(&chrono::Utc) - chrono::Utc::now();
    delta.to_std().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::level::Level;
    use crate::record::{LoggerContext, Source};
    use indexmap::IndexMap;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

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
    async fn sends_batch_as_json_array() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/logs"))
            .and(header("content-type", "application/json"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let config = OtlpSinkConfig {
            endpoint: format!("{}/v1/logs", server.uri()),
            headers: Vec::new(),
            timeout_ms: 2_000,
            gzip: false,
            ..OtlpSinkConfig::default()
        };
        let sink = OtlpSink::new(config).unwrap();
        sink.send(&[sample_record()]).await.unwrap();
    }

    #[tokio::test]
    async fn classifies_5xx_as_retryable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let config = OtlpSinkConfig {
            endpoint: server.uri(),
            headers: Vec::new(),
            timeout_ms: 2_000,
            gzip: false,
            ..OtlpSinkConfig::default()
        };
        let sink = OtlpSink::new(config).unwrap();
        let err = sink.send(&[sample_record()]).await.unwrap_err();
        assert!(matches!(err, SinkError::HttpStatusRetryable(_)));
    }

    #[tokio::test]
    async fn classifies_4xx_as_non_retryable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400))
            .mount(&server)
            .await;

        let config = OtlpSinkConfig {
            endpoint: server.uri(),
            headers: Vec::new(),
            timeout_ms: 2_000,
            gzip: false,
            ..OtlpSinkConfig::default()
        };
        let sink = OtlpSink::new(config).unwrap();
        let err = sink.send(&[sample_record()]).await.unwrap_err();
        assert!(matches!(err, SinkError::HttpStatus(_)));
    }
}
