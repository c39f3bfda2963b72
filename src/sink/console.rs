//! Stdout/stderr sink. Modeled on the teacher's tty-detection in
//! `logging.rs`: pretty/ANSI output for a terminal, JSON otherwise.
use super::{Sink, SinkError};
use crate::level::Level;
use crate::record::LogRecord;
use crate::serializer::{Format, Serializer, SerializerConfig};
use async_trait::async_trait;
use std::io::Write;

#[derive(Debug)]
pub struct ConsoleSink {
    /// Serializer for records routed to stdout (below [`Level::Error`]).
    stdout_serializer: Serializer,
    /// Serializer for records routed to stderr ([`Level::Error`] and up).
    /// Kept separate from `stdout_serializer` since each stream's TTY-ness
    /// is independent: a process can have its stdout piped to a file while
    /// stderr stays attached to a terminal, or vice versa.
    stderr_serializer: Serializer,
}

impl ConsoleSink {
    pub fn new(pretty: bool, colorize: bool) -> Self {
        let format = if pretty { Format::Pretty } else { Format::Json };
        let stdout_colorize = colorize && atty::is(atty::Stream::Stdout);
        let stderr_colorize = colorize && atty::is(atty::Stream::Stderr);
        ConsoleSink {
            stdout_serializer: Serializer::new(SerializerConfig {
                format,
                colorize: stdout_colorize,
                ..SerializerConfig::default()
            }),
            stderr_serializer: Serializer::new(SerializerConfig {
                format,
                colorize: stderr_colorize,
                ..SerializerConfig::default()
            }),
        }
    }
}

#[async_trait]
impl Sink for ConsoleSink {
    async fn send(&self, batch: &[LogRecord]) -> Result<(), SinkError> {
        // Best-effort synchronous writes: console output is not expected to
        // back-pressure the pipeline, so a locked stdout/stderr write is
        // acceptable here even though `send` is async.
        let stdout = std::io::stdout();
        let stderr = std::io::stderr();
        let mut out = stdout.lock();
        let mut err = stderr.lock();

        for record in batch {
            if record.level >= Level::Error {
                let bytes = self.stderr_serializer.serialize(record);
                let _ = err.write_all(&bytes);
                let _ = err.write_all(b"\n");
            } else {
                let bytes = self.stdout_serializer.serialize(record);
                let _ = out.write_all(&bytes);
                let _ = out.write_all(b"\n");
            }
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "console"
    }
}
