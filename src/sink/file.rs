//! Rotating, optionally-compressed file sink. Single-writer discipline is
//! modeled on the teacher's `transport/local.rs::LocalFileTransport`
//! (directory creation on first write, a dedicated `FileError` enum);
//! rotation and gzip compression are new behavior, backgrounded onto
//! `tokio::task::spawn_blocking` the way `transport/s3.rs` isolates slow
//! blocking calls from the async reactor.
use super::{Sink, SinkError};
use crate::config::FileSinkConfig;
use crate::record::LogRecord;
use crate::serializer::{Serializer, SerializerConfig};
use async_trait::async_trait;
use chrono::Utc;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{error, warn};

#[derive(Debug, thiserror::Error)]
pub enum FileError {
    #[error("creating parent directories {1}: {0}")]
    Mkdirp(std::io::Error, String),
    #[error("opening {1}: {0}")]
    Open(std::io::Error, String),
    #[error("rotating {1}: {0}")]
    Rotate(std::io::Error, String),
}

impl From<FileError> for SinkError {
    fn from(err: FileError) -> Self {
        SinkError::Io(std::io::Error::new(std::io::ErrorKind::Other, err.to_string()))
    }
}

struct OpenFile {
    file: File,
    bytes_written: u64,
    opened_at: chrono::DateTime<Utc>,
}

pub struct FileSink {
    path: PathBuf,
    config: FileSinkConfig,
    serializer: Serializer,
    state: Mutex<OpenFile>,
}

impl std::fmt::Debug for FileSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileSink").field("path", &self.path).finish()
    }
}

impl FileSink {
    pub fn new(config: FileSinkConfig) -> Result<FileSink, FileError> {
        let path = PathBuf::from(&config.path);
        let file = open_for_append(&path)?;
        let bytes_written = file.metadata().map(|m| m.len()).unwrap_or(0);
        Ok(FileSink {
            path,
            config,
            serializer: Serializer::new(SerializerConfig::default()),
            state: Mutex::new(OpenFile {
                file,
                bytes_written,
                opened_at: Utc::now(),
            }),
        })
    }

    fn should_rotate(&self, state: &OpenFile) -> bool {
        if state.bytes_written >= self.config.max_size_bytes {
            return true;
        }
        match self.config.rotation_interval.as_deref() {
            Some("hourly") => Utc::now().signed_duration_since(state.opened_at).num_hours() >= 1,
            Some("daily") => Utc::now().signed_duration_since(state.opened_at).num_days() >= 1,
            _ => false,
        }
    }

    async fn rotate(&self, state: &mut OpenFile) -> Result<(), FileError> {
        let rotated_name = format!(
            "{}.{}",
            self.path.display(),
            Utc::now().format("%Y%m%dT%H%M%S%.3fZ")
        );
        let rotated_path = unique_rotated_path(&rotated_name);

        state.file.flush().map_err(|e| FileError::Rotate(e, rotated_path.display().to_string()))?;
        fs::rename(&self.path, &rotated_path)
            .map_err(|e| FileError::Rotate(e, rotated_path.display().to_string()))?;

        if self.config.compress {
            let to_compress = rotated_path.clone();
            let display = rotated_path.display().to_string();
            // Fired and forgotten, like the retention sweep below: gzip runs
            // well after the rotation that unblocked this writer, so nothing
            // here should make later `send` calls wait on it.
            tokio::task::spawn_blocking(move || {
                if let Err(err) = compress_in_place(&to_compress) {
                    error!(file = display, error = %err, "background compression of rotated log failed");
                }
            });
        }

        let new_file = open_for_append(&self.path)?;
        state.file = new_file;
        state.bytes_written = 0;
        state.opened_at = Utc::now();

        let retention_days = self.config.retention_days;
        let max_files = self.config.max_files;
        let directory = self.path.parent().map(Path::to_path_buf);
        let stem = self.path.clone();
        tokio::task::spawn_blocking(move || {
            apply_retention(&stem, directory.as_deref(), retention_days, max_files)
        });

        Ok(())
    }
}

fn open_for_append(path: &Path) -> Result<File, FileError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(|e| FileError::Mkdirp(e, parent.display().to_string()))?;
        }
    }
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| FileError::Open(e, path.display().to_string()))
}

fn unique_rotated_path(base: &str) -> PathBuf {
    let mut candidate = PathBuf::from(base);
    let mut counter = 1;
    while candidate.exists() {
        candidate = PathBuf::from(format!("{}.{}", base, counter));
        counter += 1;
    }
    candidate
}

fn compress_in_place(path: &Path) -> std::io::Result<()> {
    use flate2::write::GzEncoder;
    use flate2::Compression;

    let gz_path = path.with_extension(match path.extension() {
        Some(ext) => format!("{}.gz", ext.to_string_lossy()),
        None => "gz".to_owned(),
    });
    let input = fs::read(path)?;
    let gz_file = File::create(&gz_path)?;
    let mut encoder = GzEncoder::new(gz_file, Compression::default());
    encoder.write_all(&input)?;
    encoder.finish()?;
    fs::remove_file(path)?;
    Ok(())
}

fn apply_retention(stem: &Path, directory: Option<&Path>, retention_days: u32, max_files: Option<u32>) {
    let Some(directory) = directory.filter(|d| !d.as_os_str().is_empty()) else {
        return;
    };
    let Some(stem_name) = stem.file_name().and_then(|n| n.to_str()) else {
        return;
    };
    let Ok(entries) = fs::read_dir(directory) else {
        return;
    };
    let cutoff = Utc::now() - chrono::Duration::days(retention_days as i64);

    let mut rotated = Vec::new();
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(name) = name.to_str().map(str::to_owned) else { continue };
        if !name.starts_with(stem_name) || name == stem_name {
            continue;
        }
        let Ok(metadata) = entry.metadata() else { continue };
        let Ok(modified) = metadata.modified() else { continue };
        let modified: chrono::DateTime<Utc> = modified.into();
        if modified < cutoff {
            let _ = fs::remove_file(entry.path());
            continue;
        }
        rotated.push((entry.path(), modified, name));
    }

    // Count-based cap applies after the age cutoff has already pruned what
    // it's going to prune: oldest-first until at most `max_files` remain.
    // `spec.md` §4.C `maxFiles`.
    if let Some(max_files) = max_files {
        let max_files = max_files as usize;
        if rotated.len() > max_files {
            rotated.sort_by_key(|(_, modified, _)| *modified);
            let overflow = rotated.len() - max_files;
            for (path, _, name) in rotated.into_iter().take(overflow) {
                let _ = fs::remove_file(&path);
                warn!(file = name, "removed rotated log file past max_files cap");
            }
        }
    }
}

#[async_trait]
impl Sink for FileSink {
    async fn send(&self, batch: &[LogRecord]) -> Result<(), SinkError> {
        let mut state = self.state.lock().await;
        for record in batch {
            let bytes = self.serializer.serialize(record);
            state.file.write_all(&bytes).map_err(SinkError::Io)?;
            state.file.write_all(b"\n").map_err(SinkError::Io)?;
            state.bytes_written += bytes.len() as u64 + 1;
            if self.should_rotate(&state) {
                self.rotate(&mut state).await?;
            }
        }
        Ok(())
    }

    async fn flush(&self) -> Result<(), SinkError> {
        let mut state = self.state.lock().await;
        state.file.flush().map_err(SinkError::Io)
    }

    fn name(&self) -> &str {
        "file"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::level::Level;
    use crate::record::{LoggerContext, Source};
    use indexmap::IndexMap;

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
    async fn writes_and_creates_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/app.log");
        let config = FileSinkConfig {
            path: path.to_string_lossy().into_owned(),
            max_size_bytes: 1024 * 1024,
            rotation_interval: None,
            retention_days: 14,
            compress: false,
            ..FileSinkConfig::default()
        };
        let sink = FileSink::new(config).unwrap();
        sink.send(&[sample_record()]).await.unwrap();
        sink.flush().await.unwrap();
        assert!(path.exists());
    }

    #[tokio::test]
    async fn rotates_when_size_exceeded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.log");
        let config = FileSinkConfig {
            path: path.to_string_lossy().into_owned(),
            max_size_bytes: 10,
            rotation_interval: None,
            retention_days: 14,
            compress: false,
            ..FileSinkConfig::default()
        };
        let sink = FileSink::new(config).unwrap();
        sink.send(&[sample_record()]).await.unwrap();

        let rotated_exists = fs::read_dir(dir.path())
            .unwrap()
            .flatten()
            .any(|e| e.file_name().to_string_lossy().starts_with("app.log.") );
        assert!(rotated_exists);
    }

    #[tokio::test]
    async fn rotated_file_is_compressed_in_the_background() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.log");
        let config = FileSinkConfig {
            path: path.to_string_lossy().into_owned(),
            max_size_bytes: 10,
            rotation_interval: None,
            retention_days: 14,
            compress: true,
            ..FileSinkConfig::default()
        };
        let sink = FileSink::new(config).unwrap();
        sink.send(&[sample_record()]).await.unwrap();

        // Compression is spawned fire-and-forget, not awaited by `send`, so
        // give the blocking task a moment to finish before checking for it.
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        let gz_exists = fs::read_dir(dir.path())
            .unwrap()
            .flatten()
            .any(|e| e.file_name().to_string_lossy().ends_with(".gz"));
        assert!(gz_exists);
    }

    #[test]
    fn retention_keeps_only_the_newest_max_files() {
        let dir = tempfile::tempdir().unwrap();
        let stem = dir.path().join("app.log");

        for i in 0..5u64 {
            let rotated = dir.path().join(format!("app.log.{}", i));
            fs::write(&rotated, b"x").unwrap();
            let file = File::open(&rotated).unwrap();
            let modified = std::time::SystemTime::now() + std::time::Duration::from_secs(i);
            file.set_modified(modified).unwrap();
        }

        apply_retention(&stem, Some(dir.path()), 365, Some(2));

        let remaining: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .flatten()
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(remaining.len(), 2);
        assert!(remaining.contains(&"app.log.3".to_owned()));
        assert!(remaining.contains(&"app.log.4".to_owned()));
    }
}
