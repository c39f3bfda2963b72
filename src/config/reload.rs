//! Watches the config file for changes and emits debounced reload events.
//! Uses `notify` directly (as the pack's `vector` crate does) rather than
//! polling.
use super::{ConfigDocument, ConfigError};
use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::sync::mpsc as std_mpsc;
use std::time::Duration;
use tokio::sync::mpsc;

const DEBOUNCE: Duration = Duration::from_millis(250);

#[derive(Debug)]
pub enum ReloadEvent {
    /// A new, valid document was loaded and should replace the running one;
    /// no sink needs to be torn down to apply it.
    Reloaded(Box<ConfigDocument>),
    /// A new, valid document changed a field identified by
    /// [`ConfigDocument::critical_fields_changed`] (service/environment, or
    /// a sink's connection target): the pipeline must close and
    /// reinstantiate the affected sinks rather than running them against
    /// stale state. See `spec.md` §4.C.
    CriticalChange(Box<ConfigDocument>),
    /// The file changed but the new document failed validation or parsing;
    /// the previously running configuration stays in effect.
    ReloadError(ConfigError),
}

/// Owns the filesystem watcher for the config file's parent directory and
/// forwards debounced [`ReloadEvent`]s on `events`.
pub struct ConfigWatcher {
    _watcher: RecommendedWatcher,
    pub events: mpsc::UnboundedReceiver<ReloadEvent>,
}

impl ConfigWatcher {
    /// `current` is the document in effect when watching starts, used to
    /// classify the first reload as critical or not; callers should keep
    /// applying each successful document as `current` isn't tracked here.
    pub fn watch(path: impl AsRef<Path>, current: ConfigDocument) -> Result<ConfigWatcher, notify::Error> {
        let path = path.as_ref().to_path_buf();
        let (raw_tx, raw_rx) = std_mpsc::channel::<notify::Result<Event>>();

        let mut watcher = RecommendedWatcher::new(
            move |res| {
                let _ = raw_tx.send(res);
            },
            notify::Config::default(),
        )?;

        let watch_dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        watcher.watch(&watch_dir, RecursiveMode::NonRecursive)?;

        let (tx, rx) = mpsc::unbounded_channel();
        std::thread::spawn(move || debounce_loop(path, current, raw_rx, tx));

        Ok(ConfigWatcher {
            _watcher: watcher,
            events: rx,
        })
    }
}

fn debounce_loop(
    path: PathBuf,
    mut current: ConfigDocument,
    raw_rx: std_mpsc::Receiver<notify::Result<Event>>,
    tx: mpsc::UnboundedSender<ReloadEvent>,
) {
    loop {
        let first = match raw_rx.recv() {
            Ok(event) => event,
            Err(_) => return,
        };
        if !event_touches(&first, &path) {
            continue;
        }
        // Drain anything else that arrives within the debounce window so a
        // burst of writes (e.g. an editor's save-then-rename) collapses
        // into a single reload attempt.
        while let Ok(_more) = raw_rx.recv_timeout(DEBOUNCE) {}

        match ConfigDocument::load(Some(&path)) {
            Ok(doc) => {
                let event = if current.critical_fields_changed(&doc) {
                    ReloadEvent::CriticalChange(Box::new(doc.clone()))
                } else {
                    ReloadEvent::Reloaded(Box::new(doc.clone()))
                };
                current = doc;
                if tx.send(event).is_err() {
                    return;
                }
            }
            Err(err) => {
                if tx.send(ReloadEvent::ReloadError(err)).is_err() {
                    return;
                }
            }
        }
    }
}

fn event_touches(event: &notify::Result<Event>, path: &Path) -> bool {
    match event {
        Ok(event) => event.paths.iter().any(|p| p == path),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::time::Duration as StdDuration;

    #[tokio::test]
    async fn ordinary_edit_emits_reloaded_not_critical() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logging.config.json");
        std::fs::write(&path, r#"{"service":"svc","environment":"prod"}"#).unwrap();

        let mut watcher = ConfigWatcher::watch(&path, ConfigDocument::load(Some(&path)).unwrap()).unwrap();

        let mut file = std::fs::OpenOptions::new().write(true).truncate(true).open(&path).unwrap();
        write!(file, r#"{{"service":"svc","environment":"prod","batch":{{"max_size":7}}}}"#).unwrap();
        drop(file);

        let event = tokio::time::timeout(StdDuration::from_secs(5), watcher.events.recv())
            .await
            .expect("reload event within timeout")
            .expect("channel open");
        assert!(matches!(event, ReloadEvent::Reloaded(_)));
    }

    #[tokio::test]
    async fn service_rename_emits_critical_change() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logging.config.json");
        std::fs::write(&path, r#"{"service":"svc","environment":"prod"}"#).unwrap();

        let mut watcher = ConfigWatcher::watch(&path, ConfigDocument::load(Some(&path)).unwrap()).unwrap();

        let mut file = std::fs::OpenOptions::new().write(true).truncate(true).open(&path).unwrap();
        write!(file, r#"{{"service":"renamed-svc","environment":"prod"}}"#).unwrap();
        drop(file);

        let event = tokio::time::timeout(StdDuration::from_secs(5), watcher.events.recv())
            .await
            .expect("reload event within timeout")
            .expect("channel open");
        assert!(matches!(event, ReloadEvent::CriticalChange(_)));
    }
}
