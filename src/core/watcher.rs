//! Config file change notifications
//!
//! Settings are read once at startup. Edits to the loaded file are logged
//! and take effect on the next restart.

use crate::core::error::{Error, Result};
use notify::{RecommendedWatcher, RecursiveMode};
use notify_debouncer_mini::{new_debouncer, DebounceEventResult, Debouncer};
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Quiet period before a burst of writes is reported as one change
pub const DEBOUNCE: Duration = Duration::from_millis(500);

/// Watches one config file and logs every change to it
pub struct ConfigWatcher {
    path: PathBuf,
    events: mpsc::Receiver<PathBuf>,
    // Dropping the debouncer stops the OS watch
    _debouncer: Debouncer<RecommendedWatcher>,
}

impl ConfigWatcher {
    /// Start watching `path`
    ///
    /// The parent directory is watched so that editors replacing the file
    /// by rename are still seen; events for other files are dropped.
    pub fn watch(path: impl Into<PathBuf>, debounce: Duration) -> Result<Self> {
        let path = path.into();
        let file_name = path
            .file_name()
            .map(|name| name.to_os_string())
            .ok_or_else(|| Error::config(format!("not a config file path: {}", path.display())))?;
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };

        let (tx, events) = mpsc::channel(16);
        let mut debouncer = new_debouncer(debounce, move |res: DebounceEventResult| match res {
            Ok(batch) => {
                for event in batch {
                    if event.path.file_name() == Some(file_name.as_os_str()) {
                        // A full channel already holds a pending change
                        let _ = tx.try_send(event.path);
                    }
                }
            }
            Err(e) => warn!(error = %e, "config watch error"),
        })
        .map_err(|e| watch_error(&path, e))?;

        debouncer
            .watcher()
            .watch(&dir, RecursiveMode::NonRecursive)
            .map_err(|e| watch_error(&path, e))?;

        Ok(Self { path, events, _debouncer: debouncer })
    }

    /// The watched file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Log changes until `stop` is cancelled; returns the number of changes seen
    pub async fn run(mut self, stop: CancellationToken) -> u64 {
        info!(path = %self.path.display(), "watching config file");

        let mut changes = 0u64;
        loop {
            tokio::select! {
                biased;
                _ = stop.cancelled() => break,
                event = self.events.recv() => match event {
                    Some(changed) => {
                        changes += 1;
                        info!("Config file changed: {}", changed.display());
                    }
                    None => break,
                },
            }
        }

        info!(changes, "config watch stopped");
        changes
    }
}

fn watch_error(path: &Path, err: notify::Error) -> Error {
    Error::Io(io::Error::other(format!(
        "could not watch config file {}: {}",
        path.display(),
        err
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEBOUNCE_FOR_TESTS: Duration = Duration::from_millis(100);

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_edit_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("heapwatch.toml");
        std::fs::write(&path, "interval = \"1m\"\n").unwrap();

        let watcher = ConfigWatcher::watch(&path, DEBOUNCE_FOR_TESTS).unwrap();
        assert_eq!(watcher.path(), path.as_path());
        let stop = CancellationToken::new();
        let handle = tokio::spawn(watcher.run(stop.clone()));

        tokio::time::sleep(Duration::from_millis(200)).await;
        std::fs::write(&path, "interval = \"2m\"\n").unwrap();
        tokio::time::sleep(Duration::from_millis(1000)).await;

        stop.cancel();
        assert!(handle.await.unwrap() >= 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_other_files_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("heapwatch.toml");
        std::fs::write(&path, "interval = \"1m\"\n").unwrap();

        let watcher = ConfigWatcher::watch(&path, DEBOUNCE_FOR_TESTS).unwrap();
        let stop = CancellationToken::new();
        let handle = tokio::spawn(watcher.run(stop.clone()));

        tokio::time::sleep(Duration::from_millis(200)).await;
        std::fs::write(dir.path().join("heap.prof"), "profile").unwrap();
        tokio::time::sleep(Duration::from_millis(600)).await;

        stop.cancel();
        assert_eq!(handle.await.unwrap(), 0);
    }

    #[test]
    fn test_missing_directory_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent").join("heapwatch.toml");
        let err = ConfigWatcher::watch(&path, DEBOUNCE_FOR_TESTS).err().unwrap();
        assert!(matches!(err, Error::Io(_)));
    }
}
