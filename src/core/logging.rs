//! Log sink setup
//!
//! All agent output, including the per-tick memory statistics and dump
//! failures, goes through `tracing` into a single append-only log file.

use crate::core::error::{Error, Result};
use std::fs::OpenOptions;
use std::io;
use std::path::Path;
use std::sync::Mutex;
use tracing_subscriber::EnvFilter;

/// Install the global subscriber writing to `path`
///
/// `RUST_LOG` takes precedence over `level` when set. Fails if the file
/// cannot be opened or a subscriber is already installed.
pub fn init_file_logging(path: &Path, level: &str) -> Result<()> {
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| {
            Error::Io(io::Error::new(
                e.kind(),
                format!("could not open log file {}: {}", path.display(), e),
            ))
        })?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(Mutex::new(file))
        .with_ansi(false)
        .with_file(true)
        .with_line_number(true)
        .try_init()
        .map_err(|e| Error::Io(io::Error::other(format!("could not install log subscriber: {}", e))))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unopenable_log_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("agent.log");

        let err = init_file_logging(&path, "info").unwrap_err();
        assert!(matches!(err, Error::Io(_)));
        assert!(err.is_fatal());
        assert!(err.to_string().contains("could not open log file"));
    }

    #[test]
    fn test_second_subscriber_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let first = init_file_logging(&dir.path().join("first.log"), "info");
        let second = init_file_logging(&dir.path().join("second.log"), "info");

        // Whichever call lost the race for the global subscriber
        let err = match (first, second) {
            (Ok(()), Err(e)) | (Err(e), _) => e,
            (Ok(()), Ok(())) => panic!("two global subscribers installed"),
        };
        assert!(matches!(err, Error::Io(_)));
        assert!(err.to_string().contains("could not install log subscriber"));
    }
}
