//! Error types and handling for the telemetry agent
//! 
//! Startup errors (configuration, log file) are fatal. Profile errors are
//! recovered by the scheduled loop, which logs them and keeps ticking.

use thiserror::Error;

/// Main result type used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the agent
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration errors, fatal at startup
    #[error("Configuration error: {0}")]
    Config(String),

    /// Profile capture errors
    #[error("Profile error: {0}")]
    Profile(#[from] ProfileError),

    /// Dashboard template could not be rendered
    #[error("Render error: {0}")]
    Render(String),

    /// I/O errors from std
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Prometheus metrics errors
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
}

/// Errors raised while capturing or writing a single profile
#[derive(Error, Debug)]
pub enum ProfileError {
    /// Output file could not be created or written
    #[error("could not write profile: {0}")]
    Io(#[from] std::io::Error),

    /// No profile registered under the requested name
    #[error("could not find {0} profile")]
    ProfileNotFound(String),

    /// The requested profile kind is not one of the supported kinds
    #[error("unknown profile type: {0}")]
    UnknownProfileKind(String),

    /// The CPU sampling profiler failed to start or to build its report
    #[error("could not capture CPU profile: {0}")]
    Cpu(String),

    /// Allocation sampling is not enabled in the allocator
    #[error("heap profiling not activated")]
    HeapProfilingInactive,

    /// The allocator could not produce a heap profile
    #[error("could not capture heap profile: {0}")]
    Heap(String),
}

impl Error {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a render error
    pub fn render(msg: impl Into<String>) -> Self {
        Self::Render(msg.into())
    }

    /// Check if this error must abort startup
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Config(_) | Error::Io(_) | Error::Metrics(_))
    }
}

impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        Self::Config(err.to_string())
    }
}

impl From<pprof::Error> for ProfileError {
    fn from(err: pprof::Error) -> Self {
        Self::Cpu(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_profile_error_messages() {
        assert_eq!(
            ProfileError::UnknownProfileKind("bogus".into()).to_string(),
            "unknown profile type: bogus"
        );
        assert_eq!(
            ProfileError::ProfileNotFound("block".into()).to_string(),
            "could not find block profile"
        );
    }

    #[test]
    fn test_profile_error_wraps_into_error() {
        let err: Error = ProfileError::UnknownProfileKind("bogus".into()).into();
        assert!(matches!(err, Error::Profile(ProfileError::UnknownProfileKind(_))));
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_config_errors_are_fatal() {
        assert!(Error::config("missing interval").is_fatal());
        assert!(!Error::render("no template").is_fatal());
    }
}
