//! Error types for nettrace

use thiserror::Error;

/// Result type alias for nettrace operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for nettrace
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Interface not found
    #[error("Interface '{0}' not found")]
    InterfaceNotFound(String),

    /// Insufficient privileges to open a capture
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Capture handle could not be opened
    #[error("Failed to open capture: {0}")]
    OpenFailed(String),

    /// Filter expression or program rejected
    #[error("Failed to compile filter '{filter}': {reason}")]
    FilterCompileFailed { filter: String, reason: String },

    /// Capture error after the source was opened
    #[error("Packet capture error: {0}")]
    Capture(String),

    /// Trace container writer error
    #[error("Trace writer error: {0}")]
    Writer(String),

    /// Live listener error
    #[error("Listener error: {0}")]
    Listener(String),

    /// Malformed listener address
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    /// Invalid configuration value
    #[error("Invalid configuration '{name}': {reason}")]
    InvalidConfig { name: String, reason: String },

    /// Trace event (de)serialization failure
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Resource already exists
    #[error("Resource already exists: {0}")]
    AlreadyExists(String),

    /// Resource not found
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// Operation on a session that was already closed
    #[error("Capture session already closed")]
    AlreadyClosed,
}

impl Error {
    /// Create a capture error with a custom message
    pub fn capture<S: Into<String>>(msg: S) -> Self {
        Error::Capture(msg.into())
    }

    /// Create a writer error with a custom message
    pub fn writer<S: Into<String>>(msg: S) -> Self {
        Error::Writer(msg.into())
    }

    /// Create a listener error with a custom message
    pub fn listener<S: Into<String>>(msg: S) -> Self {
        Error::Listener(msg.into())
    }

    /// Create an invalid configuration error
    pub fn invalid_config<N: Into<String>, R: Into<String>>(name: N, reason: R) -> Self {
        Error::InvalidConfig {
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// Create a filter compilation error
    pub fn filter_compile<F: Into<String>, R: Into<String>>(filter: F, reason: R) -> Self {
        Error::FilterCompileFailed {
            filter: filter.into(),
            reason: reason.into(),
        }
    }

    /// Whether the error happened while opening a source
    pub fn is_open_failure(&self) -> bool {
        matches!(
            self,
            Error::InterfaceNotFound(_)
                | Error::PermissionDenied(_)
                | Error::OpenFailed(_)
                | Error::FilterCompileFailed { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::filter_compile("tcp port", "syntax error");
        assert_eq!(
            err.to_string(),
            "Failed to compile filter 'tcp port': syntax error"
        );

        let err = Error::invalid_config("snapshot_length", "must be non-zero");
        assert!(err.to_string().contains("snapshot_length"));
    }

    #[test]
    fn test_open_failure_classification() {
        assert!(Error::InterfaceNotFound("veth0".into()).is_open_failure());
        assert!(Error::PermissionDenied("eth0".into()).is_open_failure());
        assert!(!Error::capture("read failed").is_open_failure());
        assert!(!Error::AlreadyClosed.is_open_failure());
    }

    #[test]
    fn test_io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "gone");
        let err: Error = io.into();
        assert!(matches!(err, Error::Io(_)));
    }
}
