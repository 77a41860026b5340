//! Error types for tuber
//!
//! Provides the workspace-wide error type used by configuration loading,
//! logging setup, the client and the server binary. The networking layers
//! keep their own narrower error enums and convert into this one at the edges.

use std::path::PathBuf;

/// Main error type for tuber operations
#[derive(Debug, thiserror::Error)]
pub enum TuberError {
    // === IO Errors ===

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to read file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to write file {path}: {source}")]
    FileWrite {
        path: PathBuf,
        source: std::io::Error,
    },

    // === Connection Errors ===

    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Connection timeout after {seconds}s")]
    ConnectionTimeout { seconds: u64 },

    #[error("Connection closed unexpectedly")]
    ConnectionClosed,

    // === Protocol Errors ===

    #[error("Protocol error: {0}")]
    Protocol(String),

    // === Configuration Errors ===

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration at {path}: {message}")]
    ConfigInvalid { path: PathBuf, message: String },

    #[error("Configuration file not found: {0}")]
    ConfigNotFound(PathBuf),

    // === Internal Errors ===

    #[error("Internal error: {0}")]
    Internal(String),
}

impl TuberError {
    /// Create a connection error
    pub fn connection(msg: impl Into<String>) -> Self {
        Self::Connection(msg.into())
    }

    /// Create a protocol error
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Create a config error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ConnectionTimeout { .. } | Self::Connection(_) | Self::ConnectionClosed
        )
    }
}

/// Result type alias using TuberError
pub type Result<T> = std::result::Result<T, TuberError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = TuberError::config("bad listener");
        assert_eq!(err.to_string(), "Configuration error: bad listener");
    }

    #[test]
    fn test_retryable() {
        assert!(TuberError::ConnectionTimeout { seconds: 5 }.is_retryable());
        assert!(TuberError::connection("refused").is_retryable());
        assert!(!TuberError::config("x").is_retryable());
    }

    #[test]
    fn test_from_io_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "not found");
        let err: TuberError = io_err.into();
        assert!(matches!(err, TuberError::Io(_)));
    }
}
