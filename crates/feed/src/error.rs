//! Error types for the feed crate.

use thiserror::Error;

/// Result type alias for feed operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Feed error types.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    /// A backing-store call failed.
    #[error("source operation '{operation}' failed: {reason}")]
    Source { operation: String, reason: String },

    /// The requested record does not exist.
    #[error("record '{id}' not found")]
    RecordNotFound { id: String },

    /// A change notice could not be decoded.
    #[error("malformed change event: {reason}")]
    MalformedEvent { reason: String },

    /// The change channel was closed.
    #[error("change channel closed")]
    ChannelClosed,

    /// Serialization error.
    #[error("serialization error: {reason}")]
    Serialization { reason: String },

    /// Invalid configuration.
    #[error("invalid configuration: {reason}")]
    Config { reason: String },

    /// Filesystem error.
    #[error("io error: {reason}")]
    Io { reason: String },
}

impl Error {
    /// Create a source failure error.
    pub fn source_failed(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Source {
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    /// Create a record not found error.
    pub fn record_not_found(id: impl Into<String>) -> Self {
        Self::RecordNotFound { id: id.into() }
    }

    /// Create a malformed event error.
    pub fn malformed(reason: impl Into<String>) -> Self {
        Self::MalformedEvent {
            reason: reason.into(),
        }
    }

    /// Create a serialization error.
    pub fn serialization(reason: impl Into<String>) -> Self {
        Self::Serialization {
            reason: reason.into(),
        }
    }

    /// Create a configuration error.
    pub fn config(reason: impl Into<String>) -> Self {
        Self::Config {
            reason: reason.into(),
        }
    }

    /// Whether this error came from a malformed notice rather than the store.
    pub fn is_malformed(&self) -> bool {
        matches!(self, Self::MalformedEvent { .. })
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization(err.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::Io {
            reason: err.to_string(),
        }
    }
}
