//! Error types for pawtrack-core

use thiserror::Error;

/// Result type alias using pawtrack-core's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in pawtrack-core operations
#[derive(Error, Debug)]
pub enum Error {
    /// libSQL error
    #[error("libSQL error: {0}")]
    LibSql(#[from] libsql::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Entity or operation not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid engine configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Remote store failure surfaced to a caller
    #[error(transparent)]
    Write(#[from] WriteError),

    /// Undo rejected
    #[error(transparent)]
    Undo(#[from] UndoError),

    /// The engine's background tasks are gone
    #[error("Sync engine has shut down")]
    EngineStopped,
}

/// Failure reported by a remote store write or fetch.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WriteError {
    /// Network failure or timeout; retried on the next reachable transition.
    #[error("Remote store unavailable: {0}")]
    Transient(String),

    /// The store refused the write; never retried automatically.
    #[error("Remote store rejected write ({code}): {message}")]
    Rejected { code: String, message: String },
}

impl WriteError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient(message.into())
    }

    pub fn rejected(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Rejected {
            code: code.into(),
            message: message.into(),
        }
    }

    /// Whether the write may be retried without user action.
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    /// Classify an HTTP status returned by the remote store.
    pub fn from_http_status(status: u16, message: impl Into<String>) -> Self {
        match status {
            408 | 425 | 429 | 500..=599 => Self::Transient(format!("HTTP {status}: {}", message.into())),
            401 | 403 => Self::rejected("permission-denied", message),
            404 => Self::rejected("not-found", message),
            409 => Self::rejected("already-exists", message),
            _ => Self::rejected(format!("http-{status}"), message),
        }
    }
}

/// Reasons an undo request is refused.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UndoError {
    /// No visit with this id is visible locally.
    #[error("Visit not found: {0}")]
    NotFound(String),

    /// The visit already has an end timestamp (confirmed or pending).
    #[error("Visit {0} is already completed and cannot be undone")]
    AlreadyTerminal(String),

    /// The visit was never started, so there is nothing to undo.
    #[error("Visit {0} has not been started")]
    NotStarted(String),
}

/// Problems with a single change-feed document.
///
/// These are logged and the offending document is dropped; they never stop
/// the stream for other entities.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReconciliationError {
    #[error("Malformed change event for document '{document_id}': {reason}")]
    MalformedEvent { document_id: String, reason: String },
}

impl ReconciliationError {
    pub fn malformed(document_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::MalformedEvent {
            document_id: document_id.into(),
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_status_maps_to_retry_policy() {
        assert!(WriteError::from_http_status(500, "boom").is_retryable());
        assert!(WriteError::from_http_status(429, "slow down").is_retryable());
        assert!(WriteError::from_http_status(408, "timeout").is_retryable());
        assert!(!WriteError::from_http_status(400, "bad").is_retryable());
        assert_eq!(
            WriteError::from_http_status(403, "nope"),
            WriteError::rejected("permission-denied", "nope")
        );
    }

    #[test]
    fn undo_error_messages_name_the_visit() {
        let error = Error::from(UndoError::AlreadyTerminal("visit-1".to_string()));
        assert!(error.to_string().contains("visit-1"));
    }
}
