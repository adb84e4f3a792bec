//! Error types for the synchronization engine.

use thiserror::Error;

/// Main error type for sync operations.
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{context}: {source}")]
    IoContext {
        context: String,
        source: std::io::Error,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Cannot move {0} to a different volume")]
    DifferentVolume(String),

    #[error("File is locked: {0}")]
    FileLocked(String),

    #[error("Source item not found: {0}")]
    SourceNotFound(String),

    #[error("Data verification error: {0} and {1} have different content")]
    VerificationFailed(String, String),

    #[error("Timeout while accessing {0}")]
    Timeout(String),

    #[error("Operation cancelled")]
    Interrupted,

    #[error("Contract violation: {0}")]
    ContractViolation(String),

    #[error("{0}")]
    Other(String),
}

impl SyncError {
    /// Errors other than cancellation go through the user retry loop.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, SyncError::Interrupted | SyncError::ContractViolation(_))
    }
}

/// Attaches path context to a raw I/O error.
pub fn io_ctx(context: impl Into<String>) -> impl FnOnce(std::io::Error) -> SyncError {
    let context = context.into();
    move |source| SyncError::IoContext { context, source }
}

/// Result type alias for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interrupted_is_not_retryable() {
        assert!(!SyncError::Interrupted.is_retryable());
        assert!(SyncError::Other("boom".into()).is_retryable());
        assert!(SyncError::FileLocked("/a".into()).is_retryable());
    }

    #[test]
    fn test_io_context_message() {
        let err = io_ctx("Cannot open file /tmp/x")(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "gone",
        ));
        assert!(err.to_string().starts_with("Cannot open file /tmp/x"));
    }
}
