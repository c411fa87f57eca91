//! Sync error types
//!
//! Error definitions with transient/permanent classification for retry logic.

use thiserror::Error;

/// Error that can occur during a reconciliation run.
#[derive(Debug, Error)]
pub enum SyncError {
    // Connection errors (usually transient)
    /// Transport-level failure talking to the directory.
    #[error("directory unavailable: {message}")]
    DirectoryUnavailable {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A single directory operation exceeded its deadline.
    #[error("operation timed out after {timeout_secs} seconds")]
    OperationTimeout { timeout_secs: u64 },

    // Authentication errors (permanent)
    /// The bind was rejected by the directory.
    #[error("authentication failed: invalid credentials")]
    AuthenticationFailed,

    /// A write was rejected by the directory's access control.
    #[error("permission denied for {operation} on {dn}")]
    PermissionDenied { operation: String, dn: String },

    // Addressing errors
    /// The target entry does not exist at the addressed DN.
    #[error("object not found: {dn}")]
    ObjectNotFound { dn: String },

    /// More than one person entry matched a supposedly unique identifier.
    #[error("ambiguous uid '{uid}': {matches} entries matched")]
    AmbiguousUser { uid: String, matches: usize },

    // Configuration errors (permanent)
    /// The sync configuration is invalid.
    #[error("invalid configuration: {message}")]
    InvalidConfiguration { message: String },

    // Operation errors
    /// The directory returned a failure result code.
    #[error("operation failed: {message}")]
    OperationFailed {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl SyncError {
    /// Check if this error is transient and the operation may be retried.
    ///
    /// Transient errors are those caused by temporary conditions that may
    /// resolve themselves, such as network issues or an overloaded server.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SyncError::DirectoryUnavailable { .. } | SyncError::OperationTimeout { .. }
        )
    }

    /// Check if this error is permanent and retry won't help.
    pub fn is_permanent(&self) -> bool {
        !self.is_transient()
    }

    // Convenience constructors

    /// Create a directory unavailable error.
    pub fn unavailable(message: impl Into<String>) -> Self {
        SyncError::DirectoryUnavailable {
            message: message.into(),
            source: None,
        }
    }

    /// Create a directory unavailable error with source.
    pub fn unavailable_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        SyncError::DirectoryUnavailable {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create an operation failed error.
    pub fn operation_failed(message: impl Into<String>) -> Self {
        SyncError::OperationFailed {
            message: message.into(),
            source: None,
        }
    }

    /// Create an operation failed error with source.
    pub fn operation_failed_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        SyncError::OperationFailed {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create an invalid configuration error.
    pub fn invalid_configuration(message: impl Into<String>) -> Self {
        SyncError::InvalidConfiguration {
            message: message.into(),
        }
    }
}

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;
