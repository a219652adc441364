//! Directory store error types
//!
//! Error definitions with transient/permanent classification for retry logic.

use thiserror::Error;

/// Error that can occur during directory store operations.
#[derive(Debug, Error)]
pub enum DirectoryError {
    // Connection errors (transient)
    /// Failed to reach the directory.
    #[error("connection failed: {message}")]
    ConnectionFailed {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// The directory did not answer in time.
    #[error("operation timed out after {timeout_ms} ms")]
    Timeout { timeout_ms: u64 },

    /// The directory is temporarily unavailable (busy, read-only replica).
    #[error("directory unavailable: {message}")]
    Unavailable { message: String },

    /// The entry was written but is not visible on this replica yet.
    #[error("entry not yet replicated: {key}")]
    NotYetReplicated { key: String },

    // Entry errors (permanent)
    /// No entry exists under the given key.
    #[error("entry not found: {key}")]
    NotFound { key: String },

    /// An entry already exists under the given key.
    #[error("entry already exists: {key}")]
    AlreadyExists { key: String },

    /// A uniqueness or schema constraint rejected the write.
    #[error("constraint violation on '{attribute}': {message}")]
    ConstraintViolation { attribute: String, message: String },

    /// The target container (organizational unit) does not exist.
    #[error("container does not exist: {container}")]
    InvalidContainer { container: String },

    /// The request itself is malformed.
    #[error("invalid request: {message}")]
    InvalidRequest { message: String },

    // Backend errors (permanent)
    /// Reading or writing the backing snapshot failed.
    #[error("storage error: {message}")]
    Storage {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Serialization error.
    #[error("serialization error: {message}")]
    Serialization { message: String },
}

impl DirectoryError {
    /// Check if this error is transient and the operation should be retried.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            DirectoryError::ConnectionFailed { .. }
                | DirectoryError::Timeout { .. }
                | DirectoryError::Unavailable { .. }
                | DirectoryError::NotYetReplicated { .. }
        )
    }

    /// Check if this error is permanent and retrying will not help.
    pub fn is_permanent(&self) -> bool {
        !self.is_transient()
    }

    /// Get a stable error code for reports.
    pub fn error_code(&self) -> &'static str {
        match self {
            DirectoryError::ConnectionFailed { .. } => "CONNECTION_FAILED",
            DirectoryError::Timeout { .. } => "TIMEOUT",
            DirectoryError::Unavailable { .. } => "UNAVAILABLE",
            DirectoryError::NotYetReplicated { .. } => "NOT_YET_REPLICATED",
            DirectoryError::NotFound { .. } => "NOT_FOUND",
            DirectoryError::AlreadyExists { .. } => "ALREADY_EXISTS",
            DirectoryError::ConstraintViolation { .. } => "CONSTRAINT_VIOLATION",
            DirectoryError::InvalidContainer { .. } => "INVALID_CONTAINER",
            DirectoryError::InvalidRequest { .. } => "INVALID_REQUEST",
            DirectoryError::Storage { .. } => "STORAGE_ERROR",
            DirectoryError::Serialization { .. } => "SERIALIZATION_ERROR",
        }
    }

    // Convenience constructors

    /// Create a connection failed error.
    pub fn connection_failed(message: impl Into<String>) -> Self {
        DirectoryError::ConnectionFailed {
            message: message.into(),
            source: None,
        }
    }

    /// Create a not found error.
    pub fn not_found(key: impl Into<String>) -> Self {
        DirectoryError::NotFound { key: key.into() }
    }

    /// Create an already exists error.
    pub fn already_exists(key: impl Into<String>) -> Self {
        DirectoryError::AlreadyExists { key: key.into() }
    }

    /// Create a constraint violation error.
    pub fn constraint_violation(attribute: impl Into<String>, message: impl Into<String>) -> Self {
        DirectoryError::ConstraintViolation {
            attribute: attribute.into(),
            message: message.into(),
        }
    }

    /// Create a storage error with a source.
    pub fn storage(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        DirectoryError::Storage {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }
}

impl From<serde_json::Error> for DirectoryError {
    fn from(err: serde_json::Error) -> Self {
        DirectoryError::Serialization {
            message: err.to_string(),
        }
    }
}

/// Result type for directory operations.
pub type DirectoryResult<T> = Result<T, DirectoryError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_errors() {
        assert!(DirectoryError::connection_failed("refused").is_transient());
        assert!(DirectoryError::Timeout { timeout_ms: 500 }.is_transient());
        assert!(DirectoryError::NotYetReplicated {
            key: "uid=a,ou=x".to_string()
        }
        .is_transient());
    }

    #[test]
    fn test_permanent_errors() {
        assert!(DirectoryError::not_found("uid=a,ou=x").is_permanent());
        assert!(DirectoryError::already_exists("uid=a,ou=x").is_permanent());
        assert!(DirectoryError::constraint_violation("username", "taken").is_permanent());
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(DirectoryError::not_found("k").error_code(), "NOT_FOUND");
        assert_eq!(
            DirectoryError::InvalidContainer {
                container: "Nowhere".to_string()
            }
            .error_code(),
            "INVALID_CONTAINER"
        );
    }

    #[test]
    fn test_display() {
        let err = DirectoryError::constraint_violation("email", "value already in use");
        assert_eq!(
            err.to_string(),
            "constraint violation on 'email': value already in use"
        );
    }
}
