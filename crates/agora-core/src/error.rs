//! Error types and result aliases shared across Agora components.
//!
//! Errors are structured for programmatic handling: the API layer maps each
//! variant onto an HTTP status without inspecting message strings.

/// The result type used throughout Agora.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in Agora operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An invalid identifier was provided.
    #[error("invalid identifier: {message}")]
    InvalidId {
        /// Description of what made the id invalid.
        message: String,
    },

    /// Invalid input was provided.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The requested resource was not found.
    #[error("not found: {resource_type} with id {id}")]
    NotFound {
        /// The type of resource that was not found.
        resource_type: &'static str,
        /// The identifier that was looked up.
        id: String,
    },

    /// A state transition or concurrent update conflict.
    #[error("conflict: {message}")]
    Conflict {
        /// Description of the conflict.
        message: String,
    },

    /// The account balance cannot cover the requested escrow lock.
    #[error("insufficient funds: required {required}, available {available}")]
    InsufficientFunds {
        /// The amount that was requested.
        required: i64,
        /// The balance that was available.
        available: i64,
    },

    /// The capability is not present in the schema registry.
    #[error("unknown capability: {capability}")]
    UnknownCapability {
        /// The capability name that was looked up.
        capability: String,
    },

    /// A payload failed schema validation (hard reject).
    #[error("validation failed: {message}")]
    ValidationFailed {
        /// Description of the schema violation.
        message: String,
    },

    /// The caller is not allowed to perform this operation.
    #[error("forbidden: {message}")]
    Forbidden {
        /// Description of the authorization failure.
        message: String,
    },

    /// A storage operation failed.
    #[error("storage error: {message}")]
    Storage {
        /// Description of the storage failure.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A serialization or deserialization error occurred.
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of the serialization failure.
        message: String,
    },

    /// An internal error that should not happen in normal operation.
    #[error("internal error: {message}")]
    Internal {
        /// Description of the internal error.
        message: String,
    },
}

impl Error {
    /// Creates a new storage error with the given message.
    #[must_use]
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a new storage error with a source cause.
    #[must_use]
    pub fn storage_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Storage {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Creates a new conflict error.
    #[must_use]
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict {
            message: message.into(),
        }
    }

    /// Creates a new not-found error for the given resource type and id.
    #[must_use]
    pub fn not_found(resource_type: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            resource_type,
            id: id.to_string(),
        }
    }

    /// Creates a new forbidden error.
    #[must_use]
    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::Forbidden {
            message: message.into(),
        }
    }

    /// Creates a new validation failure.
    #[must_use]
    pub fn validation(message: impl Into<String>) -> Self {
        Self::ValidationFailed {
            message: message.into(),
        }
    }

    /// Creates a new internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns true when retrying the enclosing operation may succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insufficient_funds_display() {
        let err = Error::InsufficientFunds {
            required: 10,
            available: 3,
        };
        let msg = err.to_string();
        assert!(msg.contains("required 10"));
        assert!(msg.contains("available 3"));
    }

    #[test]
    fn conflict_is_retryable() {
        assert!(Error::conflict("serialization failure").is_retryable());
        assert!(!Error::not_found("task", "t-1").is_retryable());
    }

    #[test]
    fn storage_error_with_source() {
        let source = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err = Error::storage_with_source("read failed", source);
        assert!(std::error::Error::source(&err).is_some());
    }
}
