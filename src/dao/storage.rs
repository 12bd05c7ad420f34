use std::error::Error;
use thiserror::Error;
use validator::ValidationErrors;

/// Result alias for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Error raised by persistence backends regardless of the underlying store.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Transport failure, server error or store offline. Retryable.
    #[error("storage unavailable: {message}")]
    Unavailable {
        message: String,
        #[source]
        source: Box<dyn Error + Send + Sync>,
    },
    /// The addressed row does not exist.
    #[error("{resource} not found")]
    NotFound { resource: String },
    /// The store refused the request with a domain error (4xx).
    #[error("request rejected by store: {message}")]
    Rejected { message: String },
    /// The payload failed validation before it was sent.
    #[error("invalid payload: {0}")]
    Invalid(#[from] ValidationErrors),
}

impl StorageError {
    /// Construct an unavailable error from any backend failure.
    pub fn unavailable(message: String, source: impl Error + Send + Sync + 'static) -> Self {
        StorageError::Unavailable {
            message,
            source: Box::new(source),
        }
    }

    /// Construct a not-found error for the given resource description.
    pub fn not_found(resource: impl Into<String>) -> Self {
        StorageError::NotFound {
            resource: resource.into(),
        }
    }

    /// Whether the error is a not-found race rather than a real failure.
    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound { .. })
    }
}
