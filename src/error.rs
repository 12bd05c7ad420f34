use thiserror::Error;

use crate::{
    dao::storage::StorageError,
    platform::PlatformError,
    services::mutator::MutationError,
    state::{AbortError, ApplyError, PlanError},
};

/// Errors surfaced by orchestrator operations to the triggering caller.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// The primary store write or read failed; the transition was abandoned.
    #[error("primary store failure: {0}")]
    Storage(#[from] StorageError),
    /// A platform call failed.
    #[error("platform failure: {0}")]
    Platform(#[from] PlatformError),
    /// The caller may not perform the operation.
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    /// Invalid input provided by the caller.
    #[error("invalid input: {0}")]
    InvalidInput(String),
    /// Operation cannot be performed in the current state.
    #[error("invalid state: {0}")]
    InvalidState(String),
    /// Requested resource was not found.
    #[error("not found: {0}")]
    NotFound(String),
    /// Operation exceeded its timeout limit.
    #[error("operation timed out")]
    Timeout,
    /// The platform rate limit prevented the edit, even without rename.
    #[error("rate limited")]
    RateLimited,
}

impl From<MutationError> for ServiceError {
    fn from(err: MutationError) -> Self {
        match err {
            MutationError::RateLimited => ServiceError::RateLimited,
            MutationError::NotFound(room) => ServiceError::NotFound(format!("room `{room}`")),
            MutationError::Platform(source) => ServiceError::Platform(source),
        }
    }
}

impl From<PlanError> for ServiceError {
    fn from(err: PlanError) -> Self {
        match err {
            PlanError::AlreadyPending => {
                ServiceError::InvalidState("room transition already pending".into())
            }
            PlanError::InvalidTransition(invalid) => {
                ServiceError::InvalidState(invalid.to_string())
            }
        }
    }
}

impl From<ApplyError> for ServiceError {
    fn from(err: ApplyError) -> Self {
        match err {
            ApplyError::NoPending => ServiceError::InvalidState("no transition is pending".into()),
            ApplyError::IdMismatch { .. } => {
                ServiceError::InvalidState("pending transition does not match".into())
            }
            ApplyError::PhaseMismatch { expected, actual } => ServiceError::InvalidState(format!(
                "room changed during transition (expected {expected:?}, got {actual:?})"
            )),
        }
    }
}

impl From<AbortError> for ServiceError {
    fn from(err: AbortError) -> Self {
        match err {
            AbortError::NoPending => ServiceError::InvalidState("no pending transition".into()),
            AbortError::IdMismatch { .. } => {
                ServiceError::InvalidState("transition plan does not match".into())
            }
        }
    }
}
