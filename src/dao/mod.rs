/// Persistence gateway abstraction and its backends.
pub mod gateway;
/// Persisted row definitions.
pub mod models;
/// Backend-agnostic storage errors.
pub mod storage;
