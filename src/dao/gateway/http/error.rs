//! Error types shared by the REST persistence backend.

use reqwest::StatusCode;
use thiserror::Error;

use crate::dao::storage::StorageError;

/// Convenient result alias returning [`HttpDaoError`] failures.
pub type HttpResult<T> = Result<T, HttpDaoError>;

/// Failures that can occur while talking to the CRUD API.
#[derive(Debug, Error)]
pub enum HttpDaoError {
    /// Required environment variable is missing.
    #[error("missing API environment variable `{var}`")]
    MissingEnvVar { var: &'static str },
    /// Building the HTTP client failed (invalid TLS setup, etc).
    #[error("failed to build API client")]
    ClientBuilder {
        #[source]
        source: reqwest::Error,
    },
    /// The configured API root cannot carry path segments.
    #[error("invalid API base URL `{url}`")]
    InvalidBaseUrl { url: String },
    /// A request could not be sent.
    #[error("failed to send API request to `{path}`")]
    RequestSend {
        path: String,
        #[source]
        source: reqwest::Error,
    },
    /// The API answered 404.
    #[error("API resource `{path}` not found")]
    NotFound { path: String },
    /// The API refused the payload (4xx other than 404).
    #[error("API rejected `{path}` with status {status}: {body}")]
    Rejected {
        path: String,
        status: StatusCode,
        body: String,
    },
    /// The API returned a server error.
    #[error("unexpected API response status {status} for `{path}`")]
    RequestStatus { path: String, status: StatusCode },
    /// Response payload could not be parsed into JSON.
    #[error("failed to decode API response for `{path}`")]
    DecodeResponse {
        path: String,
        #[source]
        source: reqwest::Error,
    },
}

impl From<HttpDaoError> for StorageError {
    fn from(err: HttpDaoError) -> Self {
        match err {
            HttpDaoError::NotFound { path } => StorageError::not_found(path),
            HttpDaoError::Rejected { .. } => StorageError::Rejected {
                message: err.to_string(),
            },
            other => StorageError::unavailable(other.to_string(), other),
        }
    }
}
