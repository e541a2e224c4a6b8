use std::time::Duration;

use crate::response::ApiResponse;

/// Failure of the underlying network layer, before any HTTP status exists.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TransportError {
    #[error("request timed out: {0}")]
    Timeout(String),
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("transport error: {0}")]
    Other(String),
}

/// The last retryable failure observed by the executor, kept verbatim so the
/// caller sees exactly what the API (or the network) said.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CallFailure {
    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error(transparent)]
    Transport(#[from] TransportError),
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Rate limit exceeded for bucket '{bucket}' after {attempts} acquisition attempts")]
    RateLimitExceeded { bucket: String, attempts: u32 },

    #[error("Request failed after {attempts} attempts: {last}")]
    RequestFailed {
        attempts: u32,
        #[source]
        last: CallFailure,
    },

    #[error("Client error {status}")]
    Client {
        status: u16,
        response: Box<ApiResponse>,
    },

    #[error("Call timed out after {0:?}")]
    Timeout(Duration),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Shared store error: {0}")]
    Store(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<validator::ValidationErrors> for Error {
    fn from(err: validator::ValidationErrors) -> Self {
        Error::Config(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
