use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error as ThisError;

#[derive(ThisError, Debug)]
pub enum Error {
    /// Malformed or missing required fields in an inbound event
    #[error("{message}")]
    Validation { message: String },

    /// The external voice channel failed to connect or dropped
    #[error("voice channel failure: {message}")]
    Channel { message: String },

    /// A write or read against the ledger/heartbeat store failed
    #[error("persistence failure: {0}")]
    Persistence(#[source] anyhow::Error),

    /// Provider billing fetch or batch update failed; the whole run is reported failed
    #[error("reconciliation failed: {message}")]
    Reconciliation { message: String },

    /// Unexpected error with full context chain
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    pub fn validation(message: impl Into<String>) -> Self {
        Error::Validation { message: message.into() }
    }

    pub fn channel(message: impl Into<String>) -> Self {
        Error::Channel { message: message.into() }
    }

    pub fn persistence(err: impl Into<anyhow::Error>) -> Self {
        Error::Persistence(err.into())
    }

    pub fn reconciliation(message: impl Into<String>) -> Self {
        Error::Reconciliation { message: message.into() }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::Validation { .. } => StatusCode::BAD_REQUEST,
            Error::Channel { .. } => StatusCode::BAD_GATEWAY,
            Error::Persistence(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Error::Reconciliation { .. } => StatusCode::BAD_GATEWAY,
            Error::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Returns a user-safe error message, without leaking internal implementation details
    pub fn user_message(&self) -> String {
        match self {
            Error::Validation { message } => message.clone(),
            Error::Channel { .. } => "Voice channel unavailable".to_string(),
            Error::Persistence(_) => "Internal server error".to_string(),
            Error::Reconciliation { message } => message.clone(),
            Error::Other(_) => "Internal server error".to_string(),
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        // Log full error details for debugging - different log levels based on severity
        match &self {
            Error::Persistence(_) | Error::Other(_) => {
                tracing::error!("Internal service error: {:#}", self);
            }
            Error::Channel { .. } | Error::Reconciliation { .. } => {
                tracing::warn!("Upstream error: {}", self);
            }
            Error::Validation { .. } => {
                tracing::debug!("Client error: {}", self);
            }
        }

        (self.status_code(), self.user_message()).into_response()
    }
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        Error::Persistence(anyhow::Error::from(err))
    }
}

/// Type alias for service operation results
pub type Result<T> = std::result::Result<T, Error>;
