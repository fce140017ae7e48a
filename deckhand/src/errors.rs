use crate::api::models::errors::ApiError;
use crate::types::Capability;
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error as ThisError;

#[derive(ThisError, Debug)]
pub enum Error {
    /// Malformed or contradictory request, rejected before any state change
    #[error("{message}")]
    Validation { message: String },

    /// A concurrent transition is in flight, or the entity is in a state that forbids this one
    #[error("Conflict: {message}")]
    Conflict { message: String },

    /// Caller lacks the capability the operation requires
    #[error("Insufficient permissions to {required} {resource}")]
    InsufficientPermissions { required: Capability, resource: String },

    /// Tier or usage limit
    #[error("Quota exceeded: {reason}")]
    QuotaExceeded { reason: String },

    /// External driver failure reported synchronously
    #[error("Provisioning of {resource} failed: {message}")]
    Provisioning { resource: String, message: String },

    /// Requested entity not found
    #[error("{resource} with ID {id} not found")]
    NotFound { resource: String, id: String },

    /// Invariant violation or other internal failure
    #[error("Failed to {operation}")]
    Internal { operation: String },

    /// Unexpected error with full context chain
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn validation(message: impl Into<String>) -> Self {
        Error::Validation { message: message.into() }
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Error::Conflict { message: message.into() }
    }

    pub fn not_found(resource: impl Into<String>, id: impl ToString) -> Self {
        Error::NotFound {
            resource: resource.into(),
            id: id.to_string(),
        }
    }

    /// Report a broken invariant. These are bugs, so they are logged loudly where they are detected.
    pub fn invariant(operation: impl Into<String>) -> Self {
        let operation = operation.into();
        tracing::error!(operation = %operation, "Invariant violation");
        Error::Internal { operation }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::Validation { .. } => StatusCode::BAD_REQUEST,
            Error::Conflict { .. } => StatusCode::CONFLICT,
            Error::InsufficientPermissions { .. } => StatusCode::FORBIDDEN,
            Error::QuotaExceeded { .. } => StatusCode::FORBIDDEN,
            Error::Provisioning { .. } => StatusCode::BAD_GATEWAY,
            Error::NotFound { .. } => StatusCode::NOT_FOUND,
            Error::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Error::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Returns a user-safe error message, without leaking internal implementation details
    pub fn user_message(&self) -> String {
        match self {
            Error::Validation { message } => message.clone(),
            Error::Conflict { message } => message.clone(),
            Error::InsufficientPermissions { required, resource } => {
                format!("Insufficient permissions to {required} {resource}")
            }
            Error::QuotaExceeded { reason } => reason.clone(),
            Error::Provisioning { resource, message } => format!("Provisioning of {resource} failed: {message}"),
            Error::NotFound { resource, id } => format!("{resource} with ID {id} not found"),
            Error::Internal { .. } | Error::Other(_) => "Internal server error".to_string(),
        }
    }
}

impl From<&Error> for ApiError {
    fn from(err: &Error) -> Self {
        ApiError {
            message: err.user_message(),
            status_code: err.status_code().as_u16(),
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        // Log full error details for debugging - different log levels based on severity
        match &self {
            Error::Internal { .. } | Error::Other(_) => {
                tracing::error!("Internal service error: {:#}", self);
            }
            Error::Provisioning { .. } => {
                tracing::warn!("Provisioning error: {}", self);
            }
            Error::InsufficientPermissions { .. } | Error::QuotaExceeded { .. } => {
                tracing::info!("Authorization error: {}", self);
            }
            Error::Validation { .. } | Error::NotFound { .. } => {
                tracing::debug!("Client error: {}", self);
            }
            Error::Conflict { .. } => {
                tracing::warn!("Conflict error: {}", self);
            }
        }

        let status = self.status_code();
        (status, Json(ApiError::from(&self))).into_response()
    }
}
