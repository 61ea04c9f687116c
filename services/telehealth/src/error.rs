//! Error taxonomy for the telehealth core

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use common::error::DatabaseError;
use serde_json::json;
use thiserror::Error;
use tracing::error;
use uuid::Uuid;

use crate::storage::StorageError;
use crate::video::ProviderError;

/// Errors surfaced by the session and recording state machines
#[derive(Error, Debug)]
pub enum TelehealthError {
    /// Entity missing
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// No usable consent on file, or consent explicitly not given
    #[error("Consent required: {0}")]
    ConsentRequired(String),

    /// Consent exists but is expired, unsigned or withdrawn at join time
    #[error("Consent invalid: {0}")]
    ConsentInvalid(String),

    #[error("Already in progress: {0}")]
    AlreadyInProgress(String),

    #[error("Recording {0} has already been deleted")]
    AlreadyDeleted(Uuid),

    /// Any other state-machine precondition violation
    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Missing or invalid bearer token
    #[error("Unauthorized")]
    Unauthorized,

    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// The session has no real media plane (mock room)
    #[error("Unsupported source: {0}")]
    UnsupportedSource(String),

    /// Network-classified provider failure
    #[error("Video provider unavailable: {0}")]
    ProviderUnavailable(String),

    #[error("Video provider error: {0}")]
    Provider(String),

    #[error("Storage failure: {0}")]
    StorageFailure(String),

    #[error(transparent)]
    Database(#[from] DatabaseError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl TelehealthError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        TelehealthError::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    /// Compliance and precondition failures carry an actionable message
    pub fn is_user_facing(&self) -> bool {
        matches!(
            self,
            TelehealthError::NotFound { .. }
                | TelehealthError::ConsentRequired(_)
                | TelehealthError::ConsentInvalid(_)
                | TelehealthError::AlreadyInProgress(_)
                | TelehealthError::AlreadyDeleted(_)
                | TelehealthError::InvalidState(_)
                | TelehealthError::InvalidInput(_)
                | TelehealthError::Unauthorized
                | TelehealthError::Forbidden(_)
                | TelehealthError::UnsupportedSource(_)
        )
    }

    fn status_code(&self) -> StatusCode {
        match self {
            TelehealthError::NotFound { .. } => StatusCode::NOT_FOUND,
            TelehealthError::ConsentRequired(_) | TelehealthError::ConsentInvalid(_) => {
                StatusCode::FORBIDDEN
            }
            TelehealthError::AlreadyInProgress(_)
            | TelehealthError::AlreadyDeleted(_)
            | TelehealthError::InvalidState(_) => StatusCode::CONFLICT,
            TelehealthError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            TelehealthError::Unauthorized => StatusCode::UNAUTHORIZED,
            TelehealthError::Forbidden(_) => StatusCode::FORBIDDEN,
            TelehealthError::UnsupportedSource(_) => StatusCode::UNPROCESSABLE_ENTITY,
            TelehealthError::ProviderUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            TelehealthError::Provider(_) => StatusCode::BAD_GATEWAY,
            TelehealthError::StorageFailure(_)
            | TelehealthError::Database(_)
            | TelehealthError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<ProviderError> for TelehealthError {
    fn from(err: ProviderError) -> Self {
        if err.is_network() {
            TelehealthError::ProviderUnavailable(err.to_string())
        } else {
            TelehealthError::Provider(err.to_string())
        }
    }
}

impl From<StorageError> for TelehealthError {
    fn from(err: StorageError) -> Self {
        TelehealthError::StorageFailure(err.to_string())
    }
}

impl IntoResponse for TelehealthError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        let body = if self.is_user_facing() {
            json!({ "error": self.to_string() })
        } else {
            let correlation_id = Uuid::new_v4();
            error!(%correlation_id, error = %self, "telehealth operation failed");
            json!({
                "error": "The telehealth operation failed. Please try again or contact support.",
                "correlationId": correlation_id,
            })
        };

        (status, Json(body)).into_response()
    }
}

/// Type alias for telehealth results
pub type TelehealthResult<T> = Result<T, TelehealthError>;
