//! Pre-stream turn errors.

use serde_json::Value;
use thiserror::Error;

use crate::ids::SessionId;
use crate::llm::error::ProviderError;
use crate::store::errors::StoreError;

/// Errors raised before a turn's event stream opens.
#[derive(Debug, Error)]
pub enum RelayError {
    /// Request content or model was rejected.
    #[error("{message}")]
    ValidationFailed {
        /// Summary.
        message: String,
        /// Per-field details.
        details: Option<Value>,
    },
    /// Session does not exist.
    #[error("session {0} not found")]
    NotFound(SessionId),
    /// Session belongs to another user.
    #[error("access to session {0} denied")]
    Forbidden(SessionId),
    /// Storage failure.
    #[error("store error: {0}")]
    Store(StoreError),
    /// Provider client could not be built.
    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),
}

impl RelayError {
    /// Validation failure for one field.
    #[must_use]
    pub fn invalid_field(field: &str, message: impl Into<String>) -> Self {
        let message = message.into();
        Self::ValidationFailed {
            details: Some(serde_json::json!([{ "field": field, "message": message }])),
            message: "Validation failed".to_string(),
        }
    }
}

impl From<StoreError> for RelayError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::SessionNotFound(id) => Self::NotFound(id),
            StoreError::AccessDenied(id) => Self::Forbidden(id),
            other => Self::Store(other),
        }
    }
}
