use axum::{http::StatusCode, response::{IntoResponse, Response}, Json};
use serde::Serialize;
use thiserror::Error;
use zk_proofs::ZkError;

use crate::config::ConfigError;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    /// Well-formed request that was checked and rejected (failed proof, binding mismatch).
    #[error("rejected: {0}")]
    Unprocessable(String),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("internal error")]
    Internal,
}

impl From<ZkError> for ApiError {
    fn from(err: ZkError) -> Self {
        let msg = err.to_string();
        match err {
            ZkError::ProofInvalid { .. } | ZkError::BindingMismatch(_) | ZkError::WitnessUnsatisfiable { .. } => {
                ApiError::Unprocessable(msg)
            }
            ZkError::Malformed(_) | ZkError::Serialization(_) | ZkError::FixedPoint(_) => ApiError::BadRequest(msg),
            ZkError::DuplicateSubmission(_) | ZkError::MaskAlreadyRegistered(_) | ZkError::RoundPhase { .. } => {
                ApiError::Conflict(msg)
            }
            ZkError::UnknownClient(_) => ApiError::NotFound(msg),
            ZkError::Ark(_) => {
                tracing::error!(error = %msg, "proof backend failure");
                ApiError::Internal
            }
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, msg) = match &self {
            ApiError::BadRequest(m) => (StatusCode::BAD_REQUEST, m.clone()),
            ApiError::NotFound(m) => (StatusCode::NOT_FOUND, m.clone()),
            ApiError::Conflict(m) => (StatusCode::CONFLICT, m.clone()),
            ApiError::Unprocessable(m) => (StatusCode::UNPROCESSABLE_ENTITY, m.clone()),
            ApiError::Config(_) | ApiError::Internal => {
                (StatusCode::INTERNAL_SERVER_ERROR, "internal error".to_string())
            }
        };

        (status, Json(ErrorBody { error: msg })).into_response()
    }
}
