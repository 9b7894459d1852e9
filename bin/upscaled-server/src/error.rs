//! Unified server error type.
//!
//! Every handler returns `Result<T, ServerError>`, which implements
//! [`axum::response::IntoResponse`] so errors are converted to a JSON body of
//! the form `{"error": "...", "kind": "..."}` with an appropriate status code.
//!
//! Internal runtime errors (storage, inference, lock poisoning) are logged with full
//! detail but only a generic message is returned, so file paths never leak to
//! clients.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;
use tracing::error;
use upscaled_core::{ErrorKind, RuntimeError};

#[derive(Debug, Error)]
pub enum ServerError {
    /// Propagated from the upscaling service.
    #[error("runtime error: {0}")]
    Runtime(#[from] RuntimeError),

    /// The caller referenced a resource that does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The caller sent an invalid or malformed request.
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("payload too large: {0}")]
    PayloadTooLarge(String),
}

impl ServerError {
    fn status_and_kind(&self) -> (StatusCode, ErrorKind) {
        match self {
            ServerError::NotFound(_) => (StatusCode::NOT_FOUND, ErrorKind::TaskNotFound),
            ServerError::BadRequest(_) => (StatusCode::BAD_REQUEST, ErrorKind::Validation),
            ServerError::PayloadTooLarge(_) => (StatusCode::PAYLOAD_TOO_LARGE, ErrorKind::PayloadTooLarge),
            ServerError::Runtime(e) => {
                let kind = e.kind();
                let status = match kind {
                    ErrorKind::Validation | ErrorKind::InvalidFileType | ErrorKind::TaskNotCompleted => {
                        StatusCode::BAD_REQUEST
                    }
                    ErrorKind::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
                    ErrorKind::EngineUnavailable | ErrorKind::Busy => StatusCode::SERVICE_UNAVAILABLE,
                    ErrorKind::TaskNotFound | ErrorKind::ArtifactMissing => StatusCode::NOT_FOUND,
                    _ => StatusCode::INTERNAL_SERVER_ERROR,
                };
                (status, kind)
            }
        }
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let (status, kind) = self.status_and_kind();
        let client_message = match &self {
            ServerError::NotFound(m) | ServerError::BadRequest(m) | ServerError::PayloadTooLarge(m) => {
                m.clone()
            }
            ServerError::Runtime(e) if !status.is_server_error() => e.to_string(),
            ServerError::Runtime(RuntimeError::EngineUnavailable { reason }) => {
                error!(%reason, "request rejected: inference engine unavailable");
                "Model not loaded. Check the server logs, then POST /api/engine/reload".to_owned()
            }
            ServerError::Runtime(RuntimeError::Busy { capacity }) => {
                format!("Server busy: {capacity} jobs already queued, retry later")
            }
            ServerError::Runtime(e) => {
                error!(error = %e, "upscaling runtime error");
                "internal server error".to_owned()
            }
        };
        (status, Json(json!({ "error": client_message, "kind": kind }))).into_response()
    }
}
