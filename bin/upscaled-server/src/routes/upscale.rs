//! Upload endpoint: accepts an image and starts an asynchronous upscale task.

use std::sync::Arc;

use axum::extract::multipart::MultipartError;
use axum::extract::{Multipart, State};
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use bytes::BytesMut;
use tracing::debug;
use upscaled_core::RuntimeError;
use utoipa::OpenApi;

use crate::error::ServerError;
use crate::schemas::SubmitResponse;
use crate::state::AppState;

/// Multipart field carrying the image.
const IMAGE_FIELD: &str = "image";

/// Part content types accepted when the client declares one.
const ALLOWED_CONTENT_TYPES: [&str; 3] = ["image/png", "image/jpeg", "image/jpg"];

#[derive(OpenApi)]
#[openapi(paths(upload), components(schemas(SubmitResponse)))]
pub struct UpscaleApi;

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/upscale", post(upload))
}

/// Submit an image for 4x upscaling (`POST /api/upscale`).
///
/// Expects `multipart/form-data` with a single `image` field whose filename
/// ends in `.png`, `.jpg` or `.jpeg`. Returns the task id immediately; poll
/// `GET /api/progress/{task_id}` until the task is `completed`.
#[utoipa::path(
    post,
    path = "/api/upscale",
    tag = "upscale",
    request_body(content_type = "multipart/form-data", description = "`image` file field"),
    responses(
        (status = 200, description = "Task accepted", body = SubmitResponse),
        (status = 400, description = "Missing file, empty filename or invalid file type"),
        (status = 413, description = "File too large"),
        (status = 503, description = "Model not loaded or queue full"),
    )
)]
pub async fn upload(
    State(state): State<Arc<AppState>>,
    mut multipart: Multipart,
) -> Result<Json<SubmitResponse>, ServerError> {
    let limit = state.config.max_upload_bytes;
    let mut upload = None;

    while let Some(mut field) = multipart.next_field().await.map_err(multipart_error)? {
        if field.name() != Some(IMAGE_FIELD) {
            debug!(field = ?field.name(), "ignoring unexpected multipart field");
            continue;
        }

        let filename = field.file_name().unwrap_or_default().to_owned();
        if let Some(content_type) = field.content_type()
            && !ALLOWED_CONTENT_TYPES.contains(&content_type)
        {
            return Err(RuntimeError::InvalidFileType { filename }.into());
        }

        let mut data = BytesMut::new();
        while let Some(chunk) = field.chunk().await.map_err(multipart_error)? {
            data.extend_from_slice(&chunk);
            if data.len() > limit {
                return Err(ServerError::PayloadTooLarge(format!(
                    "File too large: exceeds maximum of {limit} bytes"
                )));
            }
        }
        debug!(%filename, size_bytes = data.len(), "received image upload");
        upload = Some((filename, data.freeze()));
        break;
    }

    let (filename, data) =
        upload.ok_or_else(|| ServerError::BadRequest("No image file provided".into()))?;
    if filename.is_empty() {
        return Err(ServerError::BadRequest("No file selected".into()));
    }

    let task_id = state.service.submit_task(data, &filename).await?;
    Ok(Json(SubmitResponse {
        task_id,
        message: "Processing started".into(),
    }))
}

fn multipart_error(e: MultipartError) -> ServerError {
    if e.status() == StatusCode::PAYLOAD_TOO_LARGE {
        ServerError::PayloadTooLarge(e.body_text())
    } else {
        ServerError::BadRequest(format!("Failed to read multipart body: {}", e.body_text()))
    }
}
