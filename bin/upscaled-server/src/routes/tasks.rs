//! Per-task endpoints: progress polling, result download and cleanup.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::header;
use axum::response::IntoResponse;
use axum::routing::{delete, get};
use axum::{Json, Router};
use tracing::info;
use upscaled_core::TaskId;
use utoipa::OpenApi;

use crate::error::ServerError;
use crate::schemas::{CleanupResponse, TaskStatusResponse};
use crate::state::AppState;

#[derive(OpenApi)]
#[openapi(
    paths(get_progress, download, cleanup),
    components(schemas(TaskStatusResponse, CleanupResponse))
)]
pub struct TasksApi;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/progress/{task_id}", get(get_progress))
        .route("/download/{task_id}", get(download))
        .route("/cleanup/{task_id}", delete(cleanup))
}

/// Ids that do not parse can never name a task, so they are reported the
/// same way as unknown ones.
fn parse_task_id(raw: &str) -> Result<TaskId, ServerError> {
    TaskId::parse_str(raw).map_err(|_| ServerError::NotFound(format!("task not found: {raw}")))
}

#[utoipa::path(
    get,
    path = "/api/progress/{task_id}",
    tag = "tasks",
    params(("task_id" = String, Path, description = "Id returned by POST /api/upscale")),
    responses(
        (status = 200, description = "Current task state", body = TaskStatusResponse),
        (status = 404, description = "Task not found"),
    )
)]
pub async fn get_progress(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<String>,
) -> Result<Json<TaskStatusResponse>, ServerError> {
    let task_id = parse_task_id(&task_id)?;
    let view = state.service.get_status(task_id)?;
    Ok(Json(view.into()))
}

#[utoipa::path(
    get,
    path = "/api/download/{task_id}",
    tag = "tasks",
    params(("task_id" = String, Path, description = "Id of a completed task")),
    responses(
        (status = 200, description = "Upscaled image as an attachment", content_type = "image/png"),
        (status = 400, description = "Task not completed"),
        (status = 404, description = "Task or output file not found"),
    )
)]
pub async fn download(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<String>,
) -> Result<impl IntoResponse, ServerError> {
    let task_id = parse_task_id(&task_id)?;
    let result = state.service.get_result(task_id).await?;
    let disposition = format!("attachment; filename=\"{}\"", result.filename);
    Ok((
        [
            (header::CONTENT_TYPE, result.content_type.to_owned()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        result.bytes,
    ))
}

#[utoipa::path(
    delete,
    path = "/api/cleanup/{task_id}",
    tag = "tasks",
    params(("task_id" = String, Path, description = "Task to remove")),
    responses(
        (status = 200, description = "Task record and files removed", body = CleanupResponse),
        (status = 404, description = "Task not found"),
    )
)]
pub async fn cleanup(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<String>,
) -> Result<Json<CleanupResponse>, ServerError> {
    let task_id = parse_task_id(&task_id)?;
    let report = state.service.cleanup(task_id).await?;
    info!(%task_id, removed_files = report.removed_files, "cleanup requested over HTTP");
    Ok(Json(CleanupResponse {
        message: "Files cleaned up".into(),
        removed_files: report.removed_files,
    }))
}
