//! Request / response bodies of the HTTP API.

use serde::Serialize;
use upscaled_core::TaskStatusView;
use utoipa::ToSchema;
use uuid::Uuid;

#[derive(Debug, Serialize, ToSchema)]
pub struct SubmitResponse {
    pub task_id: Uuid,
    pub message: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct TaskStatusResponse {
    pub task_id: Uuid,
    /// `queued`, `processing`, `completed` or `error`.
    pub status: String,
    /// One of 0, 25, 50, 75, 100.
    pub progress: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl From<TaskStatusView> for TaskStatusResponse {
    fn from(view: TaskStatusView) -> Self {
        Self {
            task_id: view.task_id,
            status: view.status.to_string(),
            progress: view.progress,
            error: view.error,
            error_kind: view.error_kind.map(|k| k.to_string()),
            created_at: view.created_at.to_rfc3339(),
            updated_at: view.updated_at.to_rfc3339(),
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub struct CleanupResponse {
    pub message: String,
    pub removed_files: usize,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ModelStatusResponse {
    pub loaded: bool,
}
