//! Model status, reload and service counters.

use std::sync::Arc;

use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{Value, json};
use tracing::info;
use upscaled_core::api::ServiceStats;
use utoipa::OpenApi;

use crate::error::ServerError;
use crate::schemas::ModelStatusResponse;
use crate::state::AppState;

#[derive(OpenApi)]
#[openapi(
    paths(model_status, reload, stats),
    components(schemas(ModelStatusResponse))
)]
pub struct EngineApi;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/model-status", get(model_status))
        .route("/engine/reload", post(reload))
        .route("/stats", get(stats))
}

#[utoipa::path(
    get,
    path = "/api/model-status",
    tag = "engine",
    responses((status = 200, description = "Whether the model is loaded", body = ModelStatusResponse))
)]
pub async fn model_status(State(state): State<Arc<AppState>>) -> Json<ModelStatusResponse> {
    Json(ModelStatusResponse {
        loaded: state.service.engine_status(),
    })
}

/// Re-read the weights and swap in a fresh engine pool.
///
/// On failure the current pool (if any) stays in service.
#[utoipa::path(
    post,
    path = "/api/engine/reload",
    tag = "engine",
    responses(
        (status = 200, description = "Engine reloaded", body = Value),
        (status = 503, description = "Reload failed"),
    )
)]
pub async fn reload(State(state): State<Arc<AppState>>) -> Result<Json<Value>, ServerError> {
    info!("engine reload requested");
    state.service.reload_engine().await?;
    Ok(Json(json!({ "loaded": true })))
}

#[utoipa::path(
    get,
    path = "/api/stats",
    tag = "engine",
    responses((status = 200, description = "Task counts and scheduler occupancy", body = Value))
)]
pub async fn stats(State(state): State<Arc<AppState>>) -> Result<Json<ServiceStats>, ServerError> {
    Ok(Json(state.service.stats()?))
}
