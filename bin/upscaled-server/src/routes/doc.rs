use axum::Json;
use utoipa::OpenApi;

use crate::routes::{engine, health, tasks, upscale};

#[derive(OpenApi)]
#[openapi(info(
    title = "upscaled-server",
    description = "4x image super-resolution API",
    version = "0.1.0",
))]
pub struct ApiDoc;

pub fn get_docs() -> utoipa::openapi::OpenApi {
    let mut root = ApiDoc::openapi();
    root.merge(health::HealthApi::openapi());
    root.merge(upscale::UpscaleApi::openapi());
    root.merge(tasks::TasksApi::openapi());
    root.merge(engine::EngineApi::openapi());
    root
}

/// `GET /api-docs/openapi.json`
pub async fn openapi_json() -> Json<utoipa::openapi::OpenApi> {
    Json(get_docs())
}
