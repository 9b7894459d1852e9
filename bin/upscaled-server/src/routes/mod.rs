//! Axum router construction.
//!
//! [`build`] assembles the complete application router:
//! - Per-request trace-ID middleware
//! - OpenAPI document at `/api-docs/openapi.json`
//! - Health / heartbeat route
//! - The upscaling API under `/api`

pub mod doc;
mod engine;
mod health;
mod tasks;
mod upscale;

use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::routing::get;
use axum::{Router, middleware};

use crate::middleware::trace;
use crate::state::AppState;

/// Headroom on top of the upload limit for multipart boundaries and headers.
const MULTIPART_OVERHEAD: usize = 64 * 1024;

/// Build the complete Axum [`Router`] for the application.
pub fn build(state: Arc<AppState>) -> Router {
    let api_router = Router::new()
        .merge(upscale::router())
        .merge(tasks::router())
        .merge(engine::router());

    Router::new()
        .merge(health::router())
        .route("/api-docs/openapi.json", get(doc::openapi_json))
        .nest("/api", api_router)
        .layer(DefaultBodyLimit::max(
            state.config.max_upload_bytes.saturating_add(MULTIPART_OVERHEAD),
        ))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            trace::trace_middleware,
        ))
        .with_state(state)
}
