//! Shared application state injected into every Axum handler.

use std::sync::Arc;

use upscaled_core::api::Service;

use crate::config::Config;

/// State shared across all HTTP handlers.
#[derive(Clone, Debug)]
pub struct AppState {
    /// Server configuration (env-derived).
    pub config: Arc<Config>,
    /// The upscaling service: tasks, storage, scheduler and engine.
    pub service: Service,
}
