use bytes::Bytes;
use serde::Serialize;

use crate::runtime::registry::RegistryStats;

/// A completed task's result artifact.
#[derive(Debug, Clone)]
pub struct TaskResult {
    /// Stored artifact name, `<task_id>_upscaled_<filename>`.
    pub filename: String,
    pub content_type: &'static str,
    pub bytes: Bytes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub removed_files: usize,
}

/// Point-in-time counters for the service.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceStats {
    pub tasks: RegistryStats,
    pub active_jobs: usize,
    pub free_worker_slots: usize,
    pub queue_capacity_remaining: usize,
    pub engine_loaded: bool,
    /// Whether terminal tasks are evicted automatically.
    pub reaper_enabled: bool,
}
