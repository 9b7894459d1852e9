//! Background reclamation of expired tasks and orphaned artifacts.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::runtime::registry::TaskRegistry;
use crate::runtime::store::FileStore;
use crate::runtime::types::RuntimeError;

/// Outcome of one reaper pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReapReport {
    pub evicted_tasks: usize,
    pub removed_files: usize,
}

/// Evict terminal tasks older than `ttl`, then purge artifacts no record owns.
pub fn reap_once(
    registry: &TaskRegistry,
    store: &FileStore,
    ttl: Duration,
) -> Result<ReapReport, RuntimeError> {
    let mut report = ReapReport::default();

    for task in registry.evict_expired(ttl, Utc::now())? {
        report.evicted_tasks += 1;
        report.removed_files += store.purge(task.id)?;
    }

    // List first, then consult the registry: a task created after the
    // listing cannot have its fresh upload swept.
    for task_id in store.artifact_task_ids()? {
        if !registry.contains(task_id) {
            report.removed_files += store.purge(task_id)?;
        }
    }

    Ok(report)
}

/// Run [`reap_once`] every `interval` until the handle is aborted.
pub fn spawn(
    registry: Arc<TaskRegistry>,
    store: Arc<FileStore>,
    ttl: Duration,
    interval: Duration,
) -> JoinHandle<()> {
    info!(ttl_secs = ttl.as_secs(), interval_secs = interval.as_secs(), "task reaper started");
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(10)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first tick completes immediately.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let registry = Arc::clone(&registry);
            let store = Arc::clone(&store);
            match tokio::task::spawn_blocking(move || reap_once(&registry, &store, ttl)).await {
                Ok(Ok(report)) if report != ReapReport::default() => info!(
                    evicted_tasks = report.evicted_tasks,
                    removed_files = report.removed_files,
                    "reaper pass"
                ),
                Ok(Ok(_)) => debug!("reaper pass: nothing to do"),
                Ok(Err(e)) => warn!(error = %e, "reaper pass failed"),
                Err(e) => warn!(error = %e, "reaper task panicked"),
            }
        }
    })
}
