//! Public-facing API facade for upscaled-core.
//!
//! Everything a transport layer needs is reachable from [`Service`]; the
//! registry, store, scheduler and engine pool stay private.
//!
//! # Quick-start
//!
//! ```rust,no_run
//! use bytes::Bytes;
//! use upscaled_core::api::{self, Service};
//! use upscaled_core::engine::candle::{self, ModelConfig};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), upscaled_core::RuntimeError> {
//! let service = Service::start(api::Config::default(), candle::loader(ModelConfig::default())).await?;
//!
//! let png = std::fs::read("cat.png").unwrap();
//! let task_id = service.submit_task(Bytes::from(png), "cat.png").await?;
//!
//! // ... poll until completed ...
//! let status = service.get_status(task_id)?;
//! println!("{} {}%", status.status, status.progress);
//! # Ok(())
//! # }
//! ```

mod types;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::engine::{Engine, EngineLoader};
use crate::runtime::reaper;
use crate::runtime::registry::TaskRegistry;
use crate::runtime::scheduler::{JobScheduler, SchedulerConfig, run_blocking};
use crate::runtime::store::{ArtifactKind, FileStore, StoreError, allowed_extension, sanitize_filename};
use crate::runtime::types::{TaskStatus, TaskStatusView, error_chain};

pub use crate::runtime::types::{ErrorKind, RuntimeError, TaskId};
pub use types::{CleanupReport, ServiceStats, TaskResult};

/// Default upload limit: 16 MiB.
pub const DEFAULT_MAX_UPLOAD_BYTES: usize = 16 * 1024 * 1024;

// ── Configuration ──────────────────────────────────────────────────────────────

/// Configuration passed to [`Service::start`].
///
/// All fields have sensible defaults via [`Default`].
#[derive(Debug, Clone)]
pub struct Config {
    /// Root of the `uploads/` and `outputs/` storage areas.
    pub data_dir: PathBuf,
    pub max_upload_bytes: usize,
    /// Jobs that may wait for a worker slot. Defaults to `64`.
    pub queue_capacity: usize,
    /// Jobs running at once. Defaults to `2`.
    pub max_workers: usize,
    /// Independent engine instances, each on its own thread. Defaults to `1`.
    pub engine_instances: usize,
    /// Requests that may wait for an engine instance. Defaults to `32`.
    pub engine_queue_capacity: usize,
    /// Per-job deadline covering the input read and inference, not the final
    /// write of the result. Defaults to five minutes.
    pub job_timeout: Duration,
    /// Age after which terminal tasks are evicted; `None` keeps them until
    /// [`Service::cleanup`] is called.
    pub task_ttl: Option<Duration>,
    pub reap_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("."),
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
            queue_capacity: 64,
            max_workers: 2,
            engine_instances: 1,
            engine_queue_capacity: 32,
            job_timeout: Duration::from_secs(300),
            task_ttl: None,
            reap_interval: Duration::from_secs(60),
        }
    }
}

// ── Service ────────────────────────────────────────────────────────────────────

struct ServiceInner {
    config: Config,
    registry: Arc<TaskRegistry>,
    store: Arc<FileStore>,
    engine: Arc<Engine>,
    scheduler: JobScheduler,
    reaper: Option<JoinHandle<()>>,
}

impl Drop for ServiceInner {
    fn drop(&mut self) {
        self.scheduler.shutdown();
        if let Some(reaper) = self.reaper.take() {
            reaper.abort();
        }
    }
}

/// Handle to a running upscaling service. Cheap to clone.
#[derive(Clone)]
pub struct Service {
    inner: Arc<ServiceInner>,
}

impl std::fmt::Debug for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Service")
            .field("config", &self.inner.config)
            .field("engine", &self.inner.engine)
            .finish()
    }
}

impl Service {
    /// Open the storage areas, load the engine and start the scheduler.
    ///
    /// An engine that fails to load does not fail startup: the service runs
    /// degraded, [`engine_status`](Self::engine_status) reports `false` and
    /// submissions are rejected with [`RuntimeError::EngineUnavailable`].
    pub async fn start(config: Config, loader: EngineLoader) -> Result<Self, RuntimeError> {
        let data_dir = config.data_dir.clone();
        let store = Arc::new(run_blocking(move || FileStore::open(data_dir)).await??);
        info!(
            uploads = %store.uploads_dir().display(),
            outputs = %store.outputs_dir().display(),
            "storage ready"
        );

        let (instances, engine_queue) = (config.engine_instances, config.engine_queue_capacity);
        let engine = Arc::new(
            tokio::task::spawn_blocking(move || Engine::load(loader, instances, engine_queue))
                .await
                .map_err(|e| RuntimeError::EngineUnavailable {
                    reason: format!("engine loader panicked: {e}"),
                })?,
        );

        let registry = Arc::new(TaskRegistry::new());
        let scheduler = JobScheduler::start(
            Arc::clone(&registry),
            Arc::clone(&store),
            Arc::clone(&engine),
            SchedulerConfig {
                queue_capacity: config.queue_capacity,
                max_workers: config.max_workers,
                job_timeout: config.job_timeout,
            },
        );

        let reaper = config.task_ttl.map(|ttl| {
            reaper::spawn(
                Arc::clone(&registry),
                Arc::clone(&store),
                ttl,
                config.reap_interval,
            )
        });

        Ok(Self {
            inner: Arc::new(ServiceInner {
                config,
                registry,
                store,
                engine,
                scheduler,
                reaper,
            }),
        })
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Validate an upload, persist it and queue it for upscaling.
    ///
    /// Validation, engine availability and queue admission are checked before
    /// anything is created; failures after that are recorded on the task.
    pub async fn submit_task(&self, bytes: Bytes, filename: &str) -> Result<TaskId, RuntimeError> {
        let inner = &self.inner;

        if filename.trim().is_empty() {
            return Err(RuntimeError::Validation("no file selected".into()));
        }
        let ext = allowed_extension(filename).ok_or_else(|| RuntimeError::InvalidFileType {
            filename: filename.to_owned(),
        })?;
        if bytes.is_empty() {
            return Err(RuntimeError::Validation("uploaded file is empty".into()));
        }
        if bytes.len() > inner.config.max_upload_bytes {
            return Err(RuntimeError::PayloadTooLarge {
                size: bytes.len(),
                limit: inner.config.max_upload_bytes,
            });
        }
        if let Some(reason) = inner.engine.unavailable_reason() {
            return Err(RuntimeError::EngineUnavailable { reason });
        }

        let admission = inner.scheduler.reserve()?;

        let mut stored_name = sanitize_filename(filename);
        if allowed_extension(&stored_name).is_none() {
            stored_name = format!("image.{ext}");
        }

        let task_id = inner.registry.create()?;
        info!(%task_id, filename = %stored_name, size = bytes.len(), "task submitted");

        let store = Arc::clone(&inner.store);
        let saved = run_blocking(move || {
            store
                .save(task_id, ArtifactKind::Input, &stored_name, &bytes)
                .map_err(RuntimeError::from)
        })
        .await
        .and_then(|r| r);

        let queued = saved.and_then(|input_path| {
            inner
                .registry
                .update(task_id, |t| {
                    t.input_path = Some(input_path.clone());
                    Ok(())
                })?;
            admission.dispatch(task_id, input_path)
        });

        if let Err(e) = queued {
            warn!(%task_id, error = %e, "failed to queue task");
            match inner.registry.update(task_id, |t| t.fail(e)) {
                Ok(()) => {}
                Err(RuntimeError::TaskNotFound { .. }) => self.purge_quietly(task_id).await,
                Err(err) => return Err(err),
            }
        }
        Ok(task_id)
    }

    pub fn get_status(&self, task_id: TaskId) -> Result<TaskStatusView, RuntimeError> {
        self.inner.registry.get(task_id).map(|t| t.view())
    }

    pub async fn get_result(&self, task_id: TaskId) -> Result<TaskResult, RuntimeError> {
        let task = self.inner.registry.get(task_id)?;
        if task.status != TaskStatus::Completed {
            return Err(RuntimeError::TaskNotCompleted {
                task_id,
                status: task.status,
            });
        }
        let output_path = task
            .output_path
            .ok_or(RuntimeError::ArtifactMissing { task_id })?;

        let store = Arc::clone(&self.inner.store);
        let path = output_path.clone();
        let bytes = run_blocking(move || store.read(&path))
            .await?
            .map_err(|e| match e {
                StoreError::Missing { .. } => RuntimeError::ArtifactMissing { task_id },
                e => RuntimeError::from(e),
            })?;

        let filename = output_path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
            .to_owned();
        let content_type = match allowed_extension(&filename).as_deref() {
            Some("png") => "image/png",
            Some(_) => "image/jpeg",
            None => "application/octet-stream",
        };
        Ok(TaskResult {
            filename,
            content_type,
            bytes: Bytes::from(bytes),
        })
    }

    /// Delete the task and every artifact it owns.
    ///
    /// Accepted in any state; a running job is signalled to stop.
    pub async fn cleanup(&self, task_id: TaskId) -> Result<CleanupReport, RuntimeError> {
        let task = self.inner.registry.delete(task_id)?;
        let store = Arc::clone(&self.inner.store);
        let removed_files = run_blocking(move || store.purge(task_id)).await??;
        info!(%task_id, status = %task.status, removed_files, "task cleaned up");
        Ok(CleanupReport { removed_files })
    }

    pub fn engine_status(&self) -> bool {
        self.inner.engine.is_loaded()
    }

    /// Re-run the engine loader; on failure the current state is kept.
    pub async fn reload_engine(&self) -> Result<(), RuntimeError> {
        let engine = Arc::clone(&self.inner.engine);
        run_blocking(move || engine.reload())
            .await?
            .map_err(|e| RuntimeError::EngineUnavailable {
                reason: error_chain(&e),
            })
    }

    pub fn stats(&self) -> Result<ServiceStats, RuntimeError> {
        let scheduler = &self.inner.scheduler;
        Ok(ServiceStats {
            tasks: self.inner.registry.stats()?,
            active_jobs: scheduler.active_jobs(),
            free_worker_slots: scheduler.free_slots(),
            queue_capacity_remaining: scheduler.queue_remaining(),
            engine_loaded: self.engine_status(),
            reaper_enabled: self.inner.reaper.is_some(),
        })
    }

    async fn purge_quietly(&self, task_id: TaskId) {
        let store = Arc::clone(&self.inner.store);
        if let Ok(Err(e)) = run_blocking(move || store.purge(task_id)).await {
            warn!(%task_id, error = %e, "failed to purge artifacts");
        }
    }
}
