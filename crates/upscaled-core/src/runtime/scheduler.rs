use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::engine::{Engine, EngineError};
use crate::runtime::admission::WorkerSlots;
use crate::runtime::registry::TaskRegistry;
use crate::runtime::store::FileStore;
use crate::runtime::types::{RuntimeError, TaskId, progress};

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Jobs that may wait for a worker slot before submissions are refused.
    pub queue_capacity: usize,
    /// Jobs allowed to run at once.
    pub max_workers: usize,
    /// Deadline for reading the upload and running inference, measured from
    /// the moment a job gets a worker slot. Writing the result to the output
    /// directory happens after the deadline check and is not bounded by it.
    pub job_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 64,
            max_workers: 2,
            job_timeout: Duration::from_secs(300),
        }
    }
}

#[derive(Debug)]
struct Job {
    task_id: TaskId,
    input_path: PathBuf,
    output_path: PathBuf,
    cancel_rx: watch::Receiver<bool>,
}

#[derive(Debug, Clone)]
struct JobContext {
    registry: Arc<TaskRegistry>,
    store: Arc<FileStore>,
    engine: Arc<Engine>,
    job_timeout: Duration,
    active: Arc<AtomicUsize>,
}

/// Bounded admission queue in front of a fixed number of worker slots.
///
/// Submitting never blocks: either a queue slot is reserved immediately or the
/// caller gets [`RuntimeError::Busy`]. A background loop takes a worker slot,
/// then the next queued job, and runs it on its own tokio task.
#[derive(Debug, Clone)]
pub struct JobScheduler {
    tx: mpsc::Sender<Job>,
    slots: WorkerSlots,
    config: SchedulerConfig,
    ctx: JobContext,
}

/// A reserved place in the admission queue. Dropping it without calling
/// [`dispatch`](Self::dispatch) gives the place back.
#[derive(Debug)]
pub struct Admission {
    permit: mpsc::OwnedPermit<Job>,
    registry: Arc<TaskRegistry>,
    store: Arc<FileStore>,
}

impl Admission {
    /// Enqueue the job for `task_id`, whose input is already on disk.
    pub fn dispatch(self, task_id: TaskId, input_path: PathBuf) -> Result<(), RuntimeError> {
        let output_path = self.store.output_path_for(task_id, &input_path)?;
        let cancel_rx = self.registry.subscribe_cancel(task_id)?;
        self.permit.send(Job {
            task_id,
            input_path,
            output_path,
            cancel_rx,
        });
        debug!(%task_id, "job queued");
        Ok(())
    }
}

impl JobScheduler {
    /// Start the dispatch loop. Must be called from within a tokio runtime.
    pub fn start(
        registry: Arc<TaskRegistry>,
        store: Arc<FileStore>,
        engine: Arc<Engine>,
        config: SchedulerConfig,
    ) -> Self {
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let slots = WorkerSlots::new(config.max_workers.max(1));
        let ctx = JobContext {
            registry,
            store,
            engine,
            job_timeout: config.job_timeout,
            active: Arc::new(AtomicUsize::new(0)),
        };

        tokio::spawn(Self::run_loop(rx, slots.clone(), ctx.clone()));
        info!(
            queue_capacity = config.queue_capacity,
            max_workers = config.max_workers,
            job_timeout_secs = config.job_timeout.as_secs(),
            "job scheduler started"
        );

        Self {
            tx,
            slots,
            config,
            ctx,
        }
    }

    /// Reserve a place in the admission queue without waiting.
    pub fn reserve(&self) -> Result<Admission, RuntimeError> {
        match self.tx.clone().try_reserve_owned() {
            Ok(permit) => Ok(Admission {
                permit,
                registry: Arc::clone(&self.ctx.registry),
                store: Arc::clone(&self.ctx.store),
            }),
            Err(TrySendError::Full(_)) => Err(RuntimeError::Busy {
                capacity: self.config.queue_capacity,
            }),
            Err(TrySendError::Closed(_)) => Err(RuntimeError::Shutdown),
        }
    }

    /// Places left in the admission queue.
    pub fn queue_remaining(&self) -> usize {
        self.tx.capacity()
    }

    pub fn active_jobs(&self) -> usize {
        self.ctx.active.load(Ordering::SeqCst)
    }

    pub fn free_slots(&self) -> usize {
        self.slots.capacity().saturating_sub(self.active_jobs())
    }

    /// Stop dispatching. Running jobs finish; queued ones are dropped.
    pub fn shutdown(&self) {
        self.slots.close();
    }

    async fn run_loop(mut rx: mpsc::Receiver<Job>, slots: WorkerSlots, ctx: JobContext) {
        loop {
            // Take the slot first so a job only leaves the queue when it can
            // start right away.
            let Ok(permit) = slots.acquire().await else {
                break;
            };
            let Some(job) = rx.recv().await else {
                break;
            };

            let ctx = ctx.clone();
            ctx.active.fetch_add(1, Ordering::SeqCst);
            debug!(task_id = %job.task_id, idle_slots = slots.available(), "job dispatched");
            tokio::spawn(async move {
                let active = Arc::clone(&ctx.active);
                Self::supervise(job, ctx).await;
                active.fetch_sub(1, Ordering::SeqCst);
                drop(permit);
            });
        }
        debug!("job scheduler loop exited");
    }

    async fn supervise(job: Job, ctx: JobContext) {
        let task_id = job.task_id;
        let span = info_span!("task", %task_id);
        async move {
            match Self::run_pipeline(&job, &ctx).await {
                Ok(()) => info!("task completed"),
                Err(RuntimeError::Cancelled { .. } | RuntimeError::TaskNotFound { .. }) => {
                    info!("task cleaned up while running; discarding its artifacts");
                    Self::purge(&ctx, task_id).await;
                }
                Err(e) => {
                    warn!(error = %e, kind = %e.kind(), "task failed");
                    match ctx.registry.update(task_id, |t| t.fail(e)) {
                        Ok(()) => {}
                        Err(RuntimeError::TaskNotFound { .. }) => Self::purge(&ctx, task_id).await,
                        Err(err) => error!(error = %err, "failed to record task error"),
                    }
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn run_pipeline(job: &Job, ctx: &JobContext) -> Result<(), RuntimeError> {
        let task_id = job.task_id;
        let deadline = Instant::now() + ctx.job_timeout;

        let output = tokio::time::timeout_at(deadline, Self::infer(job, ctx))
            .await
            .map_err(|_| RuntimeError::Timeout {
                timeout: ctx.job_timeout,
            })??;

        let store = Arc::clone(&ctx.store);
        let output_path = job.output_path.clone();
        run_blocking(move || store.write(&output_path, &output)).await??;

        ctx.registry
            .update(task_id, |t| t.complete(job.output_path.clone()))?;
        debug!(progress = progress::DONE, "progress");
        Ok(())
    }

    /// Everything up to and including the transform; bounded by the deadline.
    async fn infer(job: &Job, ctx: &JobContext) -> Result<Vec<u8>, RuntimeError> {
        let task_id = job.task_id;
        let advance = |checkpoint: u8| {
            ctx.registry.update(task_id, |t| t.advance(checkpoint))?;
            debug!(progress = checkpoint, "progress");
            Ok::<_, RuntimeError>(())
        };

        advance(progress::STARTED)?;

        let store = Arc::clone(&ctx.store);
        let input_path = job.input_path.clone();
        let input = run_blocking(move || store.read(&input_path)).await??;
        advance(progress::INPUT_LOADED)?;

        let handle = ctx.engine.handle()?;
        advance(progress::INFERENCE_STARTED)?;

        let mut cancel_rx = job.cancel_rx.clone();
        let output = tokio::select! {
            biased;
            _ = cancel_rx.wait_for(|cancelled| *cancelled) => {
                return Err(RuntimeError::Cancelled { task_id });
            }
            result = handle.upscale(Bytes::from(input), job.cancel_rx.clone()) => {
                result.map_err(|e| match e {
                    EngineError::Cancelled => RuntimeError::Cancelled { task_id },
                    e => RuntimeError::from(e),
                })?
            }
        };
        advance(progress::INFERENCE_FINISHED)?;
        Ok(output)
    }

    async fn purge(ctx: &JobContext, task_id: TaskId) {
        let store = Arc::clone(&ctx.store);
        match run_blocking(move || store.purge(task_id)).await {
            Ok(Ok(removed)) if removed > 0 => debug!(removed, "purged leftover artifacts"),
            Ok(Ok(_)) => {}
            Ok(Err(e)) => warn!(error = %e, "failed to purge artifacts"),
            Err(e) => warn!(error = %e, "failed to purge artifacts"),
        }
    }
}

/// Run blocking file I/O off the async workers.
pub(crate) async fn run_blocking<T, F>(f: F) -> Result<T, RuntimeError>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| RuntimeError::Storage {
            message: format!("blocking task failed: {e}"),
        })
}
