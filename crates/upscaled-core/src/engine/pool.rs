use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, PoisonError, RwLock};

use bytes::Bytes;
use tokio::sync::{oneshot, watch};
use tracing::{debug, error, info, warn};

use super::{EngineError, InferenceEngine};
use crate::runtime::types::error_chain;

/// Builds engine instance `n`. Called once per instance on every (re)load.
pub type EngineLoader = Arc<dyn Fn(usize) -> Result<InferenceEngine, EngineError> + Send + Sync>;

struct EngineRequest {
    input: Bytes,
    cancel_rx: watch::Receiver<bool>,
    reply_tx: oneshot::Sender<Result<Vec<u8>, EngineError>>,
}

/// Cheap, cloneable sender into a running engine pool.
#[derive(Clone)]
pub struct EngineHandle {
    tx: flume::Sender<EngineRequest>,
    instances: usize,
}

impl std::fmt::Debug for EngineHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineHandle")
            .field("instances", &self.instances)
            .field("queued", &self.tx.len())
            .finish()
    }
}

impl EngineHandle {
    /// Queue one image for upscaling and wait for the result.
    ///
    /// If `cancel_rx` reads `true` by the time a worker picks the request up
    /// (or this future has been dropped) the request is skipped.
    pub async fn upscale(
        &self,
        input: Bytes,
        cancel_rx: watch::Receiver<bool>,
    ) -> Result<Vec<u8>, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send_async(EngineRequest {
                input,
                cancel_rx,
                reply_tx,
            })
            .await
            .map_err(|_| EngineError::Shutdown)?;
        reply_rx.await.map_err(|_| EngineError::Shutdown)?
    }

    pub fn instances(&self) -> usize {
        self.instances
    }
}

fn spawn_workers(
    engines: Vec<InferenceEngine>,
    queue_capacity: usize,
) -> Result<EngineHandle, EngineError> {
    let instances = engines.len();
    let (tx, rx) = flume::bounded::<EngineRequest>(queue_capacity.max(1));

    for (worker_id, engine) in engines.into_iter().enumerate() {
        let rx = rx.clone();
        std::thread::Builder::new()
            .name(format!("upscaled-engine-{worker_id}"))
            .spawn(move || worker_loop(worker_id, engine, rx))
            .map_err(|source| EngineError::Spawn { source })?;
    }

    Ok(EngineHandle { tx, instances })
}

/// Runs on a dedicated OS thread until every sender is gone.
fn worker_loop(worker_id: usize, engine: InferenceEngine, rx: flume::Receiver<EngineRequest>) {
    debug!(worker_id, "engine worker started");
    while let Ok(req) = rx.recv() {
        if *req.cancel_rx.borrow() || req.reply_tx.is_closed() {
            debug!(worker_id, "skipping cancelled request");
            let _ = req.reply_tx.send(Err(EngineError::Cancelled));
            continue;
        }

        let result = catch_unwind(AssertUnwindSafe(|| engine.upscale(&req.input))).unwrap_or_else(|_| {
            error!(worker_id, "transform panicked");
            Err(EngineError::Inference {
                source: candle_core::Error::Msg("transform panicked".into()),
            })
        });
        let _ = req.reply_tx.send(result);
    }
    debug!(worker_id, "engine worker stopped");
}

enum EngineState {
    Ready(EngineHandle),
    Unavailable { reason: String },
}

/// The process-wide inference engine: a pool of loaded instances, or the
/// reason there isn't one.
pub struct Engine {
    loader: EngineLoader,
    instances: usize,
    queue_capacity: usize,
    state: RwLock<EngineState>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("instances", &self.instances)
            .field("queue_capacity", &self.queue_capacity)
            .field("loaded", &self.is_loaded())
            .finish()
    }
}

impl Engine {
    /// Load `instances` engines and start their worker threads.
    ///
    /// Never fails: a load error leaves the engine unavailable, which
    /// [`is_loaded`](Self::is_loaded) reports and every request observes.
    pub fn load(loader: EngineLoader, instances: usize, queue_capacity: usize) -> Self {
        let engine = Self {
            loader,
            instances: instances.max(1),
            queue_capacity,
            state: RwLock::new(EngineState::Unavailable {
                reason: "not loaded".into(),
            }),
        };
        if let Err(e) = engine.reload() {
            error!(error = %error_chain(&e), "inference engine failed to load; running degraded");
        }
        engine
    }

    /// Re-run the loader and swap in the new pool.
    ///
    /// On failure a previously loaded pool stays in service. Old worker
    /// threads exit once the requests already queued to them are done.
    pub fn reload(&self) -> Result<(), EngineError> {
        match self.build() {
            Ok(handle) => {
                info!(instances = handle.instances(), "inference engine ready");
                *self.state.write().unwrap_or_else(PoisonError::into_inner) = EngineState::Ready(handle);
                Ok(())
            }
            Err(e) => {
                let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
                match &mut *state {
                    EngineState::Ready(_) => {
                        warn!(error = %error_chain(&e), "engine reload failed; keeping current pool");
                    }
                    EngineState::Unavailable { reason } => *reason = error_chain(&e),
                }
                Err(e)
            }
        }
    }

    fn build(&self) -> Result<EngineHandle, EngineError> {
        // All instances load before any thread starts, so a failure part-way
        // leaves nothing running.
        let engines = (0..self.instances)
            .map(|i| (self.loader)(i))
            .collect::<Result<Vec<_>, _>>()?;
        spawn_workers(engines, self.queue_capacity)
    }

    pub fn is_loaded(&self) -> bool {
        matches!(
            *self.state.read().unwrap_or_else(PoisonError::into_inner),
            EngineState::Ready(_)
        )
    }

    pub fn unavailable_reason(&self) -> Option<String> {
        match &*self.state.read().unwrap_or_else(PoisonError::into_inner) {
            EngineState::Ready(_) => None,
            EngineState::Unavailable { reason } => Some(reason.clone()),
        }
    }

    pub fn handle(&self) -> Result<EngineHandle, EngineError> {
        match &*self.state.read().unwrap_or_else(PoisonError::into_inner) {
            EngineState::Ready(handle) => Ok(handle.clone()),
            EngineState::Unavailable { reason } => Err(EngineError::Unavailable {
                reason: reason.clone(),
            }),
        }
    }
}
