use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::runtime::types::RuntimeError;

/// RAII guard for one worker slot.
///
/// Held by a job from dispatch until its pipeline has finished (or been
/// abandoned); dropping it hands the slot to the next queued job.
pub struct SlotPermit {
    #[allow(dead_code)]
    permit: OwnedSemaphorePermit,
}

impl std::fmt::Debug for SlotPermit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlotPermit").finish()
    }
}

/// Bounded pool of worker slots limiting how many jobs run at once.
#[derive(Debug, Clone)]
pub struct WorkerSlots {
    semaphore: Arc<Semaphore>,
    capacity: usize,
}

impl WorkerSlots {
    pub fn new(capacity: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    /// Wait for a free slot.
    ///
    /// Only fails once the slots have been closed.
    pub async fn acquire(&self) -> Result<SlotPermit, RuntimeError> {
        Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .map(|permit| SlotPermit { permit })
            .map_err(|_| RuntimeError::Shutdown)
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Refuse further acquisitions; waiters receive `Shutdown`.
    pub fn close(&self) {
        self.semaphore.close();
    }
}
