use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use tokio::sync::watch;

use crate::runtime::types::{RuntimeError, Task, TaskId, TaskStatus};

/// One registry slot: the task record plus its cancellation channel.
#[derive(Debug)]
struct TaskEntry {
    task: Task,
    /// Flipped to `true` (and then dropped) when the task is deleted.
    cancel_tx: watch::Sender<bool>,
    /// Set under the entry lock by `delete`, so a writer that looked the entry
    /// up just before removal cannot resurrect it.
    removed: bool,
}

/// Task counts by status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RegistryStats {
    pub total: usize,
    pub queued: usize,
    pub processing: usize,
    pub completed: usize,
    pub error: usize,
}

/// Authoritative map from [`TaskId`] to task state.
///
/// The outer map lock is only held to look up, insert or remove an entry;
/// every read-modify-write of a record happens under that record's own mutex,
/// so status polls and updates of unrelated tasks never serialize on each
/// other.
#[derive(Debug, Default)]
pub struct TaskRegistry {
    entries: RwLock<HashMap<TaskId, Arc<Mutex<TaskEntry>>>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a fresh id and insert a `queued` record at progress 0.
    pub fn create(&self) -> Result<TaskId, RuntimeError> {
        let mut entries = self.write_map("create task")?;
        let mut task_id = TaskId::new_v4();
        while entries.contains_key(&task_id) {
            task_id = TaskId::new_v4();
        }
        let (cancel_tx, _) = watch::channel(false);
        entries.insert(
            task_id,
            Arc::new(Mutex::new(TaskEntry {
                task: Task::new(task_id),
                cancel_tx,
                removed: false,
            })),
        );
        Ok(task_id)
    }

    /// Return a snapshot of the task.
    pub fn get(&self, task_id: TaskId) -> Result<Task, RuntimeError> {
        let entry = self.entry(task_id)?;
        let guard = lock_entry(&entry, "read task")?;
        if guard.removed {
            return Err(RuntimeError::TaskNotFound { task_id });
        }
        Ok(guard.task.clone())
    }

    pub fn contains(&self, task_id: TaskId) -> bool {
        self.read_map("look up task")
            .map(|entries| entries.contains_key(&task_id))
            .unwrap_or(false)
    }

    /// Atomic read-modify-write of one record.
    ///
    /// The mutator runs on a copy; the record is only replaced (and
    /// `updated_at` bumped) when it returns `Ok`.
    pub fn update<R>(
        &self,
        task_id: TaskId,
        mutate: impl FnOnce(&mut Task) -> Result<R, RuntimeError>,
    ) -> Result<R, RuntimeError> {
        let entry = self.entry(task_id)?;
        let mut guard = lock_entry(&entry, "update task")?;
        if guard.removed {
            return Err(RuntimeError::TaskNotFound { task_id });
        }
        let mut next = guard.task.clone();
        let out = mutate(&mut next)?;
        next.updated_at = Utc::now();
        guard.task = next;
        Ok(out)
    }

    /// Remove the record and signal cancellation to any job still running it.
    pub fn delete(&self, task_id: TaskId) -> Result<Task, RuntimeError> {
        let entry = self
            .write_map("delete task")?
            .remove(&task_id)
            .ok_or(RuntimeError::TaskNotFound { task_id })?;
        let mut guard = lock_entry(&entry, "delete task")?;
        guard.removed = true;
        guard.cancel_tx.send_replace(true);
        Ok(guard.task.clone())
    }

    /// Receiver that turns `true` (or closes) once the task is deleted.
    pub fn subscribe_cancel(&self, task_id: TaskId) -> Result<watch::Receiver<bool>, RuntimeError> {
        let entry = self.entry(task_id)?;
        let guard = lock_entry(&entry, "subscribe to cancellation")?;
        Ok(guard.cancel_tx.subscribe())
    }

    /// Snapshot of every record.
    pub fn tasks(&self) -> Result<Vec<Task>, RuntimeError> {
        let entries: Vec<_> = self.read_map("list tasks")?.values().cloned().collect();
        entries
            .iter()
            .map(|entry| lock_entry(entry, "list tasks").map(|g| g.task.clone()))
            .collect()
    }

    pub fn stats(&self) -> Result<RegistryStats, RuntimeError> {
        let mut stats = RegistryStats::default();
        for task in self.tasks()? {
            stats.total += 1;
            match task.status {
                TaskStatus::Queued => stats.queued += 1,
                TaskStatus::Processing => stats.processing += 1,
                TaskStatus::Completed => stats.completed += 1,
                TaskStatus::Error => stats.error += 1,
            }
        }
        Ok(stats)
    }

    /// Delete every terminal task whose last update is older than `ttl`.
    ///
    /// Returns the evicted records so the caller can purge their artifacts.
    pub fn evict_expired(&self, ttl: Duration, now: DateTime<Utc>) -> Result<Vec<Task>, RuntimeError> {
        let ttl = TimeDelta::from_std(ttl).unwrap_or(TimeDelta::MAX);
        let expired: Vec<TaskId> = self
            .tasks()?
            .into_iter()
            .filter(|t| t.status.is_terminal() && now.signed_duration_since(t.updated_at) > ttl)
            .map(|t| t.id)
            .collect();

        let mut evicted = Vec::with_capacity(expired.len());
        for task_id in expired {
            match self.delete(task_id) {
                Ok(task) => evicted.push(task),
                // Removed concurrently by an explicit cleanup.
                Err(RuntimeError::TaskNotFound { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(evicted)
    }

    // ── helpers ──────────────────────────────────────────────────────────────

    fn entry(&self, task_id: TaskId) -> Result<Arc<Mutex<TaskEntry>>, RuntimeError> {
        self.read_map("look up task")?
            .get(&task_id)
            .cloned()
            .ok_or(RuntimeError::TaskNotFound { task_id })
    }

    fn read_map(
        &self,
        operation: &'static str,
    ) -> Result<RwLockReadGuard<'_, HashMap<TaskId, Arc<Mutex<TaskEntry>>>>, RuntimeError> {
        self.entries
            .read()
            .map_err(|_| RuntimeError::LockPoisoned { operation })
    }

    fn write_map(
        &self,
        operation: &'static str,
    ) -> Result<RwLockWriteGuard<'_, HashMap<TaskId, Arc<Mutex<TaskEntry>>>>, RuntimeError> {
        self.entries
            .write()
            .map_err(|_| RuntimeError::LockPoisoned { operation })
    }
}

fn lock_entry<'a>(
    entry: &'a Mutex<TaskEntry>,
    operation: &'static str,
) -> Result<MutexGuard<'a, TaskEntry>, RuntimeError> {
    entry
        .lock()
        .map_err(|_| RuntimeError::LockPoisoned { operation })
}
