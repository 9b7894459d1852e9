use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use strum::{Display, EnumString};
use thiserror::Error;

/// Unique identifier for a submitted upscale task.
///
/// Also used as the filename prefix of every artifact the task owns.
pub type TaskId = uuid::Uuid;

/// Progress checkpoints emitted by the job pipeline, in percent.
pub mod progress {
    pub const STARTED: u8 = 0;
    pub const INPUT_LOADED: u8 = 25;
    pub const INFERENCE_STARTED: u8 = 50;
    pub const INFERENCE_FINISHED: u8 = 75;
    pub const DONE: u8 = 100;

    /// Every value a task's `progress` may take.
    pub const CHECKPOINTS: [u8; 5] = [
        STARTED,
        INPUT_LOADED,
        INFERENCE_STARTED,
        INFERENCE_FINISHED,
        DONE,
    ];
}

/// High-level lifecycle state of a task.
///
/// `Completed` and `Error` are terminal: once reached, the status never
/// changes again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum TaskStatus {
    /// Accepted and waiting for a worker slot.
    Queued,
    /// A worker is running the decode → transform → encode pipeline.
    Processing,
    /// The result artifact is available.
    Completed,
    /// The pipeline failed; the task's `error` holds the cause.
    Error,
}

impl TaskStatus {
    /// Returns `true` for `Completed` and `Error`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Error)
    }
}

/// The complete record of one upscale request.
///
/// Records are owned by the [`TaskRegistry`]; every other component only ever
/// sees clones taken under the entry lock.
///
/// [`TaskRegistry`]: crate::runtime::registry::TaskRegistry
#[derive(Debug, Clone)]
pub struct Task {
    pub id: TaskId,
    pub status: TaskStatus,
    pub progress: u8,
    pub input_path: Option<PathBuf>,
    pub output_path: Option<PathBuf>,
    /// Populated only when `status == Error`.
    pub error: Option<RuntimeError>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub(crate) fn new(id: TaskId) -> Self {
        let now = Utc::now();
        Self {
            id,
            status: TaskStatus::Queued,
            progress: progress::STARTED,
            input_path: None,
            output_path: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Move the task to `processing` at the given checkpoint.
    ///
    /// Allowed from `queued` (any checkpoint) or from `processing` at an equal
    /// or lower checkpoint, so observed progress never goes backwards.
    pub(crate) fn advance(&mut self, checkpoint: u8) -> Result<(), RuntimeError> {
        let allowed = progress::CHECKPOINTS.contains(&checkpoint)
            && checkpoint < progress::DONE
            && match self.status {
                TaskStatus::Queued => true,
                TaskStatus::Processing => checkpoint >= self.progress,
                TaskStatus::Completed | TaskStatus::Error => false,
            };
        if !allowed {
            return Err(self.invalid_transition(TaskStatus::Processing, checkpoint));
        }
        self.status = TaskStatus::Processing;
        self.progress = checkpoint;
        Ok(())
    }

    /// Mark the task `completed` with its result artifact.
    pub(crate) fn complete(&mut self, output_path: PathBuf) -> Result<(), RuntimeError> {
        if self.status != TaskStatus::Processing {
            return Err(self.invalid_transition(TaskStatus::Completed, progress::DONE));
        }
        self.status = TaskStatus::Completed;
        self.progress = progress::DONE;
        self.output_path = Some(output_path);
        Ok(())
    }

    /// Mark the task `error` with the given cause. Progress resets to 0.
    pub(crate) fn fail(&mut self, error: RuntimeError) -> Result<(), RuntimeError> {
        if self.status.is_terminal() {
            return Err(self.invalid_transition(TaskStatus::Error, progress::STARTED));
        }
        self.status = TaskStatus::Error;
        self.progress = progress::STARTED;
        self.error = Some(error);
        Ok(())
    }

    fn invalid_transition(&self, to: TaskStatus, to_progress: u8) -> RuntimeError {
        RuntimeError::InvalidTransition {
            task_id: self.id,
            from: self.status,
            from_progress: self.progress,
            to,
            to_progress,
        }
    }

    /// Snapshot suitable for returning to pollers.
    pub fn view(&self) -> TaskStatusView {
        TaskStatusView {
            task_id: self.id,
            status: self.status,
            progress: self.progress,
            error: self.error.as_ref().map(ToString::to_string),
            error_kind: self.error.as_ref().map(RuntimeError::kind),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

/// A read-only view of a task's current state returned to callers.
#[derive(Debug, Clone, Serialize)]
pub struct TaskStatusView {
    pub task_id: TaskId,
    pub status: TaskStatus,
    pub progress: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Machine-readable category of a [`RuntimeError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    InvalidFileType,
    PayloadTooLarge,
    EngineUnavailable,
    Decode,
    Inference,
    Storage,
    TaskNotFound,
    TaskNotCompleted,
    ArtifactMissing,
    Timeout,
    Busy,
    Cancelled,
    Internal,
}

/// Errors produced by the runtime layer.
///
/// `Clone` so a failure can be stored in the owning [`Task`] and handed to
/// every poller.
#[derive(Debug, Clone, Error)]
pub enum RuntimeError {
    /// The upload is missing, empty, or otherwise malformed.
    #[error("validation failed: {0}")]
    Validation(String),

    /// The filename has no extension or one outside `png`, `jpg`, `jpeg`.
    #[error("invalid file type: {filename:?} (allowed: png, jpg, jpeg)")]
    InvalidFileType { filename: String },

    #[error("upload too large: {size} bytes (limit {limit})")]
    PayloadTooLarge { size: usize, limit: usize },

    /// The inference engine failed to load and has not been reloaded since.
    #[error("inference engine unavailable: {reason}")]
    EngineUnavailable { reason: String },

    #[error("failed to decode input image: {message}")]
    Decode { message: String },

    #[error("inference failed: {message}")]
    Inference { message: String },

    #[error("storage error: {message}")]
    Storage { message: String },

    #[error("task not found: {task_id}")]
    TaskNotFound { task_id: TaskId },

    #[error("task {task_id} is not completed (status: {status})")]
    TaskNotCompleted { task_id: TaskId, status: TaskStatus },

    #[error("result artifact missing for task {task_id}")]
    ArtifactMissing { task_id: TaskId },

    #[error("job exceeded its deadline of {timeout:?}")]
    Timeout { timeout: Duration },

    /// The admission queue is at capacity; the submission was not accepted.
    #[error("scheduler busy: admission queue full (capacity {capacity})")]
    Busy { capacity: usize },

    /// The task was cleaned up while its job was still running.
    #[error("task cancelled: {task_id}")]
    Cancelled { task_id: TaskId },

    #[error("invalid transition for task {task_id}: {from}({from_progress}) -> {to}({to_progress})")]
    InvalidTransition {
        task_id: TaskId,
        from: TaskStatus,
        from_progress: u8,
        to: TaskStatus,
        to_progress: u8,
    },

    #[error("lock poisoned while trying to {operation}")]
    LockPoisoned { operation: &'static str },

    /// The scheduler's dispatch loop is gone.
    #[error("scheduler shut down")]
    Shutdown,
}

impl RuntimeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RuntimeError::Validation(_) => ErrorKind::Validation,
            RuntimeError::InvalidFileType { .. } => ErrorKind::InvalidFileType,
            RuntimeError::PayloadTooLarge { .. } => ErrorKind::PayloadTooLarge,
            RuntimeError::EngineUnavailable { .. } => ErrorKind::EngineUnavailable,
            RuntimeError::Decode { .. } => ErrorKind::Decode,
            RuntimeError::Inference { .. } => ErrorKind::Inference,
            RuntimeError::Storage { .. } => ErrorKind::Storage,
            RuntimeError::TaskNotFound { .. } => ErrorKind::TaskNotFound,
            RuntimeError::TaskNotCompleted { .. } => ErrorKind::TaskNotCompleted,
            RuntimeError::ArtifactMissing { .. } => ErrorKind::ArtifactMissing,
            RuntimeError::Timeout { .. } => ErrorKind::Timeout,
            RuntimeError::Busy { .. } => ErrorKind::Busy,
            RuntimeError::Cancelled { .. } => ErrorKind::Cancelled,
            RuntimeError::InvalidTransition { .. }
            | RuntimeError::LockPoisoned { .. }
            | RuntimeError::Shutdown => ErrorKind::Internal,
        }
    }
}

/// Render an error together with its `source()` chain on one line.
pub(crate) fn error_chain(err: &dyn std::error::Error) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}
