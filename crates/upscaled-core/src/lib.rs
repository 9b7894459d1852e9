mod runtime;

pub mod api;
pub mod engine;

pub use runtime::registry::RegistryStats;
pub use runtime::store::{ALLOWED_EXTENSIONS, allowed_extension, sanitize_filename};
pub use runtime::types::{ErrorKind, RuntimeError, TaskId, TaskStatus, TaskStatusView, progress};
