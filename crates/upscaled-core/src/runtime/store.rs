use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use strum::Display;
use thiserror::Error;
use tracing::debug;

use crate::runtime::types::{RuntimeError, TaskId, error_chain};

/// Extensions accepted for uploads (compared case-insensitively).
pub const ALLOWED_EXTENSIONS: [&str; 3] = ["png", "jpg", "jpeg"];

const UPLOADS_DIR: &str = "uploads";
const OUTPUTS_DIR: &str = "outputs";
const OUTPUT_PREFIX: &str = "upscaled_";

/// Which storage area an artifact belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "lowercase")]
pub enum ArtifactKind {
    Input,
    Output,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to create storage directory {path}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to write artifact {path}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to read artifact {path}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to remove artifact {path}")]
    Remove {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to list storage directory {path}")]
    ListDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("artifact does not exist: {path}")]
    Missing { path: PathBuf },

    /// The path resolves outside the managed storage directories.
    #[error("path is outside the managed storage areas: {path}")]
    OutsideStore { path: PathBuf },
}

impl From<StoreError> for RuntimeError {
    fn from(err: StoreError) -> Self {
        RuntimeError::Storage {
            message: error_chain(&err),
        }
    }
}

/// On-disk input/output artifacts, keyed by task id.
///
/// Every file is named `<task_id>_<sanitized filename>` (outputs additionally
/// carry `upscaled_` after the id), so all artifacts of a task can be found by
/// prefix without consulting the registry. All methods block; async callers
/// run them on the blocking pool.
#[derive(Debug, Clone)]
pub struct FileStore {
    uploads: PathBuf,
    outputs: PathBuf,
}

impl FileStore {
    /// Create (if needed) `<root>/uploads` and `<root>/outputs`.
    pub fn open(root: impl AsRef<Path>) -> Result<Self, StoreError> {
        let root = root.as_ref();
        let uploads = ensure_dir(&root.join(UPLOADS_DIR))?;
        let outputs = ensure_dir(&root.join(OUTPUTS_DIR))?;
        Ok(Self { uploads, outputs })
    }

    pub fn uploads_dir(&self) -> &Path {
        &self.uploads
    }

    pub fn outputs_dir(&self) -> &Path {
        &self.outputs
    }

    /// Path an artifact would be stored at. `filename` is sanitized first.
    pub fn artifact_path(&self, task_id: TaskId, kind: ArtifactKind, filename: &str) -> PathBuf {
        let filename = sanitize_filename(filename);
        match kind {
            ArtifactKind::Input => self.uploads.join(format!("{task_id}_{filename}")),
            ArtifactKind::Output => self
                .outputs
                .join(format!("{task_id}_{OUTPUT_PREFIX}{filename}")),
        }
    }

    /// Output path matching a stored input: `uploads/<id>_<name>` maps to
    /// `outputs/<id>_upscaled_<name>`.
    pub fn output_path_for(&self, task_id: TaskId, input_path: &Path) -> Result<PathBuf, StoreError> {
        let input_path = self.locate(input_path)?;
        let prefix = format!("{task_id}_");
        let name = input_path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(|n| n.strip_prefix(&prefix))
            .filter(|_| input_path.starts_with(&self.uploads))
            .ok_or_else(|| StoreError::OutsideStore {
                path: input_path.clone(),
            })?;
        Ok(self.artifact_path(task_id, ArtifactKind::Output, name))
    }

    /// Persist `bytes` as a new artifact and return its path.
    pub fn save(
        &self,
        task_id: TaskId,
        kind: ArtifactKind,
        filename: &str,
        bytes: &[u8],
    ) -> Result<PathBuf, StoreError> {
        let path = self.artifact_path(task_id, kind, filename);
        self.write(&path, bytes)?;
        Ok(path)
    }

    /// Write `bytes` to `path`, which must sit directly inside a storage area.
    pub fn write(&self, path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
        let parent_ok = path
            .parent()
            .is_some_and(|p| p == self.uploads || p == self.outputs);
        let name_ok = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n == sanitize_filename(n));
        if !parent_ok || !name_ok {
            return Err(StoreError::OutsideStore {
                path: path.to_path_buf(),
            });
        }
        fs::write(path, bytes).map_err(|source| StoreError::Write {
            path: path.to_path_buf(),
            source,
        })?;
        debug!(path = %path.display(), size = bytes.len(), "artifact written");
        Ok(())
    }

    /// Resolve `path` and confirm it lies inside one of the storage areas.
    pub fn locate(&self, path: &Path) -> Result<PathBuf, StoreError> {
        let resolved = fs::canonicalize(path).map_err(|source| match source.kind() {
            io::ErrorKind::NotFound => StoreError::Missing {
                path: path.to_path_buf(),
            },
            _ => StoreError::Read {
                path: path.to_path_buf(),
                source,
            },
        })?;
        if resolved.starts_with(&self.uploads) || resolved.starts_with(&self.outputs) {
            Ok(resolved)
        } else {
            Err(StoreError::OutsideStore {
                path: path.to_path_buf(),
            })
        }
    }

    pub fn read(&self, path: &Path) -> Result<Vec<u8>, StoreError> {
        let path = self.locate(path)?;
        fs::read(&path).map_err(|source| StoreError::Read { path, source })
    }

    /// Remove every artifact prefixed by `task_id` from both areas.
    ///
    /// Idempotent: returns the number of files removed, `0` when none match.
    pub fn purge(&self, task_id: TaskId) -> Result<usize, StoreError> {
        let prefix = task_id.to_string();
        let mut removed = 0;
        for dir in [&self.uploads, &self.outputs] {
            for path in list_files(dir)? {
                let matches = path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with(&prefix));
                if !matches {
                    continue;
                }
                match fs::remove_file(&path) {
                    Ok(()) => removed += 1,
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(source) => return Err(StoreError::Remove { path, source }),
                }
            }
        }
        debug!(%task_id, removed, "artifacts purged");
        Ok(removed)
    }

    /// Task ids that currently own at least one artifact.
    pub fn artifact_task_ids(&self) -> Result<HashSet<TaskId>, StoreError> {
        let mut ids = HashSet::new();
        for dir in [&self.uploads, &self.outputs] {
            for path in list_files(dir)? {
                let id = path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .and_then(|n| n.split_once('_'))
                    .and_then(|(prefix, _)| TaskId::parse_str(prefix).ok());
                if let Some(id) = id {
                    ids.insert(id);
                }
            }
        }
        Ok(ids)
    }
}

fn ensure_dir(path: &Path) -> Result<PathBuf, StoreError> {
    fs::create_dir_all(path).map_err(|source| StoreError::CreateDir {
        path: path.to_path_buf(),
        source,
    })?;
    fs::canonicalize(path).map_err(|source| StoreError::CreateDir {
        path: path.to_path_buf(),
        source,
    })
}

fn list_files(dir: &Path) -> Result<Vec<PathBuf>, StoreError> {
    let list_err = |source| StoreError::ListDir {
        path: dir.to_path_buf(),
        source,
    };
    let mut files = Vec::new();
    for entry in fs::read_dir(dir).map_err(list_err)? {
        let entry = entry.map_err(list_err)?;
        if entry.file_type().map_err(list_err)?.is_file() {
            files.push(entry.path());
        }
    }
    Ok(files)
}

/// Reduce an untrusted filename to `[A-Za-z0-9._-]`.
///
/// Path separators become word breaks, non-ASCII is dropped, whitespace runs
/// collapse to `_`, and leading/trailing `.`/`_` are stripped. The result may
/// be empty.
pub fn sanitize_filename(name: &str) -> String {
    let spaced: String = name
        .chars()
        .filter(char::is_ascii)
        .map(|c| if c == '/' || c == '\\' { ' ' } else { c })
        .collect();
    let joined = spaced.split_whitespace().collect::<Vec<_>>().join("_");
    let kept: String = joined
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
        .collect();
    kept.trim_matches(|c| c == '.' || c == '_').to_owned()
}

/// Lower-cased extension of `filename`, if any.
pub fn extension(filename: &str) -> Option<String> {
    filename
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .filter(|ext| !ext.is_empty())
}

/// Returns the normalized extension when it is one of [`ALLOWED_EXTENSIONS`].
pub fn allowed_extension(filename: &str) -> Option<String> {
    extension(filename).filter(|ext| ALLOWED_EXTENSIONS.contains(&ext.as_str()))
}
