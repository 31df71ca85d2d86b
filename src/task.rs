//! Per-search task state: identifier, artifact locations and held locks.

use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::command::Artifacts;
use crate::config::PathsConfig;
use crate::error::{PipelineError, Result};
use crate::lock::{LockManager, ShareMode};
use crate::search_config::{normalize, SearchConfig};

/// New 16-hex-digit task identifier.
pub fn new_task_id() -> String {
    format!("{:016x}", (Uuid::new_v4().as_u128() >> 64) as u64)
}

/// One output artifact: where the reader finds it, and how the backend
/// (running in the mount point) names it.
#[derive(Debug, Clone)]
pub struct Artifact {
    pub path: PathBuf,
    pub arg: String,
    /// Requested by the caller, so it survives the task.
    pub keep: bool,
}

impl Artifact {
    fn new(paths: &PathsConfig, path: PathBuf, keep: bool) -> Self {
        let arg = path
            .strip_prefix(&paths.mount_point)
            .map(Path::to_path_buf)
            .unwrap_or_else(|_| path.clone())
            .to_string_lossy()
            .into_owned();
        Self { path, arg, keep }
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Removes the file; a missing file is not an error.
    pub fn remove(&self) -> std::io::Result<()> {
        match std::fs::remove_file(&self.path) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }
}

#[derive(Debug)]
pub struct Task {
    pub id: String,
    pub created: DateTime<Utc>,
    pub started: Instant,
    pub index: Artifact,
    pub data: Artifact,
    pub view: Option<PathBuf>,
}

impl Task {
    /// Names the artifacts: caller-requested keep-as names under home,
    /// otherwise hidden per-task names under the instance directory.
    pub fn new(paths: &PathsConfig, search: &SearchConfig) -> Self {
        let id = new_task_id();
        let home = paths.home();
        let instance = paths.instance_dir();

        let artifact = |keep_as: &str, auto: String| {
            if keep_as.is_empty() {
                Artifact::new(paths, instance.join(auto), false)
            } else {
                Artifact::new(paths, normalize(&home.join(keep_as.trim_start_matches('/'))), true)
            }
        };
        let index = artifact(&search.keep_index_as, format!(".idx-{}.txt", id));
        let data = artifact(&search.keep_data_as, format!(".dat-{}.bin", id));
        let view = (!search.keep_view_as.is_empty())
            .then(|| normalize(&home.join(search.keep_view_as.trim_start_matches('/'))));

        Self {
            id,
            created: Utc::now(),
            started: Instant::now(),
            index,
            data,
            view,
        }
    }

    pub fn artifacts(&self) -> Artifacts {
        Artifacts {
            index: self.index.arg.clone(),
            data: self.data.arg.clone(),
        }
    }

    /// Deletes INDEX and DATA unless `keep_files` is set. Artifacts the
    /// caller asked to keep ([`Artifact::keep`]) are never deleted here.
    pub fn cleanup(&self, keep_files: bool) {
        if keep_files {
            return;
        }
        for artifact in [&self.index, &self.data] {
            if artifact.keep {
                continue;
            }
            if let Err(e) = artifact.remove() {
                warn!(task = %self.id, path = %artifact.path.display(), error = %e, "failed to remove artifact");
            }
        }
    }
}

/// Read locks held by a task. Released on drop.
pub struct LockSet {
    manager: Arc<LockManager>,
    names: Vec<String>,
    task: String,
}

impl LockSet {
    pub fn new(manager: Arc<LockManager>, task: &str) -> Self {
        Self {
            manager,
            names: Vec::new(),
            task: task.to_string(),
        }
    }

    /// Read-locks every input file. Busy files are skipped in skip-busy
    /// mode; otherwise a busy file fails the task. Returns the files that
    /// may be searched, or `Cancelled` if `cancel` fires during a wait.
    pub async fn acquire(
        &mut self,
        home: &Path,
        files: &[String],
        mode: ShareMode,
        cancel: &CancellationToken,
    ) -> Result<Vec<String>> {
        let mut usable = Vec::with_capacity(files.len());
        for file in files {
            if mode.is_ignore() {
                usable.push(file.clone());
                continue;
            }

            let name = normalize(&home.join(file.trim_start_matches('/')))
                .to_string_lossy()
                .into_owned();
            if self.manager.lock_read(&name, mode, cancel).await {
                self.names.push(name);
                usable.push(file.clone());
            } else if cancel.is_cancelled() {
                return Err(PipelineError::Cancelled(format!(
                    "while waiting for {:?}",
                    file
                )));
            } else if mode.is_skip_busy() {
                warn!(task = %self.task, file = %file, "file is busy, skipped");
            } else {
                return Err(PipelineError::Acquisition(format!(
                    "{:?} is busy ({})",
                    file, mode
                )));
            }
        }
        Ok(usable)
    }

    /// Number of locks held.
    pub fn held(&self) -> usize {
        self.names.len()
    }
}

impl Drop for LockSet {
    fn drop(&mut self) {
        for name in self.names.drain(..) {
            self.manager.unlock_read(&name);
        }
        debug!(task = %self.task, "locks released");
    }
}
