//! Deferred deletion of the uncompressed source once its archive exists.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::task::{spawn_task, TaskHandle};
use crate::{Error, Result};

/// Removes files. Abstracted so a file held open by another process can be
/// represented on platforms where open files can still be unlinked.
pub trait FileRemover: Send + Sync + 'static {
    fn remove(&self, path: &Path) -> io::Result<()>;
}

/// Removes files with `std::fs::remove_file`.
#[derive(Debug, Clone, Copy, Default)]
pub struct FsRemover;

impl FileRemover for FsRemover {
    fn remove(&self, path: &Path) -> io::Result<()> {
        std::fs::remove_file(path)
    }
}

/// Bounded exponential backoff for deletion retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeletionRetry {
    /// Total removal attempts, including the first.
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub multiplier: u32,
    pub max_delay: Duration,
}

impl Default for DeletionRetry {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            initial_delay: Duration::from_millis(50),
            multiplier: 2,
            max_delay: Duration::from_secs(1),
        }
    }
}

impl DeletionRetry {
    /// Retry every `delay`, `max_attempts` times in total.
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            initial_delay: delay,
            multiplier: 1,
            max_delay: delay,
        }
    }

    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sleep before retry number `attempt` (1-based, counting failed attempts).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self
            .multiplier
            .max(1)
            .saturating_pow(attempt.saturating_sub(1));
        self.initial_delay
            .saturating_mul(factor)
            .min(self.max_delay)
    }

    /// Worst-case time spent sleeping before giving up.
    pub fn budget(&self) -> Duration {
        (1..self.max_attempts.max(1))
            .map(|attempt| self.delay_for(attempt))
            .sum()
    }
}

/// A file that was removed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeletionReport {
    pub path: PathBuf,
    pub attempts: u32,
}

/// Delete `file` once `dependency` has succeeded.
///
/// If the dependency fails the file is kept and the task ends with
/// [`Error::SourceRetained`]: it may be the only copy of the data.
pub fn delete_after<T>(
    dependency: TaskHandle<T>,
    file: PathBuf,
    retry: DeletionRetry,
    remover: Arc<dyn FileRemover>,
) -> Result<TaskHandle<DeletionReport>>
where
    T: Clone + Send + 'static,
{
    spawn_task("logroll-delete", move || match dependency.wait() {
        Ok(_) => delete_with_retry(&file, retry, remover.as_ref()),
        Err(cause) => {
            log::error!(
                "not deleting {}: {} did not succeed ({cause})",
                file.display(),
                dependency.name()
            );
            Err(Error::SourceRetained { path: file })
        }
    })
}

/// Remove `path`, sleeping between failed attempts. A file that is already
/// gone counts as deleted.
pub fn delete_with_retry(
    path: &Path,
    retry: DeletionRetry,
    remover: &dyn FileRemover,
) -> Result<DeletionReport> {
    let max_attempts = retry.max_attempts.max(1);
    for attempt in 1..=max_attempts {
        match remover.remove(path) {
            Ok(()) => {
                log::info!("deleted {}", path.display());
                return Ok(DeletionReport {
                    path: path.to_path_buf(),
                    attempts: attempt,
                });
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                log::debug!("{} already gone", path.display());
                return Ok(DeletionReport {
                    path: path.to_path_buf(),
                    attempts: attempt,
                });
            }
            Err(err) if attempt < max_attempts => {
                let delay = retry.delay_for(attempt);
                log::debug!(
                    "delete {} failed on attempt {attempt}: {err}; retrying in {delay:?}",
                    path.display()
                );
                thread::sleep(delay);
            }
            Err(err) => {
                log::error!(
                    "gave up deleting {} after {attempt} attempts ({err}); remove it manually",
                    path.display()
                );
            }
        }
    }
    Err(Error::DeletionGaveUp {
        path: path.to_path_buf(),
        attempts: max_attempts,
    })
}
