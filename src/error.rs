use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Rename or precondition failure while finalizing the active file.
    #[error("rollover failed: {0}")]
    Rollover(String),

    #[error("target already exists: {}", .0.display())]
    TargetExists(PathBuf),

    #[error("failed to compress {} into {}: {cause}", source_path.display(), target.display())]
    Compression {
        source_path: PathBuf,
        target: PathBuf,
        cause: String,
    },

    /// Deletion retries were exhausted; the file is left on disk.
    #[error("gave up deleting {} after {attempts} attempts", path.display())]
    DeletionGaveUp { path: PathBuf, attempts: u32 },

    /// Compression did not produce an archive, so the source was kept.
    #[error("retained {} because compression did not succeed", path.display())]
    SourceRetained { path: PathBuf },

    #[error("invalid file name pattern: {0}")]
    InvalidPattern(String),

    #[error("invalid timezone: {0}")]
    InvalidTimezone(String),

    #[error("invalid file size: {0}")]
    InvalidFileSize(String),

    #[error("writer is stopped")]
    WriterStopped,

    #[error("failed to spawn task: {0}")]
    TaskSpawn(String),

    #[error("task {0} ended without reporting a result")]
    TaskAbandoned(String),
}

pub type Result<T> = std::result::Result<T, Error>;
