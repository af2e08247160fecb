//! Compression task: packs one file into a single-entry archive.

use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use flate2::{Compression, GzBuilder};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::rename::{rename_no_replace, staging_path};
use crate::task::{spawn_task, TaskHandle};
use crate::{Error, Result};

const DEFAULT_LEVEL: u32 = 6;

/// Archive container, chosen by the file-name pattern suffix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompressionMode {
    #[default]
    None,
    Gzip,
    Zip,
}

impl CompressionMode {
    pub fn from_file_name(name: &str) -> Self {
        if name.ends_with(".gz") {
            CompressionMode::Gzip
        } else if name.ends_with(".zip") {
            CompressionMode::Zip
        } else {
            CompressionMode::None
        }
    }

    pub fn suffix(&self) -> &'static str {
        match self {
            CompressionMode::None => "",
            CompressionMode::Gzip => ".gz",
            CompressionMode::Zip => ".zip",
        }
    }

    pub fn is_compressed(&self) -> bool {
        !matches!(self, CompressionMode::None)
    }
}

/// What a finished compression produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompressionReport {
    pub source: PathBuf,
    pub archive: PathBuf,
    pub entry_name: String,
    pub bytes_in: u64,
    pub bytes_out: u64,
}

/// Spawns compression tasks for one container format.
#[derive(Debug, Clone, Copy)]
pub struct Compressor {
    mode: CompressionMode,
    level: u32,
}

impl Compressor {
    pub fn new(mode: CompressionMode) -> Self {
        Self {
            mode,
            level: DEFAULT_LEVEL,
        }
    }

    /// Deflate level, clamped to 1..=9.
    pub fn with_level(mut self, level: u32) -> Self {
        self.level = level.clamp(1, 9);
        self
    }

    pub fn mode(&self) -> CompressionMode {
        self.mode
    }

    /// Compress `source` into `target` on a dedicated thread.
    pub fn compress(
        &self,
        source: impl Into<PathBuf>,
        target: impl Into<PathBuf>,
        entry_name: impl Into<String>,
    ) -> Result<TaskHandle<CompressionReport>> {
        let (mode, level) = (self.mode, self.level);
        let (source, target, entry_name) = (source.into(), target.into(), entry_name.into());
        log::info!(
            "compressing {} into {} as {}",
            source.display(),
            target.display(),
            entry_name
        );
        spawn_task("logroll-compress", move || {
            compress_file(mode, &source, &target, &entry_name, level)
        })
    }
}

/// Compress `source` into a single-entry archive at `target`.
///
/// The archive is staged at `<target>.tmp` and published with a no-replace
/// rename, so `target` either holds a complete archive or does not exist.
/// `source` is left untouched.
pub fn compress_file(
    mode: CompressionMode,
    source: &Path,
    target: &Path,
    entry_name: &str,
    level: u32,
) -> Result<CompressionReport> {
    compress_with_dir_sync(mode, source, target, entry_name, level, fsync_parent)
}

fn compress_with_dir_sync(
    mode: CompressionMode,
    source: &Path,
    target: &Path,
    entry_name: &str,
    level: u32,
    sync_dir: fn(&Path) -> Result<()>,
) -> Result<CompressionReport> {
    let fail = |cause: String| Error::Compression {
        source_path: source.to_path_buf(),
        target: target.to_path_buf(),
        cause,
    };

    if !mode.is_compressed() {
        return Err(fail("no compression configured".to_string()));
    }
    if target.exists() {
        return Err(fail("target already exists".to_string()));
    }
    let input = File::open(source).map_err(|e| fail(format!("open source: {e}")))?;
    let bytes_in = input
        .metadata()
        .map_err(|e| fail(format!("stat source: {e}")))?
        .len();

    if let Some(parent) = target.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(|e| fail(format!("create parent: {e}")))?;
        }
    }
    let staging = staging_path(target);
    let _ = std::fs::remove_file(&staging);

    let written = write_archive(mode, input, &staging, entry_name, level)
        .and_then(|()| rename_no_replace(&staging, target));
    if let Err(err) = written {
        let _ = std::fs::remove_file(&staging);
        return Err(fail(err.to_string()));
    }

    // The archive is complete from here on; later failures only warn.
    if let Err(err) = sync_dir(target) {
        log::warn!("failed to sync directory of {}: {err}", target.display());
    }
    let bytes_out = match std::fs::metadata(target) {
        Ok(meta) => meta.len(),
        Err(err) => {
            log::warn!("failed to stat {}: {err}", target.display());
            0
        }
    };
    log::info!(
        "compressed {} ({} bytes) into {} ({} bytes)",
        source.display(),
        bytes_in,
        target.display(),
        bytes_out
    );
    Ok(CompressionReport {
        source: source.to_path_buf(),
        archive: target.to_path_buf(),
        entry_name: entry_name.to_string(),
        bytes_in,
        bytes_out,
    })
}

fn write_archive(
    mode: CompressionMode,
    input: File,
    staging: &Path,
    entry_name: &str,
    level: u32,
) -> Result<()> {
    let mut input = BufReader::new(input);
    let output = OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(staging)?;

    let file = match mode {
        CompressionMode::Gzip => {
            let mut encoder = GzBuilder::new()
                .filename(entry_name.as_bytes())
                .write(BufWriter::new(output), Compression::new(level));
            std::io::copy(&mut input, &mut encoder)?;
            encoder
                .finish()?
                .into_inner()
                .map_err(|e| Error::Io(e.into_error()))?
        }
        CompressionMode::Zip => {
            let mut writer = ZipWriter::new(output);
            let options = SimpleFileOptions::default()
                .compression_method(CompressionMethod::Deflated)
                .compression_level(Some(level as i64))
                .large_file(true);
            writer
                .start_file(entry_name, options)
                .map_err(std::io::Error::other)?;
            std::io::copy(&mut input, &mut writer)?;
            let mut file = writer
                .finish()
                .map_err(std::io::Error::other)?;
            file.flush()?;
            file
        }
        CompressionMode::None => {
            return Err(Error::Rollover("no compression configured".to_string()))
        }
    };
    file.sync_all()?;
    Ok(())
}

fn fsync_parent(path: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        if let Some(parent) = path.parent() {
            let parent = if parent.as_os_str().is_empty() {
                Path::new(".")
            } else {
                parent
            };
            File::open(parent)?.sync_all()?;
        }
    }
    #[cfg(not(unix))]
    let _ = path;
    Ok(())
}
