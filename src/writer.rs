//! Line-oriented writer that drives a [`CloseRollingPolicy`].

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::clock::Clock;
use crate::policy::CloseRollingPolicy;
use crate::{Error, Result};

#[derive(Debug, Clone, Default)]
pub struct WriterConfig {
    /// Line written at the top of every freshly created active file.
    pub header: Option<String>,
    /// Line written before the active file is closed.
    pub footer: Option<String>,
    /// Flush after every record.
    pub immediate_flush: bool,
}

struct WriterInner {
    file: Option<BufWriter<File>>,
    path: PathBuf,
    /// Bytes in the active file, including buffered ones.
    len: u64,
    records: u64,
    stopped: bool,
}

/// Appends records to the policy's active file and rolls it over.
///
/// `stop` closes the file before calling [`CloseRollingPolicy::on_shutdown`],
/// so the shutdown rollover never renames a file this writer still holds.
pub struct RollingFileWriter {
    config: WriterConfig,
    policy: Arc<CloseRollingPolicy>,
    inner: Mutex<WriterInner>,
}

impl RollingFileWriter {
    pub fn open(config: WriterConfig, policy: Arc<CloseRollingPolicy>) -> Result<Self> {
        let path = policy.open_active_file()?;
        let (file, len) = open_active(&path, config.header.as_deref())?;
        log::info!("writing to {}", path.display());
        Ok(Self {
            config,
            policy,
            inner: Mutex::new(WriterInner {
                file: Some(file),
                path,
                len,
                records: 0,
                stopped: false,
            }),
        })
    }

    pub fn policy(&self) -> &Arc<CloseRollingPolicy> {
        &self.policy
    }

    pub fn active_path(&self) -> PathBuf {
        self.lock_inner().path.clone()
    }

    /// Records appended since the writer was opened.
    pub fn records(&self) -> u64 {
        self.lock_inner().records
    }

    /// Append one record followed by a newline, rolling first if the period
    /// has elapsed.
    pub fn append(&self, record: &[u8]) -> Result<()> {
        let mut inner = self.lock_inner();
        if inner.stopped {
            return Err(Error::WriterStopped);
        }

        let now = self.policy.clock().now();
        if self.policy.trigger().is_triggering(now, inner.len) {
            self.roll(&mut inner)?;
        }

        if inner.file.is_none() {
            self.reopen(&mut inner)?;
        }
        let immediate_flush = self.config.immediate_flush;
        let file = inner
            .file
            .as_mut()
            .ok_or_else(|| Error::Rollover("active file missing".to_string()))?;
        file.write_all(record)?;
        file.write_all(b"\n")?;
        if immediate_flush {
            file.flush()?;
        }
        inner.len += record.len() as u64 + 1;
        inner.records += 1;
        Ok(())
    }

    pub fn flush(&self) -> Result<()> {
        let mut inner = self.lock_inner();
        if let Some(file) = inner.file.as_mut() {
            file.flush()?;
        }
        Ok(())
    }

    /// Close the active file and run the shutdown rollover. Only the first
    /// call has any effect.
    pub fn stop(&self) -> Result<()> {
        let mut inner = self.lock_inner();
        if inner.stopped {
            return Ok(());
        }
        inner.stopped = true;

        let closed = self.close(&mut inner);
        if let Err(err) = &closed {
            log::error!("failed to close {}: {err}", inner.path.display());
        }
        self.policy.on_shutdown();
        closed
    }

    fn roll(&self, inner: &mut WriterInner) -> Result<()> {
        self.close(inner)?;
        match self.policy.rollover() {
            Ok(Some(report)) => log::info!("rolled over to {}", report.archive.display()),
            Ok(None) => {}
            // Keep appending to the same file; the next period retries.
            Err(err) => log::error!("scheduled rollover failed: {err}"),
        }
        self.reopen(inner)
    }

    fn reopen(&self, inner: &mut WriterInner) -> Result<()> {
        let path = self.policy.open_active_file()?;
        let (file, len) = open_active(&path, self.config.header.as_deref())?;
        inner.file = Some(file);
        inner.path = path;
        inner.len = len;
        Ok(())
    }

    fn close(&self, inner: &mut WriterInner) -> Result<()> {
        let Some(mut file) = inner.file.take() else {
            return Ok(());
        };
        if let Some(footer) = &self.config.footer {
            file.write_all(footer.as_bytes())?;
            file.write_all(b"\n")?;
        }
        file.flush()?;
        file.get_ref().sync_data()?;
        Ok(())
    }

    fn lock_inner(&self) -> MutexGuard<'_, WriterInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for RollingFileWriter {
    fn drop(&mut self) {
        if let Err(err) = self.stop() {
            log::warn!("error while stopping writer: {err}");
        }
    }
}

/// Open `path` for appending; returns the writer and the file length.
fn open_active(path: &Path, header: Option<&str>) -> Result<(BufWriter<File>, u64)> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    let mut len = file.metadata()?.len();
    let mut writer = BufWriter::new(file);
    if let (0, Some(header)) = (len, header) {
        writer.write_all(header.as_bytes())?;
        writer.write_all(b"\n")?;
        len = header.len() as u64 + 1;
    }
    Ok((writer, len))
}
