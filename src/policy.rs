//! Time-based rolling policy that also rolls the active file on shutdown.
//!
//! Scheduled rollovers archive the elapsed period when the trigger fires.
//! [`CloseRollingPolicy::on_shutdown`] archives whatever the current period
//! has accumulated when the writer stops, exactly once per policy. Both paths
//! run under the same lock, so they never finalize the same file twice.
//!
//! The shutdown rollover renames the active file, so the writer must release
//! its handle before calling it. A handle held elsewhere only delays the
//! deletion of the uncompressed copy; the deletion task retries.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::clock::Clock;
use crate::compress::{CompressionMode, CompressionReport, Compressor};
use crate::deletion::{delete_after, DeletionReport, DeletionRetry, FileRemover, FsRemover};
use crate::rename::{rename_no_replace, unique_temp_path};
use crate::task::TaskHandle;
use crate::trigger::RolloverTrigger;
use crate::{Error, Result};

/// One-shot latch for the shutdown rollover.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RolloverState {
    Idle,
    Rolled,
}

#[derive(Debug, Clone)]
pub struct RolloverConfig {
    /// File the writer appends to. `None` means the writer writes straight to
    /// the current period's name (without compression suffix).
    pub active_file: Option<PathBuf>,
    pub compression_level: u32,
    pub deletion_retry: DeletionRetry,
}

impl RolloverConfig {
    pub fn new(active_file: impl Into<PathBuf>) -> Self {
        Self {
            active_file: Some(active_file.into()),
            ..Self::default()
        }
    }

    /// No fixed active file; see [`RolloverConfig::active_file`].
    pub fn prudent() -> Self {
        Self::default()
    }
}

impl Default for RolloverConfig {
    fn default() -> Self {
        Self {
            active_file: None,
            compression_level: 6,
            deletion_retry: DeletionRetry::default(),
        }
    }
}

/// What a rollover did. The task handles are `None` without compression.
#[derive(Debug, Clone)]
pub struct RolloverReport {
    pub archive: PathBuf,
    pub compression: Option<TaskHandle<CompressionReport>>,
    pub deletion: Option<TaskHandle<DeletionReport>>,
}

struct PolicyState {
    rollover: RolloverState,
    pending_compression: Option<TaskHandle<CompressionReport>>,
    last_deletion: Option<TaskHandle<DeletionReport>>,
    /// File the writer last opened, the one holding unarchived data.
    opened_active: Option<PathBuf>,
}

pub struct CloseRollingPolicy {
    config: RolloverConfig,
    trigger: Arc<dyn RolloverTrigger>,
    clock: Arc<dyn Clock>,
    compressor: Compressor,
    remover: Arc<dyn FileRemover>,
    state: Mutex<PolicyState>,
}

impl CloseRollingPolicy {
    pub fn new(
        config: RolloverConfig,
        trigger: Arc<dyn RolloverTrigger>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let compressor =
            Compressor::new(trigger.compression()).with_level(config.compression_level);
        Self {
            config,
            trigger,
            clock,
            compressor,
            remover: Arc::new(FsRemover),
            state: Mutex::new(PolicyState {
                rollover: RolloverState::Idle,
                pending_compression: None,
                last_deletion: None,
                opened_active: None,
            }),
        }
    }

    /// Replace the file remover used by deletion tasks.
    pub fn with_remover(mut self, remover: Arc<dyn FileRemover>) -> Self {
        self.remover = remover;
        self
    }

    pub fn trigger(&self) -> &Arc<dyn RolloverTrigger> {
        &self.trigger
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn config(&self) -> &RolloverConfig {
        &self.config
    }

    pub fn state(&self) -> RolloverState {
        self.lock_state().rollover
    }

    /// Path the writer should append to right now.
    pub fn active_file_path(&self) -> Result<PathBuf> {
        match &self.config.active_file {
            Some(path) => Ok(path.clone()),
            None => self.trigger.current_period_active_name(self.clock.now()),
        }
    }

    /// Path the writer opens next. It is remembered so that a shutdown in
    /// prudent mode archives the file that was written, even when the period
    /// has changed since it was opened.
    pub fn open_active_file(&self) -> Result<PathBuf> {
        let path = self.active_file_path()?;
        self.lock_state().opened_active = Some(path.clone());
        Ok(path)
    }

    /// Compression started by the last scheduled rollover, if still tracked.
    pub fn pending_compression(&self) -> Option<TaskHandle<CompressionReport>> {
        self.lock_state().pending_compression.clone()
    }

    /// Deletion task started by the most recent compressed rollover.
    pub fn pending_deletion(&self) -> Option<TaskHandle<DeletionReport>> {
        self.lock_state().last_deletion.clone()
    }

    /// Scheduled rollover: archive the period the trigger reports as elapsed.
    ///
    /// Compression runs in the background; the next rollover waits for it.
    /// Returns `Ok(None)` when there was nothing to archive or the policy has
    /// already rolled on shutdown.
    pub fn rollover(&self) -> Result<Option<RolloverReport>> {
        let mut state = self.lock_state();
        if state.rollover == RolloverState::Rolled {
            log::debug!("policy already rolled on shutdown; ignoring scheduled rollover");
            return Ok(None);
        }
        Self::wait_for_pending(&mut state);
        let archive = self.trigger.elapsed_period_archive_name();
        self.finalize(&mut state, archive)
    }

    /// Shutdown rollover, called once from the writer's stop sequence after it
    /// released the active file.
    ///
    /// The first call archives the current period and blocks until its
    /// compression finishes; it does not wait for the source deletion. Later
    /// calls only log a warning. Failures are logged, never returned.
    pub fn on_shutdown(&self) {
        let mut state = self.lock_state();
        if state.rollover == RolloverState::Rolled {
            log::warn!("shutdown rollover already performed; ignoring repeated call");
            return;
        }
        state.rollover = RolloverState::Rolled;

        let active = match (&self.config.active_file, &state.opened_active) {
            (Some(active), _) | (None, Some(active)) => Ok(active.clone()),
            (None, None) => self.active_file_path(),
        };
        match &active {
            Ok(active) => log::info!("rolling {} due to shutdown", active.display()),
            Err(err) => log::info!("rolling due to shutdown (active file unknown: {err})"),
        }
        Self::wait_for_pending(&mut state);

        let outcome = self
            .shutdown_archive_name(active)
            .and_then(|archive| self.finalize(&mut state, archive));
        Self::finish_shutdown(&mut state, outcome);
    }

    /// Archive for the shutdown rollover. In prudent mode this follows the
    /// file the writer filled; otherwise it is the period containing "now".
    fn shutdown_archive_name(&self, active: Result<PathBuf>) -> Result<PathBuf> {
        let mode = self.compressor.mode();
        match (&self.config.active_file, active) {
            (None, Ok(raw)) => {
                let mut name = raw.into_os_string();
                name.push(mode.suffix());
                Ok(PathBuf::from(name))
            }
            _ => self.trigger.current_period_archive_name(self.clock.now()),
        }
    }

    /// Log the outcome and block until any compression this rollover started
    /// has finished, also when a later step failed.
    fn finish_shutdown(state: &mut PolicyState, outcome: Result<Option<RolloverReport>>) {
        if let Err(err) = &outcome {
            log::error!("failed to complete rollover: {err}");
        }
        if let Some(compression) = state.pending_compression.take() {
            match compression.wait() {
                Ok(done) => log::info!("shutdown archive ready at {}", done.archive.display()),
                Err(err) => log::error!("failed to compress shutdown archive: {err}"),
            }
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, PolicyState> {
        self.state.lock().unwrap_or_else(|poisoned| {
            log::warn!("rolling policy lock poisoned; continuing");
            PoisonError::into_inner(poisoned)
        })
    }

    /// Only one compression may be outstanding per policy.
    fn wait_for_pending(state: &mut PolicyState) {
        if let Some(pending) = state.pending_compression.take() {
            if let Err(err) = pending.wait() {
                log::error!("previous compression failed: {err}");
            }
        }
    }

    fn finalize(&self, state: &mut PolicyState, archive: PathBuf) -> Result<Option<RolloverReport>> {
        let mode = self.compressor.mode();
        if !mode.is_compressed() {
            return match &self.config.active_file {
                Some(active) => {
                    if !move_active(active, &archive)? {
                        return Ok(None);
                    }
                    log::info!("archived {} as {}", active.display(), archive.display());
                    Ok(Some(RolloverReport {
                        archive,
                        compression: None,
                        deletion: None,
                    }))
                }
                None => {
                    // The writer already wrote under the period's name.
                    log::debug!("nothing to rename for {}", archive.display());
                    Ok(None)
                }
            };
        }

        let source = match &self.config.active_file {
            Some(active) => {
                // Move out of the way first so a new period can start at the
                // active path while compression runs.
                let temp = unique_temp_path(active, self.clock.now());
                if !move_active(active, &temp)? {
                    return Ok(None);
                }
                temp
            }
            None => {
                let raw = strip_compression_suffix(&archive, mode);
                if !raw.exists() {
                    log::info!("no data for {}; nothing to archive", raw.display());
                    return Ok(None);
                }
                raw
            }
        };

        let entry = entry_name(&archive, mode);
        let compression = self.compressor.compress(&source, &archive, entry)?;
        state.pending_compression = Some(compression.clone());

        let deletion = delete_after(
            compression.clone(),
            source,
            self.config.deletion_retry,
            Arc::clone(&self.remover),
        )?;
        state.last_deletion = Some(deletion.clone());

        Ok(Some(RolloverReport {
            archive,
            compression: Some(compression),
            deletion: Some(deletion),
        }))
    }
}

/// Rename the active file; `Ok(false)` when it does not exist, which happens
/// when nothing was written during the period.
fn move_active(active: &Path, target: &Path) -> Result<bool> {
    match rename_no_replace(active, target) {
        Ok(()) => Ok(true),
        Err(Error::Io(err)) if err.kind() == io::ErrorKind::NotFound => {
            log::info!("active file {} does not exist; nothing to roll", active.display());
            Ok(false)
        }
        Err(err) => Err(Error::Rollover(format!(
            "rename {} to {}: {err}",
            active.display(),
            target.display()
        ))),
    }
}

fn strip_compression_suffix(archive: &Path, mode: CompressionMode) -> PathBuf {
    let raw = archive.to_string_lossy();
    PathBuf::from(raw.strip_suffix(mode.suffix()).unwrap_or(&raw))
}

/// Name of the single entry inside the archive: the archive's file name
/// without the compression suffix.
fn entry_name(archive: &Path, mode: CompressionMode) -> String {
    let name = archive
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    name.strip_suffix(mode.suffix())
        .map(str::to_string)
        .unwrap_or(name)
}
