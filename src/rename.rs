//! Rename/move primitive used to take the active file out of the writer's way.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::{Error, Result};

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Move `source` to `target`, refusing to replace an existing target.
///
/// Parent directories of `target` are created. On Linux the no-replace check
/// is atomic (`renameat2(RENAME_NOREPLACE)`); elsewhere it is a check followed
/// by a plain rename.
pub fn rename_no_replace(source: &Path, target: &Path) -> Result<()> {
    if let Some(parent) = target.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    #[cfg(target_os = "linux")]
    {
        use std::ffi::CString;
        use std::os::unix::ffi::OsStrExt;
        let source_c = CString::new(source.as_os_str().as_bytes())
            .map_err(|_| Error::Rollover(format!("path contains null byte: {}", source.display())))?;
        let target_c = CString::new(target.as_os_str().as_bytes())
            .map_err(|_| Error::Rollover(format!("path contains null byte: {}", target.display())))?;
        let rc = unsafe {
            libc::renameat2(
                libc::AT_FDCWD,
                source_c.as_ptr(),
                libc::AT_FDCWD,
                target_c.as_ptr(),
                libc::RENAME_NOREPLACE,
            )
        };
        if rc == 0 {
            return Ok(());
        }
        let err = std::io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EEXIST) => return Err(Error::TargetExists(target.to_path_buf())),
            // Filesystem or kernel without RENAME_NOREPLACE support.
            Some(libc::ENOSYS) | Some(libc::EINVAL) => {}
            _ => return Err(Error::Io(err)),
        }
    }

    if target.exists() {
        return Err(Error::TargetExists(target.to_path_buf()));
    }
    std::fs::rename(source, target)?;
    Ok(())
}

/// A sibling of `path` that no other rollover in this process will pick:
/// `<name>.<stamp_ns>-<n>.tmp`.
pub fn unique_temp_path(path: &Path, stamp_ns: u64) -> PathBuf {
    let n = TEMP_COUNTER.fetch_add(1, Ordering::Relaxed);
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!("{name}.{stamp_ns}-{n}.tmp"))
}

/// `<path>.tmp`, the staging name for a file that is published by rename.
pub fn staging_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!("{name}.tmp"))
}
