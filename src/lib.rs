//! Time-based rollover for append-only log files that also finalizes the
//! current period when the writer shuts down.
//!
//! [`CloseRollingPolicy`] archives the elapsed period on schedule and, once,
//! on shutdown: it renames the active file, compresses it in the background
//! when the archive pattern ends in `.gz` or `.zip`, and deletes the
//! uncompressed copy only after the archive exists.

pub mod clock;
pub mod compress;
pub mod deletion;
pub mod error;
pub mod pattern;
pub mod policy;
pub mod rename;
pub mod task;
pub mod trigger;
pub mod writer;

pub use clock::{Clock, ManualClock, SystemClock};
pub use compress::{CompressionMode, CompressionReport, Compressor};
pub use deletion::{DeletionReport, DeletionRetry, FileRemover, FsRemover};
pub use error::{Error, Result};
pub use pattern::{FileNamePattern, Periodicity};
pub use policy::{CloseRollingPolicy, RolloverConfig, RolloverReport, RolloverState};
pub use task::{TaskHandle, TaskResult};
pub use trigger::{parse_file_size, RolloverTrigger, TimeBasedTrigger, Timezone};
pub use writer::{RollingFileWriter, WriterConfig};
