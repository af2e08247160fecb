//! Time-based trigger and archive naming.
//!
//! The trigger answers two questions for the rolling policy: has the current
//! period elapsed, and what is the archive called for a given period.

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard, PoisonError};

use time::{Date, Month, OffsetDateTime, Time, UtcOffset};

use crate::compress::CompressionMode;
use crate::pattern::{FileNamePattern, Periodicity};
use crate::{Error, Result};

/// Naming and triggering collaborator consulted by the rolling policy.
pub trait RolloverTrigger: Send + Sync {
    /// Returns true once `now_ns` has crossed into a new period, or the active
    /// file has grown to `active_len` bytes past the size ceiling. Advances
    /// the trigger so that [`elapsed_period_archive_name`] names the archive
    /// for the data written so far.
    ///
    /// [`elapsed_period_archive_name`]: RolloverTrigger::elapsed_period_archive_name
    fn is_triggering(&self, now_ns: u64, active_len: u64) -> bool;

    /// Archive path for the most recently elapsed period.
    fn elapsed_period_archive_name(&self) -> PathBuf;

    /// Archive path for the period containing `now_ns`.
    fn current_period_archive_name(&self, now_ns: u64) -> Result<PathBuf>;

    /// Archive path for the period containing `now_ns`, without the
    /// compression suffix. Used as the active file when the writer has no
    /// fixed file name.
    fn current_period_active_name(&self, now_ns: u64) -> Result<PathBuf>;

    fn compression(&self) -> CompressionMode;
}

/// Timezone for period boundaries and archive names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timezone {
    UTC,
    AsiaShanghai,   // UTC+8
    AsiaTokyo,      // UTC+9
    AmericaNewYork, // UTC-5, DST not modelled
    Custom(i32),    // offset in seconds
}

impl Timezone {
    pub fn offset_seconds(&self) -> i32 {
        match self {
            Timezone::UTC => 0,
            Timezone::AsiaShanghai => 8 * 3600,
            Timezone::AsiaTokyo => 9 * 3600,
            Timezone::AmericaNewYork => -5 * 3600,
            Timezone::Custom(offset) => *offset,
        }
    }

    pub fn utc_offset(&self) -> Result<UtcOffset> {
        UtcOffset::from_whole_seconds(self.offset_seconds())
            .map_err(|e| Error::InvalidTimezone(e.to_string()))
    }
}

impl FromStr for Timezone {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "UTC" => Ok(Timezone::UTC),
            "Asia/Shanghai" => Ok(Timezone::AsiaShanghai),
            "Asia/Tokyo" => Ok(Timezone::AsiaTokyo),
            "America/New_York" => Ok(Timezone::AmericaNewYork),
            _ => {
                // "+0800" or "-0500"
                let sign = match s.chars().next() {
                    Some('+') => 1,
                    Some('-') => -1,
                    _ => return Err(Error::InvalidTimezone(s.to_string())),
                };
                if s.len() != 5 || !s[1..].chars().all(|c| c.is_ascii_digit()) {
                    return Err(Error::InvalidTimezone(s.to_string()));
                }
                let hours: i32 = s[1..3]
                    .parse()
                    .map_err(|_| Error::InvalidTimezone(s.to_string()))?;
                let minutes: i32 = s[3..5]
                    .parse()
                    .map_err(|_| Error::InvalidTimezone(s.to_string()))?;
                let tz = Timezone::Custom(sign * (hours * 3600 + minutes * 60));
                tz.utc_offset()?;
                Ok(tz)
            }
        }
    }
}

/// Upper bound on `%i` probing for a free archive name.
const MAX_INDEX_PROBES: u32 = 100_000;

struct PeriodWindow {
    next_check_ns: u64,
    elapsed_name: PathBuf,
    current_start: OffsetDateTime,
    index: u32,
}

/// Rolls over when the wall clock crosses a period boundary of the pattern,
/// or, with a size ceiling and a `%i` pattern, when the active file grows
/// past it.
pub struct TimeBasedTrigger {
    pattern: FileNamePattern,
    offset: UtcOffset,
    max_file_size: Option<u64>,
    window: Mutex<PeriodWindow>,
}

impl TimeBasedTrigger {
    pub fn new(pattern: FileNamePattern, timezone: Timezone, now_ns: u64) -> Result<Self> {
        let offset = timezone.utc_offset()?;
        let current_start = period_start(now_ns, pattern.periodicity(), offset)?;
        let next = next_period_start(current_start, pattern.periodicity())?;
        let index = first_free_index(&pattern, current_start, 0);
        let window = PeriodWindow {
            next_check_ns: to_unix_nanos(next),
            elapsed_name: pattern.render(current_start, index),
            current_start,
            index,
        };
        Ok(Self {
            pattern,
            offset,
            max_file_size: None,
            window: Mutex::new(window),
        })
    }

    /// Also roll within a period once the active file reaches `bytes`. The
    /// pattern needs a `%i` so archives of one period get distinct names.
    pub fn with_max_file_size(mut self, bytes: u64) -> Result<Self> {
        if !self.pattern.has_index() {
            return Err(Error::InvalidPattern(format!(
                "size-based rollover needs %i in {}",
                self.pattern
            )));
        }
        self.max_file_size = Some(bytes.max(1));
        Ok(self)
    }

    pub fn pattern(&self) -> &FileNamePattern {
        &self.pattern
    }

    pub fn max_file_size(&self) -> Option<u64> {
        self.max_file_size
    }

    /// Start of the period the trigger currently considers active.
    pub fn current_period_start(&self) -> OffsetDateTime {
        self.lock_window().current_start
    }

    /// `%i` value of the archive the active file will become.
    pub fn current_index(&self) -> u32 {
        self.lock_window().index
    }

    /// Nanosecond timestamp of the next period boundary.
    pub fn next_check_ns(&self) -> u64 {
        self.lock_window().next_check_ns
    }

    fn lock_window(&self) -> MutexGuard<'_, PeriodWindow> {
        self.window.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn advance(&self, window: &mut PeriodWindow, now_ns: u64) -> Result<()> {
        let periodicity = self.pattern.periodicity();
        let start = period_start(now_ns, periodicity, self.offset)?;
        let next = next_period_start(start, periodicity)?;
        window.elapsed_name = self.pattern.render(window.current_start, window.index);
        window.current_start = start;
        window.index = first_free_index(&self.pattern, start, 0);
        window.next_check_ns = to_unix_nanos(next);
        Ok(())
    }

    fn bump_index(&self, window: &mut PeriodWindow) {
        window.elapsed_name = self.pattern.render(window.current_start, window.index);
        window.index = first_free_index(&self.pattern, window.current_start, window.index + 1);
    }

    /// Index to use for the period containing `now_ns`: the tracked one for
    /// the current period, otherwise the first free one.
    fn index_for(&self, start: OffsetDateTime) -> u32 {
        let window = self.lock_window();
        if window.current_start == start {
            window.index
        } else {
            first_free_index(&self.pattern, start, 0)
        }
    }
}

impl RolloverTrigger for TimeBasedTrigger {
    fn is_triggering(&self, now_ns: u64, active_len: u64) -> bool {
        let mut window = self.lock_window();
        if now_ns < window.next_check_ns {
            return match self.max_file_size {
                Some(max) if active_len >= max => {
                    self.bump_index(&mut window);
                    log::debug!(
                        "active file reached {active_len} bytes, next archive {}",
                        window.elapsed_name.display()
                    );
                    true
                }
                _ => false,
            };
        }
        match self.advance(&mut window, now_ns) {
            Ok(()) => {
                log::debug!(
                    "period elapsed, next archive {}",
                    window.elapsed_name.display()
                );
                true
            }
            Err(err) => {
                log::warn!("failed to compute next period for {}: {err}", self.pattern);
                false
            }
        }
    }

    fn elapsed_period_archive_name(&self) -> PathBuf {
        self.lock_window().elapsed_name.clone()
    }

    fn current_period_archive_name(&self, now_ns: u64) -> Result<PathBuf> {
        let start = period_start(now_ns, self.pattern.periodicity(), self.offset)?;
        Ok(self.pattern.render(start, self.index_for(start)))
    }

    fn current_period_active_name(&self, now_ns: u64) -> Result<PathBuf> {
        let start = period_start(now_ns, self.pattern.periodicity(), self.offset)?;
        Ok(self
            .pattern
            .render_without_compression_suffix(start, self.index_for(start)))
    }

    fn compression(&self) -> CompressionMode {
        self.pattern.compression()
    }
}

/// First `%i` at or after `from` whose archive does not exist yet, so archives
/// left by an earlier run are never targeted again.
fn first_free_index(pattern: &FileNamePattern, start: OffsetDateTime, from: u32) -> u32 {
    if !pattern.has_index() {
        return 0;
    }
    (from..from.saturating_add(MAX_INDEX_PROBES))
        .find(|&index| !pattern.render(start, index).exists())
        .unwrap_or(from)
}

/// Parse a size such as `10KB`, `5 MB`, `1gb` or `4096` into bytes (powers of
/// 1024).
pub fn parse_file_size(s: &str) -> Result<u64> {
    let trimmed = s.trim();
    let split = trimmed
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(trimmed.len());
    let (digits, unit) = trimmed.split_at(split);
    let value: u64 = digits
        .parse()
        .map_err(|_| Error::InvalidFileSize(s.to_string()))?;
    let multiplier: u64 = match unit.trim().to_ascii_uppercase().as_str() {
        "" | "B" => 1,
        "KB" => 1 << 10,
        "MB" => 1 << 20,
        "GB" => 1 << 30,
        _ => return Err(Error::InvalidFileSize(s.to_string())),
    };
    value
        .checked_mul(multiplier)
        .ok_or_else(|| Error::InvalidFileSize(s.to_string()))
}

/// Start of the period containing `now_ns`, in the given offset.
pub fn period_start(
    now_ns: u64,
    periodicity: Periodicity,
    offset: UtcOffset,
) -> Result<OffsetDateTime> {
    let dt = OffsetDateTime::from_unix_timestamp_nanos(now_ns as i128)
        .map_err(out_of_range)?
        .to_offset(offset);
    let date = dt.date();
    let (hour, minute, second) = (dt.hour(), dt.minute(), dt.second());

    let (date, time) = match periodicity {
        Periodicity::Yearly => (
            Date::from_calendar_date(date.year(), Month::January, 1).map_err(out_of_range)?,
            Time::MIDNIGHT,
        ),
        Periodicity::Monthly => (
            Date::from_calendar_date(date.year(), date.month(), 1).map_err(out_of_range)?,
            Time::MIDNIGHT,
        ),
        Periodicity::Daily => (date, Time::MIDNIGHT),
        Periodicity::Hourly => (date, Time::from_hms(hour, 0, 0).map_err(out_of_range)?),
        Periodicity::Minutely => (date, Time::from_hms(hour, minute, 0).map_err(out_of_range)?),
        Periodicity::Secondly => (
            date,
            Time::from_hms(hour, minute, second).map_err(out_of_range)?,
        ),
    };
    Ok(date.with_time(time).assume_offset(offset))
}

/// Start of the period following the one starting at `start`.
pub fn next_period_start(start: OffsetDateTime, periodicity: Periodicity) -> Result<OffsetDateTime> {
    let step = match periodicity {
        Periodicity::Secondly => time::Duration::SECOND,
        Periodicity::Minutely => time::Duration::MINUTE,
        Periodicity::Hourly => time::Duration::HOUR,
        Periodicity::Daily => time::Duration::DAY,
        Periodicity::Monthly => {
            let (year, month) = match start.month() {
                Month::December => (start.year() + 1, Month::January),
                month => (start.year(), month.next()),
            };
            let date = Date::from_calendar_date(year, month, 1).map_err(out_of_range)?;
            return Ok(start.replace_date(date));
        }
        Periodicity::Yearly => {
            let date =
                Date::from_calendar_date(start.year() + 1, Month::January, 1).map_err(out_of_range)?;
            return Ok(start.replace_date(date));
        }
    };
    start
        .checked_add(step)
        .ok_or_else(|| Error::Rollover("period boundary out of range".to_string()))
}

fn to_unix_nanos(dt: OffsetDateTime) -> u64 {
    u64::try_from(dt.unix_timestamp_nanos()).unwrap_or(0)
}

fn out_of_range(err: impl std::fmt::Display) -> Error {
    Error::Rollover(format!("timestamp out of range: {err}"))
}
