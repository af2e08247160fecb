use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Result;
use tempfile::tempdir;

use logroll::{
    parse_file_size, CloseRollingPolicy, DeletionRetry, Error, FileNamePattern, FileRemover,
    ManualClock, RollingFileWriter, RolloverConfig, RolloverState, TimeBasedTrigger, Timezone,
    WriterConfig,
};

// 2024-01-29 12:00:00 UTC
const NOON_NS: u64 = 1_706_529_600_000_000_000;

fn build_policy(dir: &Path, pattern: &str, config: RolloverConfig) -> CloseRollingPolicy {
    let pattern = FileNamePattern::parse(&dir.join(pattern).to_string_lossy()).expect("pattern");
    let trigger = TimeBasedTrigger::new(pattern, Timezone::UTC, NOON_NS).expect("trigger");
    CloseRollingPolicy::new(config, Arc::new(trigger), Arc::new(ManualClock::new(NOON_NS)))
}

fn files_with_suffix(dir: &Path, suffix: &str) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = std::fs::read_dir(dir)
        .expect("read dir")
        .map(|entry| entry.expect("entry").path())
        .filter(|path| path.to_string_lossy().ends_with(suffix))
        .collect();
    files.sort();
    files
}

fn gunzip(path: &Path) -> Vec<u8> {
    let mut decoder = flate2::read::GzDecoder::new(std::fs::File::open(path).expect("open gz"));
    let mut out = Vec::new();
    decoder.read_to_end(&mut out).expect("decode gz");
    out
}

/// Refuses removal while a simulated reader holds the file.
struct ReaderLock {
    held_until: Instant,
    calls: AtomicU32,
    removed_at: Mutex<Option<Instant>>,
}

impl ReaderLock {
    fn hold_for(duration: Duration) -> Self {
        Self {
            held_until: Instant::now() + duration,
            calls: AtomicU32::new(0),
            removed_at: Mutex::new(None),
        }
    }
}

impl FileRemover for ReaderLock {
    fn remove(&self, path: &Path) -> io::Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if Instant::now() < self.held_until {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "file is open in another process",
            ));
        }
        std::fs::remove_file(path)?;
        *self.removed_at.lock().expect("lock") = Some(Instant::now());
        Ok(())
    }
}

/// Checks that the archive is complete before letting the source go.
struct ArchiveCheck {
    archive: PathBuf,
    archive_ready: AtomicBool,
    calls: AtomicU32,
}

impl FileRemover for ArchiveCheck {
    fn remove(&self, path: &Path) -> io::Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let ready = std::fs::metadata(&self.archive)
            .map(|meta| meta.len() > 0)
            .unwrap_or(false);
        self.archive_ready.store(ready, Ordering::SeqCst);
        std::fs::remove_file(path)
    }
}

#[test]
fn shutdown_without_compression_leaves_one_archive() -> Result<()> {
    let dir = tempdir()?;
    let policy = Arc::new(build_policy(
        dir.path(),
        "app-%d{yyyy-MM-dd}.log",
        RolloverConfig::new(dir.path().join("app.log")),
    ));
    let writer = RollingFileWriter::open(WriterConfig::default(), Arc::clone(&policy))?;
    writer.append(b"first record")?;
    writer.stop()?;

    let archives = files_with_suffix(dir.path(), ".log");
    assert_eq!(archives, vec![dir.path().join("app-2024-01-29.log")]);
    assert_eq!(std::fs::read_to_string(&archives[0])?, "first record\n");
    assert!(files_with_suffix(dir.path(), ".tmp").is_empty());
    assert!(policy.pending_deletion().is_none());
    Ok(())
}

#[test]
fn shutdown_compresses_and_removes_raw_file() -> Result<()> {
    let dir = tempdir()?;
    let archive = dir.path().join("app-2024-01-29.log.gz");
    let check = Arc::new(ArchiveCheck {
        archive: archive.clone(),
        archive_ready: AtomicBool::new(false),
        calls: AtomicU32::new(0),
    });
    let policy = Arc::new(
        build_policy(
            dir.path(),
            "app-%d.log.gz",
            RolloverConfig::new(dir.path().join("app.log")),
        )
        .with_remover(check.clone()),
    );
    let writer = RollingFileWriter::open(WriterConfig::default(), Arc::clone(&policy))?;
    writer.append(b"alpha")?;
    writer.append(b"bravo")?;
    writer.stop()?;

    // Shutdown blocks on compression, so the archive is already complete.
    assert!(archive.exists());
    let report = policy.pending_deletion().expect("deletion task").wait();
    assert!(report.is_ok());

    assert!(check.archive_ready.load(Ordering::SeqCst));
    assert_eq!(check.calls.load(Ordering::SeqCst), 1);
    assert_eq!(gunzip(&archive), b"alpha\nbravo\n");
    assert!(files_with_suffix(dir.path(), ".tmp").is_empty());
    assert!(!dir.path().join("app.log").exists());
    Ok(())
}

#[test]
fn zip_archive_per_month() -> Result<()> {
    let dir = tempdir()?;
    let policy = Arc::new(build_policy(
        dir.path(),
        "%d{MM}.txt.zip",
        RolloverConfig::new(dir.path().join("current.txt")),
    ));
    let writer = RollingFileWriter::open(WriterConfig::default(), Arc::clone(&policy))?;
    writer.append(b"msg")?;
    writer.stop()?;
    policy.pending_deletion().expect("deletion task").wait().expect("deleted");

    assert!(files_with_suffix(dir.path(), ".txt").is_empty());
    let zips = files_with_suffix(dir.path(), ".zip");
    assert_eq!(zips, vec![dir.path().join("01.txt.zip")]);

    let mut archive = zip::ZipArchive::new(std::fs::File::open(&zips[0])?)?;
    assert_eq!(archive.len(), 1);
    let mut entry = archive.by_index(0)?;
    assert_eq!(entry.name(), "01.txt");
    let mut body = String::new();
    entry.read_to_string(&mut body)?;
    assert_eq!(body, "msg\n");
    Ok(())
}

#[test]
fn second_shutdown_is_a_noop() -> Result<()> {
    let dir = tempdir()?;
    let check = Arc::new(ArchiveCheck {
        archive: dir.path().join("app-2024-01-29.log.gz"),
        archive_ready: AtomicBool::new(false),
        calls: AtomicU32::new(0),
    });
    let policy = build_policy(
        dir.path(),
        "app-%d.log.gz",
        RolloverConfig::new(dir.path().join("app.log")),
    )
    .with_remover(check.clone());

    std::fs::write(dir.path().join("app.log"), b"period data\n")?;
    policy.on_shutdown();
    let first = policy.pending_deletion().expect("deletion task");
    first.wait().expect("deleted");

    std::fs::write(dir.path().join("app.log"), b"after stop\n")?;
    policy.on_shutdown();

    assert_eq!(policy.state(), RolloverState::Rolled);
    assert_eq!(check.calls.load(Ordering::SeqCst), 1);
    assert_eq!(
        std::fs::read(dir.path().join("app.log"))?,
        b"after stop\n",
        "second call must not touch the active file"
    );
    assert_eq!(files_with_suffix(dir.path(), ".gz").len(), 1);
    Ok(())
}

#[test]
fn failed_compression_keeps_uncompressed_data() -> Result<()> {
    let dir = tempdir()?;
    let policy = build_policy(
        dir.path(),
        "app-%d.log.gz",
        RolloverConfig::new(dir.path().join("app.log")),
    );

    // An archive from an earlier run makes compression fail.
    std::fs::write(dir.path().join("app-2024-01-29.log.gz"), b"earlier archive")?;
    std::fs::write(dir.path().join("app.log"), b"unflushed period\n")?;

    policy.on_shutdown();
    let err = policy
        .pending_deletion()
        .expect("deletion task")
        .wait()
        .unwrap_err();
    assert!(matches!(*err, Error::SourceRetained { .. }));

    let leftovers = files_with_suffix(dir.path(), ".tmp");
    assert_eq!(leftovers.len(), 1);
    assert_eq!(std::fs::read(&leftovers[0])?, b"unflushed period\n");
    assert_eq!(
        std::fs::read(dir.path().join("app-2024-01-29.log.gz"))?,
        b"earlier archive"
    );
    Ok(())
}

#[test]
fn deletion_waits_for_reader_to_release_file() -> Result<()> {
    let dir = tempdir()?;
    let lock = Arc::new(ReaderLock::hold_for(Duration::from_millis(200)));
    let policy = build_policy(
        dir.path(),
        "app-%d.log.gz",
        RolloverConfig::new(dir.path().join("app.log")),
    )
    .with_remover(lock.clone());

    std::fs::write(dir.path().join("app.log"), b"held by reader\n")?;
    let started = Instant::now();
    policy.on_shutdown();
    let deletion = policy.pending_deletion().expect("deletion task");
    let report = deletion.wait().expect("deleted once released");

    assert!(report.attempts > 1);
    let removed_at = (*lock.removed_at.lock().expect("lock")).expect("removed");
    assert!(removed_at >= lock.held_until);
    assert!(removed_at.duration_since(started) < Duration::from_secs(2));
    assert!(files_with_suffix(dir.path(), ".tmp").is_empty());
    assert_eq!(
        gunzip(&dir.path().join("app-2024-01-29.log.gz")),
        b"held by reader\n"
    );
    Ok(())
}

#[test]
fn deletion_gives_up_when_ceiling_is_too_low() -> Result<()> {
    let dir = tempdir()?;
    let lock = Arc::new(ReaderLock::hold_for(Duration::from_millis(200)));
    let mut config = RolloverConfig::new(dir.path().join("app.log"));
    config.deletion_retry = DeletionRetry::fixed(2, Duration::from_millis(10));
    let policy = build_policy(dir.path(), "app-%d.log.gz", config).with_remover(lock.clone());

    std::fs::write(dir.path().join("app.log"), b"held by reader\n")?;
    policy.on_shutdown();
    let err = policy
        .pending_deletion()
        .expect("deletion task")
        .wait()
        .unwrap_err();

    assert!(matches!(*err, Error::DeletionGaveUp { attempts: 2, .. }));
    assert_eq!(lock.calls.load(Ordering::SeqCst), 2);
    // The archive is complete; the raw copy is left for manual cleanup.
    assert!(dir.path().join("app-2024-01-29.log.gz").exists());
    assert_eq!(files_with_suffix(dir.path(), ".tmp").len(), 1);
    Ok(())
}

#[test]
fn permanently_locked_file_terminates() -> Result<()> {
    let dir = tempdir()?;
    let lock = Arc::new(ReaderLock::hold_for(Duration::from_secs(3600)));
    let mut config = RolloverConfig::new(dir.path().join("app.log"));
    config.deletion_retry = DeletionRetry::default()
        .initial_delay(Duration::from_millis(1))
        .max_delay(Duration::from_millis(5))
        .max_attempts(6);
    let policy = build_policy(dir.path(), "app-%d.log.gz", config).with_remover(lock.clone());

    std::fs::write(dir.path().join("app.log"), b"x\n")?;
    let handle = thread::spawn(move || {
        policy.on_shutdown();
        policy.pending_deletion().expect("deletion task").wait()
    });
    let err = handle.join().expect("join").unwrap_err();

    assert!(matches!(*err, Error::DeletionGaveUp { attempts: 6, .. }));
    assert_eq!(lock.calls.load(Ordering::SeqCst), 6);
    Ok(())
}

fn zip_entry(path: &Path) -> Result<(String, String)> {
    let mut archive = zip::ZipArchive::new(std::fs::File::open(path)?)?;
    assert_eq!(archive.len(), 1);
    let mut entry = archive.by_index(0)?;
    let mut body = String::new();
    entry.read_to_string(&mut body)?;
    Ok((entry.name().to_string(), body))
}

fn indexed_policy(dir: &Path, max_file_size: &str) -> Arc<CloseRollingPolicy> {
    let pattern = FileNamePattern::parse(&dir.join("%d{MM}.%i.txt.zip").to_string_lossy())
        .expect("pattern");
    let trigger = TimeBasedTrigger::new(pattern, Timezone::UTC, NOON_NS)
        .expect("trigger")
        .with_max_file_size(parse_file_size(max_file_size).expect("size"))
        .expect("indexed pattern");
    Arc::new(CloseRollingPolicy::new(
        RolloverConfig::prudent(),
        Arc::new(trigger),
        Arc::new(ManualClock::new(NOON_NS)),
    ))
}

#[test]
fn indexed_zip_with_header_and_footer() -> Result<()> {
    let dir = tempdir()?;
    let policy = indexed_policy(dir.path(), "10KB");
    let config = WriterConfig {
        header: Some("--INIT--".to_string()),
        footer: Some("--CLOSE--".to_string()),
        immediate_flush: false,
    };
    let writer = RollingFileWriter::open(config, Arc::clone(&policy))?;
    assert_eq!(writer.active_path(), dir.path().join("01.0.txt"));
    writer.append(b"msg")?;
    writer.stop()?;
    policy.pending_deletion().expect("deletion task").wait().expect("deleted");

    assert_eq!(files_with_suffix(dir.path(), ""), vec![dir.path().join("01.0.txt.zip")]);
    let (name, body) = zip_entry(&dir.path().join("01.0.txt.zip"))?;
    assert_eq!(name, "01.0.txt");
    assert_eq!(body, "--INIT--\nmsg\n--CLOSE--\n");
    Ok(())
}

#[test]
fn size_ceiling_rolls_within_period() -> Result<()> {
    let dir = tempdir()?;
    // An archive from an earlier run keeps index 0 taken.
    std::fs::write(dir.path().join("01.0.txt.zip"), b"earlier run")?;
    let policy = indexed_policy(dir.path(), "10");
    let writer = RollingFileWriter::open(WriterConfig::default(), Arc::clone(&policy))?;
    assert_eq!(writer.active_path(), dir.path().join("01.1.txt"));

    writer.append(b"0123456789")?;
    // The file holds 11 bytes now, so this record starts the next index.
    writer.append(b"abc")?;
    let scheduled = policy.pending_deletion().expect("size rollover");
    writer.append(b"defghij")?;
    writer.stop()?;
    scheduled.wait().expect("first raw file deleted");
    policy.pending_deletion().expect("deletion task").wait().expect("deleted");

    assert_eq!(
        files_with_suffix(dir.path(), ""),
        vec![
            dir.path().join("01.0.txt.zip"),
            dir.path().join("01.1.txt.zip"),
            dir.path().join("01.2.txt.zip"),
        ]
    );
    assert_eq!(std::fs::read(dir.path().join("01.0.txt.zip"))?, b"earlier run");
    assert_eq!(
        zip_entry(&dir.path().join("01.1.txt.zip"))?,
        ("01.1.txt".to_string(), "0123456789\n".to_string())
    );
    assert_eq!(
        zip_entry(&dir.path().join("01.2.txt.zip"))?,
        ("01.2.txt".to_string(), "abc\ndefghij\n".to_string())
    );
    Ok(())
}
