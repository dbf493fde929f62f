use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::{debug, info, warn};

pub const LOCK_SUFFIX: &str = ".lock";
pub const QUARANTINE_MARKER: &str = ".lock.stale.";
pub const ENV_STALE_THRESHOLD: &str = "COHORT_STALE_THRESHOLD";
pub const ENV_STALE_CLEANUP_DAYS: &str = "COHORT_STALE_CLEANUP_DAYS";
pub const DEFAULT_STALE_THRESHOLD_SECS: u64 = 120;
pub const DEFAULT_CLEANUP_DAYS: u64 = 7;
pub const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum LockFileError {
    #[error("failed to create lock file {path}: {source}")]
    Create {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to write lock metadata {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to release lock file {path}: {source}")]
    Release {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to scan {path} for quarantined locks: {source}")]
    Scan {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Clone)]
pub struct LockFileConfig {
    pub stale_threshold: Duration,
    /// Quarantined files older than this many days are purged; 0 disables.
    pub cleanup_days: u64,
    pub timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for LockFileConfig {
    fn default() -> Self {
        Self {
            stale_threshold: Duration::from_secs(DEFAULT_STALE_THRESHOLD_SECS),
            cleanup_days: DEFAULT_CLEANUP_DAYS,
            timeout: DEFAULT_ACQUIRE_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

impl LockFileConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(secs) = env_u64(ENV_STALE_THRESHOLD) {
            config.stale_threshold = Duration::from_secs(secs);
        }
        if let Some(days) = env_u64(ENV_STALE_CLEANUP_DAYS) {
            config.cleanup_days = days;
        }
        config
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

fn env_u64(key: &str) -> Option<u64> {
    let raw = std::env::var(key).ok()?;
    match raw.trim().parse::<u64>() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(event = "lockfile_env_invalid", key, value = %raw);
            None
        }
    }
}

/// Contents of a `.lock` file. Legacy files carry only a bare pid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockFileMeta {
    pub pid: u32,
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default, alias = "acquired_at_utc")]
    pub acquired_at_epoch: Option<f64>,
    #[serde(default)]
    pub ttl_seconds: Option<u64>,
}

impl LockFileMeta {
    pub fn parse(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        if let Ok(meta) = serde_json::from_str::<LockFileMeta>(trimmed) {
            return Some(meta);
        }
        trimmed.parse::<u32>().ok().map(|pid| LockFileMeta {
            pid,
            hostname: None,
            acquired_at_epoch: None,
            ttl_seconds: None,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HolderInfo {
    pub pid: Option<u32>,
    pub hostname: Option<String>,
    pub age_secs: Option<u64>,
    pub ttl_secs: Option<u64>,
}

impl fmt::Display for HolderInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let pid = self.pid.map_or_else(|| "?".to_string(), |p| p.to_string());
        let host = self.hostname.as_deref().unwrap_or("?");
        let age = self.age_secs.map_or_else(|| "?".to_string(), |a| format!("{a}s"));
        write!(f, "pid={pid}, host={host}, age={age}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Staleness {
    Fresh,
    LiveHolder,
    Stale,
}

/// Decides whether an existing lock may be broken.
///
/// A lock younger than the threshold is always honoured. Past the threshold it
/// is still honoured when it was taken on this host by a process that is alive.
pub fn assess_staleness(
    meta: Option<&LockFileMeta>,
    age: Duration,
    threshold: Duration,
    local_host: &str,
    is_alive: impl Fn(u32) -> bool,
) -> Staleness {
    if age <= threshold {
        return Staleness::Fresh;
    }
    let Some(meta) = meta else {
        return Staleness::Stale;
    };
    let same_host = meta.hostname.as_deref().map_or(true, |h| h == local_host);
    if same_host && is_alive(meta.pid) {
        return Staleness::LiveHolder;
    }
    Staleness::Stale
}

#[cfg(target_os = "linux")]
pub fn is_process_alive(pid: u32) -> bool {
    pid != 0 && Path::new(&format!("/proc/{pid}")).exists()
}

#[cfg(not(target_os = "linux"))]
pub fn is_process_alive(pid: u32) -> bool {
    pid != 0
}

pub fn local_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string())
}

pub fn lock_path_for(path: &Path) -> PathBuf {
    let mut os: OsString = path.as_os_str().to_owned();
    os.push(LOCK_SUFFIX);
    PathBuf::from(os)
}

fn epoch_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0.0, |d| d.as_secs_f64())
}

fn file_age(path: &Path) -> Option<Duration> {
    let modified = fs::metadata(path).and_then(|m| m.modified()).ok()?;
    Some(SystemTime::now().duration_since(modified).unwrap_or_default())
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StaleCounts {
    pub quarantined: u64,
    pub removed: u64,
    pub purged: u64,
}

/// Counters for stale-lock handling; readable and resettable from any thread.
#[derive(Debug, Default)]
pub struct StaleStats {
    quarantined: AtomicU64,
    removed: AtomicU64,
    purged: AtomicU64,
}

impl StaleStats {
    pub fn snapshot(&self) -> StaleCounts {
        StaleCounts {
            quarantined: self.quarantined.load(Ordering::Relaxed),
            removed: self.removed.load(Ordering::Relaxed),
            purged: self.purged.load(Ordering::Relaxed),
        }
    }

    pub fn reset(&self) -> StaleCounts {
        StaleCounts {
            quarantined: self.quarantined.swap(0, Ordering::Relaxed),
            removed: self.removed.swap(0, Ordering::Relaxed),
            purged: self.purged.swap(0, Ordering::Relaxed),
        }
    }
}

/// Removes quarantined lock files in `dir` older than `retention`.
pub fn purge_quarantined(dir: &Path, retention: Duration) -> Result<usize, LockFileError> {
    let entries = fs::read_dir(dir).map_err(|source| LockFileError::Scan {
        path: dir.to_path_buf(),
        source,
    })?;
    let mut purged = 0;
    for entry in entries.flatten() {
        let name = entry.file_name();
        if !name.to_string_lossy().contains(QUARANTINE_MARKER) {
            continue;
        }
        let path = entry.path();
        let expired = file_age(&path).is_some_and(|age| age > retention);
        if expired && fs::remove_file(&path).is_ok() {
            debug!(event = "lockfile_purged", path = %path.display());
            purged += 1;
        }
    }
    Ok(purged)
}

#[derive(Debug)]
pub enum DiskAcquire {
    Acquired(DiskLockGuard),
    Held(HolderInfo),
}

impl DiskAcquire {
    pub fn is_acquired(&self) -> bool {
        matches!(self, DiskAcquire::Acquired(_))
    }
}

/// Owns a `.lock` file; dropping it removes the file if it is still ours.
#[derive(Debug)]
pub struct DiskLockGuard {
    lock_path: PathBuf,
    pid: u32,
    hostname: String,
    released: bool,
}

impl DiskLockGuard {
    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }

    pub fn release(mut self) -> Result<(), LockFileError> {
        self.released = true;
        self.remove_if_owned()
    }

    fn remove_if_owned(&self) -> Result<(), LockFileError> {
        let owned = fs::read_to_string(&self.lock_path)
            .ok()
            .and_then(|raw| LockFileMeta::parse(&raw))
            .is_some_and(|meta| {
                meta.pid == self.pid
                    && meta.hostname.as_deref().map_or(true, |h| h == self.hostname)
            });
        if !owned {
            return Ok(());
        }
        match fs::remove_file(&self.lock_path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(LockFileError::Release {
                path: self.lock_path.clone(),
                source,
            }),
        }
    }
}

impl Drop for DiskLockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(err) = self.remove_if_owned() {
            warn!(event = "lockfile_release_failed", error = %err);
        }
    }
}

/// Cross-process advisory locks backed by `<path>.lock` files.
#[derive(Debug)]
pub struct DiskLocker {
    config: LockFileConfig,
    hostname: String,
    pid: u32,
    stats: StaleStats,
}

impl DiskLocker {
    pub fn new(config: LockFileConfig) -> Self {
        Self {
            config,
            hostname: local_hostname(),
            pid: std::process::id(),
            stats: StaleStats::default(),
        }
    }

    pub fn config(&self) -> &LockFileConfig {
        &self.config
    }

    pub fn stats(&self) -> &StaleStats {
        &self.stats
    }

    /// Polls for `<path>.lock` until acquired or the configured timeout elapses.
    /// Stale locks met along the way are quarantined and the attempt retried.
    pub fn acquire(&self, path: &Path) -> Result<DiskAcquire, LockFileError> {
        self.acquire_with_ttl(path, self.config.stale_threshold)
    }

    /// Like [`DiskLocker::acquire`], recording `ttl` as the lock's lifetime.
    pub fn acquire_with_ttl(&self, path: &Path, ttl: Duration) -> Result<DiskAcquire, LockFileError> {
        let lock_path = lock_path_for(path);
        if let Some(dir) = lock_path.parent().filter(|d| !d.as_os_str().is_empty()) {
            if self.config.cleanup_days > 0 {
                let retention = Duration::from_secs(self.config.cleanup_days * 86_400);
                match purge_quarantined(dir, retention) {
                    Ok(n) => {
                        self.stats.purged.fetch_add(n as u64, Ordering::Relaxed);
                    }
                    Err(err) => debug!(event = "lockfile_purge_skipped", error = %err),
                }
            }
        }

        let started = std::time::Instant::now();
        loop {
            match self.try_create(&lock_path, ttl)? {
                Some(guard) => return Ok(DiskAcquire::Acquired(guard)),
                None => {
                    if self.break_if_stale(&lock_path) {
                        continue;
                    }
                }
            }
            if started.elapsed() >= self.config.timeout {
                let holder = self.holder_info(&lock_path);
                info!(
                    event = "lockfile_busy",
                    path = %lock_path.display(),
                    holder = %holder
                );
                return Ok(DiskAcquire::Held(holder));
            }
            thread::sleep(self.config.poll_interval);
        }
    }

    pub fn holder_info(&self, lock_path: &Path) -> HolderInfo {
        let meta = fs::read_to_string(lock_path)
            .ok()
            .and_then(|raw| LockFileMeta::parse(&raw));
        let age = meta
            .as_ref()
            .and_then(|m| m.acquired_at_epoch)
            .map(|at| (epoch_now() - at).max(0.0) as u64)
            .or_else(|| file_age(lock_path).map(|d| d.as_secs()));
        HolderInfo {
            pid: meta.as_ref().map(|m| m.pid),
            ttl_secs: meta.as_ref().and_then(|m| m.ttl_seconds),
            hostname: meta.and_then(|m| m.hostname),
            age_secs: age,
        }
    }

    fn try_create(&self, lock_path: &Path, ttl: Duration) -> Result<Option<DiskLockGuard>, LockFileError> {
        let mut file = match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(lock_path)
        {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => return Ok(None),
            Err(source) => {
                return Err(LockFileError::Create {
                    path: lock_path.to_path_buf(),
                    source,
                })
            }
        };
        let meta = LockFileMeta {
            pid: self.pid,
            hostname: Some(self.hostname.clone()),
            acquired_at_epoch: Some(epoch_now()),
            ttl_seconds: Some(ttl.as_secs()),
        };
        let guard = DiskLockGuard {
            lock_path: lock_path.to_path_buf(),
            pid: self.pid,
            hostname: self.hostname.clone(),
            released: false,
        };
        let body = serde_json::to_string(&meta).unwrap_or_else(|_| self.pid.to_string());
        file.write_all(body.as_bytes())
            .and_then(|()| file.sync_all())
            .map_err(|source| LockFileError::Write {
                path: lock_path.to_path_buf(),
                source,
            })?;
        debug!(event = "lockfile_acquired", path = %lock_path.display());
        Ok(Some(guard))
    }

    /// Holder of `<path>.lock` while that lock is present and still honoured.
    pub fn live_holder(&self, path: &Path) -> Option<HolderInfo> {
        let lock_path = lock_path_for(path);
        match self.staleness(&lock_path)? {
            Staleness::Stale => None,
            Staleness::Fresh | Staleness::LiveHolder => Some(self.holder_info(&lock_path)),
        }
    }

    /// `None` when the lock file is gone.
    fn staleness(&self, lock_path: &Path) -> Option<Staleness> {
        let meta = fs::read_to_string(lock_path)
            .ok()
            .and_then(|raw| LockFileMeta::parse(&raw));
        let age = meta
            .as_ref()
            .and_then(|m| m.acquired_at_epoch)
            .map(|at| Duration::from_secs_f64((epoch_now() - at).max(0.0)))
            .or_else(|| file_age(lock_path))?;
        let threshold = meta
            .as_ref()
            .and_then(|m| m.ttl_seconds)
            .map_or(self.config.stale_threshold, Duration::from_secs);
        Some(assess_staleness(
            meta.as_ref(),
            age,
            threshold,
            &self.hostname,
            is_process_alive,
        ))
    }

    fn break_if_stale(&self, lock_path: &Path) -> bool {
        match self.staleness(lock_path) {
            // Vanished between create and stat; retry immediately.
            None => !lock_path.exists(),
            Some(Staleness::Stale) => self.quarantine(lock_path),
            Some(_) => false,
        }
    }

    /// Renames a stale lock aside, falling back to deleting it.
    fn quarantine(&self, lock_path: &Path) -> bool {
        let stamp = epoch_now() as u64;
        let mut target = lock_path.as_os_str().to_owned();
        target.push(format!(".stale.{stamp}"));
        let target = PathBuf::from(target);
        match fs::rename(lock_path, &target) {
            Ok(()) => {
                self.stats.quarantined.fetch_add(1, Ordering::Relaxed);
                warn!(
                    event = "lockfile_quarantined",
                    path = %lock_path.display(),
                    target = %target.display()
                );
                true
            }
            Err(rename_err) => match fs::remove_file(lock_path) {
                Ok(()) => {
                    self.stats.removed.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        event = "lockfile_stale_removed",
                        path = %lock_path.display(),
                        rename_error = %rename_err
                    );
                    true
                }
                Err(err) if err.kind() == io::ErrorKind::NotFound => true,
                Err(err) => {
                    warn!(event = "lockfile_quarantine_failed", path = %lock_path.display(), error = %err);
                    false
                }
            },
        }
    }
}

impl Default for DiskLocker {
    fn default() -> Self {
        Self::new(LockFileConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quick() -> LockFileConfig {
        LockFileConfig {
            stale_threshold: Duration::from_secs(120),
            cleanup_days: 0,
            timeout: Duration::from_millis(150),
            poll_interval: Duration::from_millis(20),
        }
    }

    #[test]
    fn parses_json_and_legacy_metadata() {
        let meta = LockFileMeta::parse(
            r#"{"pid":42,"hostname":"box","acquired_at_utc":1700000000.5,"ttl_seconds":300}"#,
        )
        .expect("json meta");
        assert_eq!(meta.pid, 42);
        assert_eq!(meta.hostname.as_deref(), Some("box"));
        assert_eq!(meta.acquired_at_epoch, Some(1_700_000_000.5));

        let legacy = LockFileMeta::parse("1234\n").expect("legacy meta");
        assert_eq!(legacy.pid, 1234);
        assert!(legacy.hostname.is_none());
        assert!(LockFileMeta::parse("garbage").is_none());
    }

    #[test]
    fn staleness_rules() {
        let threshold = Duration::from_secs(120);
        let meta = LockFileMeta {
            pid: 7,
            hostname: Some("here".into()),
            acquired_at_epoch: None,
            ttl_seconds: None,
        };
        let young = Duration::from_secs(10);
        let old = Duration::from_secs(500);

        assert_eq!(
            assess_staleness(Some(&meta), young, threshold, "here", |_| false),
            Staleness::Fresh
        );
        assert_eq!(
            assess_staleness(Some(&meta), threshold, threshold, "here", |_| false),
            Staleness::Fresh
        );
        assert_eq!(
            assess_staleness(Some(&meta), old, threshold, "here", |_| true),
            Staleness::LiveHolder
        );
        assert_eq!(
            assess_staleness(Some(&meta), old, threshold, "here", |_| false),
            Staleness::Stale
        );
        // A live pid on another host says nothing about the holder.
        assert_eq!(
            assess_staleness(Some(&meta), old, threshold, "elsewhere", |_| true),
            Staleness::Stale
        );
        assert_eq!(
            assess_staleness(None, old, threshold, "here", |_| true),
            Staleness::Stale
        );
    }

    #[test]
    fn acquire_release_and_contention() {
        let dir = tempfile::tempdir().expect("tempdir");
        let target = dir.path().join("src.py");
        let locker = DiskLocker::new(quick());

        let first = locker.acquire(&target).expect("acquire");
        let DiskAcquire::Acquired(guard) = first else {
            panic!("expected acquisition");
        };
        assert!(dir.path().join("src.py.lock").exists());

        match locker.acquire(&target).expect("second acquire") {
            DiskAcquire::Held(holder) => {
                assert_eq!(holder.pid, Some(std::process::id()));
                assert!(holder.to_string().starts_with("pid="));
            }
            DiskAcquire::Acquired(_) => panic!("lock must be exclusive"),
        }

        assert_eq!(
            locker.live_holder(&target).and_then(|h| h.pid),
            Some(std::process::id())
        );

        guard.release().expect("release");
        assert!(!dir.path().join("src.py.lock").exists());
        assert!(locker.live_holder(&target).is_none());
        assert!(locker.acquire(&target).expect("reacquire").is_acquired());
    }

    #[test]
    fn lock_file_records_the_requested_ttl() {
        let dir = tempfile::tempdir().expect("tempdir");
        let target = dir.path().join("c.py");
        let locker = DiskLocker::new(quick());
        let DiskAcquire::Acquired(guard) = locker
            .acquire_with_ttl(&target, Duration::from_secs(300))
            .expect("acquire")
        else {
            panic!("expected acquisition");
        };
        let raw = fs::read_to_string(guard.lock_path()).expect("read meta");
        let meta = LockFileMeta::parse(&raw).expect("meta");
        assert_eq!(meta.ttl_seconds, Some(300));
        assert_eq!(meta.pid, std::process::id());
        assert_eq!(locker.holder_info(guard.lock_path()).ttl_secs, Some(300));
        guard.release().expect("release");

        let DiskAcquire::Acquired(guard) = locker.acquire(&target).expect("acquire") else {
            panic!("expected acquisition");
        };
        assert_eq!(locker.holder_info(guard.lock_path()).ttl_secs, Some(120));
    }

    #[test]
    fn drop_only_removes_own_lock() {
        let dir = tempfile::tempdir().expect("tempdir");
        let target = dir.path().join("a.txt");
        let locker = DiskLocker::new(quick());
        let DiskAcquire::Acquired(guard) = locker.acquire(&target).expect("acquire") else {
            panic!("expected acquisition");
        };
        let lock = lock_path_for(&target);
        fs::write(&lock, r#"{"pid":1,"hostname":"other"}"#).expect("overwrite");
        drop(guard);
        assert!(lock.exists());
    }

    #[test]
    fn stale_lock_from_dead_holder_is_quarantined() {
        let dir = tempfile::tempdir().expect("tempdir");
        let target = dir.path().join("b.txt");
        let lock = lock_path_for(&target);
        fs::write(
            &lock,
            format!(r#"{{"pid":{},"hostname":"elsewhere"}}"#, u32::MAX - 1),
        )
        .expect("seed lock");
        let config = LockFileConfig {
            stale_threshold: Duration::ZERO,
            ..quick()
        };
        thread::sleep(Duration::from_millis(20));
        let locker = DiskLocker::new(config);
        assert!(locker.live_holder(&target).is_none());

        assert!(locker.acquire(&target).expect("acquire").is_acquired());
        let counts = locker.stats().snapshot();
        assert_eq!(counts.quarantined + counts.removed, 1);
        let quarantined = fs::read_dir(dir.path())
            .expect("list")
            .flatten()
            .filter(|e| e.file_name().to_string_lossy().contains(QUARANTINE_MARKER))
            .count();
        assert_eq!(quarantined, 1);
        assert_eq!(locker.stats().reset().quarantined, counts.quarantined);
        assert_eq!(locker.stats().snapshot(), StaleCounts::default());
    }

    #[test]
    fn purge_respects_retention() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join("x.lock.stale.100"), "1").expect("seed");
        fs::write(dir.path().join("x.lock"), "1").expect("seed");
        assert_eq!(
            purge_quarantined(dir.path(), Duration::from_secs(3600)).expect("purge"),
            0
        );
        thread::sleep(Duration::from_millis(20));
        assert_eq!(
            purge_quarantined(dir.path(), Duration::from_millis(1)).expect("purge"),
            1
        );
        assert!(dir.path().join("x.lock").exists());
    }
}
