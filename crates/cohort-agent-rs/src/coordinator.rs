//! Function-call locking surface for collaborators that are not hub-aware.
//!
//! When the hub is reachable every call goes through it. Otherwise a
//! [`LocalLocks`] table keeps locks in memory and backs exclusive whole-file
//! locks with `<path>.lock` files so other processes on the host see them.
//! A live lock file from another process denies every request on that file.

use crate::client::{ClientConfig, ClientError, HubClient, LockReply};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use cohort_core::locks::{
    resource_id, AccessReport, AcquireOutcome, LockDenial, LockRecord, LockRegion, LockRequest,
    LockType, ReleaseOutcome, ResourceLockTable, DEFAULT_LOCK_TTL_SECS,
};
use cohort_core::normalize_path;
use cohort_core::regions::{canonical_region_name, RegionIndex};
use cohort_storage::{DiskAcquire, DiskLockGuard, DiskLocker, HolderInfo, LockFileError};
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error(transparent)]
    Client(#[from] ClientError),
    #[error(transparent)]
    Disk(#[from] LockFileError),
    #[error("cannot read regions of {path}: {source}")]
    Region {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("no region {region} in {path}")]
    RegionNotFound { path: String, region: String },
    #[error("{resource_id} is held by {held_by}")]
    HeldByOther { resource_id: String, held_by: String },
}

/// Holder id for a lock file owned by another process.
fn disk_holder(info: &HolderInfo) -> String {
    match (info.pid, info.hostname.as_deref()) {
        (Some(pid), Some(host)) => format!("pid:{pid}@{host}"),
        (Some(pid), None) => format!("pid:{pid}"),
        _ => "unknown".to_string(),
    }
}

/// Denial for a file whose lock file belongs to someone else.
fn disk_denial(
    holder: &str,
    rid: String,
    file: String,
    info: &HolderInfo,
    fallback_ttl: u64,
    now: DateTime<Utc>,
) -> LockDenial {
    let remaining = info
        .ttl_secs
        .unwrap_or(fallback_ttl)
        .saturating_sub(info.age_secs.unwrap_or(0));
    LockDenial {
        resource_id: rid,
        file_path: file,
        held_by: disk_holder(info),
        lock_type: LockType::Exclusive,
        expires_at: now + ChronoDuration::seconds(i64::try_from(remaining).unwrap_or(0)),
        blocking_resource: None,
        requested_by: Some(holder.to_string()),
    }
}

/// Standalone lock table used when no hub is running.
pub struct LocalLocks {
    workspace: PathBuf,
    ttl_secs: u64,
    table: ResourceLockTable,
    regions: RegionIndex,
    disk: DiskLocker,
    guards: HashMap<String, DiskLockGuard>,
}

impl LocalLocks {
    pub fn new(workspace: &Path, disk: DiskLocker) -> Self {
        Self {
            workspace: workspace.to_path_buf(),
            ttl_secs: DEFAULT_LOCK_TTL_SECS,
            table: ResourceLockTable::new(),
            regions: RegionIndex::default(),
            disk,
            guards: HashMap::new(),
        }
    }

    pub fn with_ttl(mut self, ttl_secs: u64) -> Self {
        self.ttl_secs = ttl_secs.max(1);
        self
    }

    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    /// Blocks while polling a contended lock file; call off the async executor.
    pub fn acquire(
        &mut self,
        holder: &str,
        file_path: &str,
        lock_type: LockType,
        region: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<LockReply, CoordinatorError> {
        let file = normalize_path(&self.workspace, file_path);
        let mut request = LockRequest::file(&file, holder, lock_type, self.ttl_secs);
        if let Some(identifier) = region {
            let found = self
                .regions
                .find(&self.workspace, &file, identifier)
                .map_err(|source| CoordinatorError::Region {
                    path: file.clone(),
                    source,
                })?
                .ok_or_else(|| CoordinatorError::RegionNotFound {
                    path: file.clone(),
                    region: identifier.to_string(),
                })?;
            request = request.with_region(LockRegion::from(&found));
        }
        let rid = request.resource_id();
        let on_disk = request.region.is_none() && lock_type.is_exclusive();
        let fallback_ttl = self.disk.config().stale_threshold.as_secs();

        // Exclusive whole-file requests meet the lock file in `disk.acquire` below.
        if !on_disk && !self.guards.contains_key(&resource_id(&file, None)) {
            if let Some(info) = self.disk.live_holder(&self.workspace.join(&file)) {
                info!(event = "local_lock_disk_busy", resource_id = %rid, holder = %info);
                return Ok(LockReply::Denied(disk_denial(holder, rid, file, &info, fallback_ttl, now)));
            }
        }

        let (record, renewed) = match self.table.acquire(request, now) {
            AcquireOutcome::Denied(denial) => {
                debug!(event = "local_lock_denied", holder, resource_id = %rid, held_by = %denial.held_by);
                return Ok(LockReply::Denied(denial));
            }
            AcquireOutcome::Granted {
                record, renewed, ..
            } => (record, renewed),
        };
        if on_disk && !self.guards.contains_key(&rid) {
            let ttl = std::time::Duration::from_secs(self.ttl_secs);
            match self.disk.acquire_with_ttl(&self.workspace.join(&file), ttl) {
                Ok(DiskAcquire::Acquired(guard)) => {
                    self.guards.insert(rid.clone(), guard);
                }
                Ok(DiskAcquire::Held(info)) => {
                    self.table.release(&rid, holder);
                    info!(event = "local_lock_disk_busy", resource_id = %rid, holder = %info);
                    return Ok(LockReply::Denied(disk_denial(holder, rid, file, &info, fallback_ttl, now)));
                }
                Err(err) => {
                    self.table.release(&rid, holder);
                    return Err(err.into());
                }
            }
        }
        info!(event = "local_lock_granted", holder, resource_id = %rid, renewed);
        Ok(LockReply::Granted {
            lock: record,
            renewed,
        })
    }

    pub fn release(
        &mut self,
        holder: &str,
        file_path: &str,
        region: Option<&str>,
    ) -> Result<Option<LockRecord>, CoordinatorError> {
        let file = normalize_path(&self.workspace, file_path);
        let name = region.map(canonical_region_name);
        let rid = resource_id(&file, name.as_deref());
        match self.table.release(&rid, holder) {
            ReleaseOutcome::Released(record) => {
                if let Some(guard) = self.guards.remove(&rid) {
                    guard.release()?;
                }
                info!(event = "local_lock_released", holder, resource_id = %rid);
                Ok(Some(record))
            }
            ReleaseOutcome::HeldByOther { held_by } => Err(CoordinatorError::HeldByOther {
                resource_id: rid,
                held_by,
            }),
            ReleaseOutcome::NotHeld => Ok(None),
        }
    }

    /// In-memory blockers plus a live lock file left by another process.
    pub fn check_access(&self, holder: &str, file_path: &str, line: u32, now: DateTime<Utc>) -> AccessReport {
        let file = normalize_path(&self.workspace, file_path);
        let mut report = self.table.check_access(&file, line, holder, now);
        if self.guards.contains_key(&resource_id(&file, None)) {
            return report;
        }
        if let Some(info) = self.disk.live_holder(&self.workspace.join(&file)) {
            let age = i64::try_from(info.age_secs.unwrap_or(0)).unwrap_or(0);
            report.blocking.push(LockRecord {
                resource_id: file.clone(),
                file_path: file,
                holder_id: disk_holder(&info),
                lock_type: LockType::Exclusive,
                acquired_at: now - ChronoDuration::seconds(age),
                ttl_secs: info.ttl_secs.unwrap_or(self.disk.config().stale_threshold.as_secs()),
                region: None,
            });
            report.can_access = false;
        }
        report
    }

    pub fn locks(&self) -> impl Iterator<Item = &LockRecord> {
        self.table.locks()
    }

    /// Drops every lock `holder` owns, lock files included.
    pub fn release_all(&mut self, holder: &str) -> usize {
        let released = self.table.release_all(holder);
        for record in &released {
            if let Some(guard) = self.guards.remove(&record.resource_id) {
                if let Err(err) = guard.release() {
                    warn!(event = "local_lock_file_release_failed", resource_id = %record.resource_id, error = %err);
                }
            }
        }
        released.len()
    }
}

pub enum Coordinator {
    Hub(HubClient),
    Local { holder: String, locks: LocalLocks },
}

impl Coordinator {
    /// Uses the hub when it answers the registration, otherwise the local tier.
    pub async fn connect_or_local(config: ClientConfig, workspace: &Path, disk: DiskLocker) -> Self {
        let holder = cohort_core::agent_id(&config.agent_type, &config.instance_id);
        match HubClient::connect(config).await {
            Ok(client) => Coordinator::Hub(client),
            Err(err) => {
                warn!(event = "hub_unavailable", error = %err, fallback = "local");
                Coordinator::local(&holder, LocalLocks::new(workspace, disk))
            }
        }
    }

    pub fn local(holder: &str, locks: LocalLocks) -> Self {
        Coordinator::Local {
            holder: holder.to_string(),
            locks,
        }
    }

    pub fn backend(&self) -> &'static str {
        match self {
            Coordinator::Hub(_) => "hub",
            Coordinator::Local { .. } => "local",
        }
    }

    pub async fn acquire(
        &mut self,
        file_path: &str,
        lock_type: LockType,
        region: Option<&str>,
    ) -> Result<LockReply, CoordinatorError> {
        match self {
            Coordinator::Hub(client) => Ok(client.acquire_lock(file_path, lock_type, region, None).await?),
            Coordinator::Local { holder, locks } => tokio::task::block_in_place(|| {
                locks.acquire(holder, file_path, lock_type, region, Utc::now())
            }),
        }
    }

    pub async fn release(&mut self, file_path: &str, region: Option<&str>) -> Result<(), CoordinatorError> {
        match self {
            Coordinator::Hub(client) => Ok(client.release_lock(file_path, region).await?),
            Coordinator::Local { holder, locks } => {
                locks.release(holder, file_path, region)?;
                Ok(())
            }
        }
    }

    pub async fn check_access(&self, file_path: &str, line: u32) -> Result<AccessReport, CoordinatorError> {
        match self {
            Coordinator::Hub(client) => Ok(client.check_access(file_path, line).await?),
            Coordinator::Local { holder, locks } => {
                Ok(locks.check_access(holder, file_path, line, Utc::now()))
            }
        }
    }

    pub async fn close(self) {
        match self {
            Coordinator::Hub(client) => client.close().await,
            Coordinator::Local { holder, mut locks } => {
                let released = locks.release_all(&holder);
                debug!(event = "local_locks_closed", holder = %holder, released);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::tests::{config, handshake, listen, recv, reply};
    use cohort_core::protocol::{ClientMsg, ServerMsg};
    use cohort_storage::LockFileConfig;
    use std::fs;
    use std::time::Duration;

    fn quick_disk() -> DiskLocker {
        DiskLocker::new(LockFileConfig {
            stale_threshold: Duration::from_secs(120),
            cleanup_days: 0,
            timeout: Duration::from_millis(100),
            poll_interval: Duration::from_millis(20),
        })
    }

    fn workspace() -> tempfile::TempDir {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::create_dir_all(dir.path().join("src")).expect("mkdir");
        fs::write(
            dir.path().join("src/svc.py"),
            "class Foo:\n    def bar(self):\n        return 1\n\n    def baz(self):\n        return 2\n",
        )
        .expect("write");
        dir
    }

    #[test]
    fn whole_file_locks_are_mirrored_on_disk() {
        let dir = workspace();
        let mut locks = LocalLocks::new(dir.path(), quick_disk());
        let now = Utc::now();
        let lock_file = dir.path().join("src/svc.py.lock");

        let first = locks
            .acquire("CLAUDE-1", "src/svc.py", LockType::Exclusive, None, now)
            .expect("acquire");
        assert!(first.is_granted());
        assert!(lock_file.exists());

        let second = locks
            .acquire("GEMINI-1", "src/svc.py", LockType::Exclusive, None, now)
            .expect("acquire");
        match second {
            LockReply::Denied(denial) => assert_eq!(denial.held_by, "CLAUDE-1"),
            LockReply::Granted { .. } => panic!("exclusive lock granted twice"),
        }

        let renewed = locks
            .acquire("CLAUDE-1", "src/svc.py", LockType::Exclusive, None, now)
            .expect("renew");
        assert!(matches!(renewed, LockReply::Granted { renewed: true, .. }));

        assert!(matches!(
            locks.release("GEMINI-1", "src/svc.py", None),
            Err(CoordinatorError::HeldByOther { .. })
        ));
        assert!(locks.release("CLAUDE-1", "src/svc.py", None).expect("release").is_some());
        assert!(!lock_file.exists());
        assert!(locks.release("CLAUDE-1", "src/svc.py", None).expect("release").is_none());
    }

    #[test]
    fn foreign_lock_file_denies_and_blocks_access() {
        let dir = workspace();
        let other_process = quick_disk();
        let DiskAcquire::Acquired(guard) = other_process
            .acquire(&dir.path().join("src/svc.py"))
            .expect("seed lock")
        else {
            panic!("expected acquisition");
        };

        let mut locks = LocalLocks::new(dir.path(), quick_disk());
        let now = Utc::now();
        let report = locks.check_access("CLAUDE-1", "src/svc.py", 3, now);
        assert!(!report.can_access);
        assert!(report.blocking[0].holder_id.starts_with("pid:"));

        let reply = locks
            .acquire("CLAUDE-1", "src/svc.py", LockType::Exclusive, None, now)
            .expect("acquire");
        match reply {
            LockReply::Denied(denial) => {
                assert!(denial.held_by.starts_with(&format!("pid:{}", std::process::id())));
                assert!(denial.expires_at > now);
            }
            LockReply::Granted { .. } => panic!("lock file must be honoured"),
        }
        assert_eq!(locks.locks().count(), 0);

        guard.release().expect("release");
        assert!(locks.check_access("CLAUDE-1", "src/svc.py", 3, now).can_access);
    }

    #[test]
    fn another_instance_lock_file_denies_every_request() {
        let dir = workspace();
        let now = Utc::now();
        let mut p1 = LocalLocks::new(dir.path(), quick_disk()).with_ttl(600);
        let mut p2 = LocalLocks::new(dir.path(), quick_disk());

        assert!(p1
            .acquire("CLAUDE-1", "src/svc.py", LockType::Exclusive, None, now)
            .expect("acquire")
            .is_granted());
        let raw = fs::read_to_string(dir.path().join("src/svc.py.lock")).expect("lock file");
        assert!(raw.contains("\"ttl_seconds\":600"));

        let shared = p2
            .acquire("GEMINI-1", "src/svc.py", LockType::Shared, None, now)
            .expect("acquire");
        match shared {
            LockReply::Denied(denial) => {
                assert!(denial.held_by.starts_with("pid:"));
                assert!(denial.expires_at > now + ChronoDuration::seconds(500));
            }
            LockReply::Granted { .. } => panic!("shared lock granted over a live lock file"),
        }
        for (lock_type, region) in [
            (LockType::Exclusive, Some("Foo.bar")),
            (LockType::Shared, Some("lines:1-2")),
        ] {
            assert!(!p2
                .acquire("GEMINI-1", "src/svc.py", lock_type, region, now)
                .expect("acquire")
                .is_granted());
        }
        assert_eq!(p2.locks().count(), 0);
        assert!(!p2.check_access("GEMINI-1", "src/svc.py", 2, now).can_access);

        // The owning instance keeps working under its own lock file.
        assert!(p1
            .acquire("CLAUDE-1", "src/svc.py", LockType::Shared, Some("Foo.baz"), now)
            .expect("acquire")
            .is_granted());

        p1.release_all("CLAUDE-1");
        assert!(p2
            .acquire("GEMINI-1", "src/svc.py", LockType::Shared, None, now)
            .expect("acquire")
            .is_granted());
    }

    #[test]
    fn region_locks_stay_in_memory() {
        let dir = workspace();
        let mut locks = LocalLocks::new(dir.path(), quick_disk());
        let now = Utc::now();

        let bar = locks
            .acquire("CLAUDE-1", "src/svc.py", LockType::Exclusive, Some("Foo.bar"), now)
            .expect("acquire");
        let LockReply::Granted { lock, .. } = bar else {
            panic!("expected grant");
        };
        assert_eq!(lock.resource_id, "src/svc.py#Foo.bar");
        assert!(!dir.path().join("src/svc.py.lock").exists());

        assert!(locks
            .acquire("GEMINI-1", "src/svc.py", LockType::Exclusive, Some("Foo.baz"), now)
            .expect("acquire")
            .is_granted());
        assert!(!locks
            .acquire("GEMINI-1", "src/svc.py", LockType::Exclusive, Some("line:2-2"), now)
            .expect("acquire")
            .is_granted());
        assert!(!locks.check_access("GEMINI-1", "src/svc.py", 2, now).can_access);
        assert!(matches!(
            locks.acquire("CLAUDE-1", "src/svc.py", LockType::Exclusive, Some("Nope"), now),
            Err(CoordinatorError::RegionNotFound { .. })
        ));

        assert_eq!(locks.release_all("CLAUDE-1"), 1);
        assert!(locks.check_access("GEMINI-1", "src/svc.py", 2, now).can_access);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn falls_back_to_local_locks_without_a_hub() {
        let dir = workspace();
        let (listener, url) = listen().await;
        drop(listener);

        let mut coordinator = Coordinator::connect_or_local(config(url), dir.path(), quick_disk()).await;
        assert_eq!(coordinator.backend(), "local");
        assert!(coordinator
            .acquire("src/svc.py", LockType::Exclusive, None)
            .await
            .expect("acquire")
            .is_granted());
        assert!(dir.path().join("src/svc.py.lock").exists());
        assert!(coordinator.check_access("src/svc.py", 1).await.expect("check").can_access);
        coordinator.release("src/svc.py", None).await.expect("release");
        assert!(!dir.path().join("src/svc.py.lock").exists());
        coordinator.close().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn routes_through_the_hub_when_reachable() {
        let dir = workspace();
        let (listener, url) = listen().await;
        let hub = tokio::spawn(async move {
            let mut ws = handshake(&listener, "CLAUDE-1", "/work/repo").await;
            match recv(&mut ws).await {
                ClientMsg::CheckLock { file_path, line } => {
                    assert_eq!(file_path, "src/svc.py");
                    assert_eq!(line, 4);
                }
                other => panic!("expected check, got {other:?}"),
            }
            reply(
                &mut ws,
                &ServerMsg::LockAccess {
                    file_path: "src/svc.py".to_string(),
                    line: 4,
                    report: AccessReport {
                        can_access: true,
                        blocking: Vec::new(),
                    },
                },
            )
            .await;
            ws
        });

        let coordinator = Coordinator::connect_or_local(config(url), dir.path(), quick_disk()).await;
        assert_eq!(coordinator.backend(), "hub");
        let report = coordinator.check_access("src/svc.py", 4).await.expect("check");
        assert!(report.can_access);
        let _ws = hub.await.expect("hub task");
        coordinator.close().await;
    }
}
