use crate::json_doc::{load_json_with_backup, write_json_atomic, LoadOutcome};
use crate::StorageError;
use chrono::{DateTime, Utc};
use cohort_core::config::STATE_DIR;
use cohort_core::locks::LockRecord;
use cohort_core::orchestrator::Workflow;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::info;

pub const SNAPSHOT_FILE: &str = "hub_state.json";

/// Hub state that survives a restart.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HubSnapshot {
    #[serde(default)]
    pub locks: Vec<LockRecord>,
    #[serde(default)]
    pub partitions: BTreeMap<String, String>,
    /// Mode, state, plan, reviews, pending versions and open conflicts.
    #[serde(default)]
    pub workflow: Workflow,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotSource {
    Primary,
    Backup,
    Missing,
    Reset,
}

impl SnapshotSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            SnapshotSource::Primary => "primary",
            SnapshotSource::Backup => "backup",
            SnapshotSource::Missing => "missing",
            SnapshotSource::Reset => "reset",
        }
    }
}

#[derive(Debug, Clone)]
pub struct LoadedSnapshot {
    pub snapshot: HubSnapshot,
    pub source: SnapshotSource,
    /// Locks dropped because they had already expired.
    pub pruned: Vec<LockRecord>,
}

#[derive(Debug, Clone)]
pub struct SnapshotStore {
    path: PathBuf,
}

impl SnapshotStore {
    pub fn for_workspace(workspace: &Path) -> Self {
        Self {
            path: workspace.join(STATE_DIR).join(SNAPSHOT_FILE),
        }
    }

    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self, now: DateTime<Utc>) -> Result<LoadedSnapshot, StorageError> {
        let (snapshot, source) = match load_json_with_backup::<HubSnapshot>(&self.path)? {
            LoadOutcome::Primary(s) => (s, SnapshotSource::Primary),
            LoadOutcome::RecoveredFromBackup(s) => (s, SnapshotSource::Backup),
            LoadOutcome::Missing => (HubSnapshot::default(), SnapshotSource::Missing),
            LoadOutcome::Reset => (HubSnapshot::default(), SnapshotSource::Reset),
        };
        let (pruned, locks): (Vec<_>, Vec<_>) =
            snapshot.locks.into_iter().partition(|l| l.is_expired_at(now));
        info!(
            event = "snapshot_loaded",
            path = %self.path.display(),
            source = source.as_str(),
            locks = locks.len(),
            pruned = pruned.len()
        );
        Ok(LoadedSnapshot {
            snapshot: HubSnapshot { locks, ..snapshot },
            source,
            pruned,
        })
    }

    pub fn save(&self, snapshot: &HubSnapshot) -> Result<(), StorageError> {
        write_json_atomic(&self.path, snapshot)
    }
}
