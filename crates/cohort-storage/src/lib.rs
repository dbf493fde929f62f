//! Durable state for the coordination hub and agents: advisory lock files,
//! crash-safe JSON documents and the hub snapshot.

pub mod json_doc;
pub mod lockfile;
pub mod snapshot;

use std::path::PathBuf;
use thiserror::Error;

pub use json_doc::{load_json_with_backup, write_atomic, write_json_atomic, LoadOutcome};
pub use lockfile::{
    DiskAcquire, DiskLockGuard, DiskLocker, HolderInfo, LockFileConfig, LockFileError,
    StaleCounts, StaleStats,
};
pub use snapshot::{HubSnapshot, LoadedSnapshot, SnapshotSource, SnapshotStore};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}
