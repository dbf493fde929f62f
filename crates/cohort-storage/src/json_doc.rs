use crate::StorageError;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

pub fn backup_path(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_owned();
    os.push(".bak");
    PathBuf::from(os)
}

fn temp_path(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_owned();
    os.push(format!(".{}.tmp", std::process::id()));
    PathBuf::from(os)
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> StorageError + '_ {
    move |source| StorageError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Writes `value` as pretty JSON through a temp file and rename.
///
/// A primary that still parses is copied to `<path>.bak` first, so a torn or
/// corrupted write can be recovered on the next load.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), StorageError> {
    let body = serde_json::to_vec_pretty(value)?;
    let previous_valid = fs::read(path)
        .ok()
        .is_some_and(|raw| serde_json::from_slice::<serde_json::Value>(&raw).is_ok());
    if previous_valid {
        if let Err(err) = fs::copy(path, backup_path(path)) {
            warn!(event = "json_backup_failed", path = %path.display(), error = %err);
        }
    }
    write_atomic(path, &body)
}

/// Replaces `path` with `body` via a fsynced sibling temp file and rename.
pub fn write_atomic(path: &Path, body: &[u8]) -> Result<(), StorageError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(io_err(parent))?;
    }
    let tmp = temp_path(path);
    let written = File::create(&tmp)
        .and_then(|mut file| {
            file.write_all(body)?;
            file.sync_all()
        })
        .and_then(|()| fs::rename(&tmp, path));
    if let Err(source) = written {
        let _ = fs::remove_file(&tmp);
        return Err(StorageError::Io {
            path: path.to_path_buf(),
            source,
        });
    }
    debug!(event = "atomic_write", path = %path.display(), bytes = body.len());
    Ok(())
}

#[derive(Debug, Clone, PartialEq)]
pub enum LoadOutcome<T> {
    Primary(T),
    RecoveredFromBackup(T),
    Missing,
    /// Neither the primary nor the backup could be decoded.
    Reset,
}

impl<T> LoadOutcome<T> {
    pub fn into_value(self) -> Option<T> {
        match self {
            LoadOutcome::Primary(v) | LoadOutcome::RecoveredFromBackup(v) => Some(v),
            LoadOutcome::Missing | LoadOutcome::Reset => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            LoadOutcome::Primary(_) => "primary",
            LoadOutcome::RecoveredFromBackup(_) => "backup",
            LoadOutcome::Missing => "missing",
            LoadOutcome::Reset => "reset",
        }
    }
}

enum Attempt<T> {
    Absent,
    Corrupt(String),
    Loaded(T),
}

fn attempt<T: DeserializeOwned>(path: &Path) -> Result<Attempt<T>, StorageError> {
    let raw = match fs::read(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Attempt::Absent),
        Err(source) => {
            return Err(StorageError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    Ok(match serde_json::from_slice::<T>(&raw) {
        Ok(value) => Attempt::Loaded(value),
        Err(err) => Attempt::Corrupt(err.to_string()),
    })
}

/// Loads a document written by [`write_json_atomic`], falling back to the
/// backup when the primary is missing or undecodable.
pub fn load_json_with_backup<T: DeserializeOwned>(
    path: &Path,
) -> Result<LoadOutcome<T>, StorageError> {
    let primary_state = match attempt::<T>(path)? {
        Attempt::Loaded(value) => return Ok(LoadOutcome::Primary(value)),
        Attempt::Absent => None,
        Attempt::Corrupt(reason) => Some(reason),
    };
    let backup = backup_path(path);
    match attempt::<T>(&backup)? {
        Attempt::Loaded(value) => {
            warn!(
                event = "json_recovered_from_backup",
                path = %path.display(),
                reason = primary_state.as_deref().unwrap_or("missing")
            );
            Ok(LoadOutcome::RecoveredFromBackup(value))
        }
        Attempt::Absent if primary_state.is_none() => Ok(LoadOutcome::Missing),
        Attempt::Absent | Attempt::Corrupt(_) => {
            warn!(
                event = "json_reset",
                path = %path.display(),
                reason = primary_state.as_deref().unwrap_or("backup unreadable")
            );
            Ok(LoadOutcome::Reset)
        }
    }
}
