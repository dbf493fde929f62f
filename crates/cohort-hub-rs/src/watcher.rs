//! Workspace file watcher feeding change notifications into the hub actor.

use crate::server::HubCommand;
use cohort_core::checksum;
use cohort_core::config::STATE_DIR;
use cohort_core::protocol::ChangeType;
use globset::{Glob, GlobSet, GlobSetBuilder};
use ignore::gitignore::{Gitignore, GitignoreBuilder};
use notify::event::ModifyKind;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use tracing::{debug, warn};

const SKIPPED: &[&str] = &[
    ".git/**",
    ".cohort/**",
    "**/*.tmp",
    "**/*.lock",
    "**/*.lock.stale.*",
    "**/*.swp",
    "**/*~",
];

/// Decides which workspace paths are worth reporting.
pub struct WorkspaceFilter {
    root: PathBuf,
    skipped: GlobSet,
    gitignore: Gitignore,
}

impl WorkspaceFilter {
    pub fn new(root: &Path) -> Self {
        let mut builder = GlobSetBuilder::new();
        for pattern in SKIPPED {
            match Glob::new(pattern) {
                Ok(glob) => {
                    builder.add(glob);
                }
                Err(err) => warn!(event = "watch_pattern_invalid", pattern, error = %err),
            }
        }
        let skipped = builder.build().unwrap_or_else(|err| {
            warn!(event = "watch_patterns_unusable", error = %err);
            GlobSet::empty()
        });

        let mut ignores = GitignoreBuilder::new(root);
        let gitignore_path = root.join(".gitignore");
        if gitignore_path.is_file() {
            if let Some(err) = ignores.add(&gitignore_path) {
                warn!(event = "gitignore_partial", path = %gitignore_path.display(), error = %err);
            }
        }
        let gitignore = ignores.build().unwrap_or_else(|err| {
            warn!(event = "gitignore_unusable", error = %err);
            Gitignore::empty()
        });

        Self {
            root: root.to_path_buf(),
            skipped,
            gitignore,
        }
    }

    /// `/`-separated path relative to the root; `None` for paths outside it.
    pub fn relative(&self, path: &Path) -> Option<String> {
        let rel = path.strip_prefix(&self.root).ok()?;
        let text = rel.to_string_lossy().replace('\\', "/");
        (!text.is_empty()).then_some(text)
    }

    pub fn should_skip(&self, rel: &str, is_dir: bool) -> bool {
        if rel == STATE_DIR || rel == ".git" || self.skipped.is_match(rel) {
            return true;
        }
        self.gitignore
            .matched_path_or_any_parents(self.root.join(rel), is_dir)
            .is_ignore()
    }
}

fn classify(kind: &EventKind, exists: bool) -> Option<ChangeType> {
    match kind {
        EventKind::Create(_) => Some(ChangeType::Created),
        EventKind::Modify(ModifyKind::Name(_)) if exists => Some(ChangeType::Modified),
        EventKind::Modify(ModifyKind::Name(_)) => Some(ChangeType::Deleted),
        EventKind::Modify(ModifyKind::Metadata(_)) => None,
        EventKind::Modify(_) => Some(ChangeType::Modified),
        EventKind::Remove(_) => Some(ChangeType::Deleted),
        EventKind::Access(_) | EventKind::Any | EventKind::Other => None,
    }
}

fn translate(filter: &WorkspaceFilter, event: &Event) -> Vec<HubCommand> {
    let mut out = Vec::new();
    for path in &event.paths {
        let Some(rel) = filter.relative(path) else {
            continue;
        };
        if path.is_dir() || filter.should_skip(&rel, false) {
            continue;
        }
        let Some(mut change) = classify(&event.kind, path.exists()) else {
            continue;
        };
        let sum = if change == ChangeType::Deleted {
            None
        } else {
            match std::fs::read(path) {
                Ok(bytes) => Some(checksum(&bytes)),
                Err(_) => {
                    change = ChangeType::Deleted;
                    None
                }
            }
        };
        out.push(HubCommand::FileEvent {
            path: rel,
            change,
            checksum: sum,
        });
    }
    out
}

/// Starts a recursive watch on `root`; dropping the returned watcher stops it.
pub fn spawn(root: &Path, tx: mpsc::Sender<HubCommand>) -> notify::Result<RecommendedWatcher> {
    let filter = WorkspaceFilter::new(root);
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
        Ok(event) => {
            for command in translate(&filter, &event) {
                if tx.blocking_send(command).is_err() {
                    debug!(event = "watch_receiver_closed");
                    return;
                }
            }
        }
        Err(err) => warn!(event = "watch_error", error = %err),
    })?;
    watcher.watch(root, RecursiveMode::Recursive)?;
    debug!(event = "watch_started", root = %root.display());
    Ok(watcher)
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{CreateKind, DataChange, RemoveKind, RenameMode};
    use std::fs;

    #[test]
    fn internal_and_ignored_paths_are_skipped() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join(".gitignore"), "target/\n*.log\n").expect("gitignore");
        let filter = WorkspaceFilter::new(dir.path());

        assert!(filter.should_skip(".git/HEAD", false));
        assert!(filter.should_skip(".cohort/hub_state.json", false));
        assert!(filter.should_skip("src/a.py.4242.tmp", false));
        assert!(filter.should_skip("src/a.py.lock", false));
        assert!(filter.should_skip("src/a.py.lock.stale.1700000000", false));
        assert!(filter.should_skip("target/debug/app", false));
        assert!(filter.should_skip("build.log", false));
        assert!(!filter.should_skip("src/a.py", false));
        assert!(!filter.should_skip("README.md", false));

        assert_eq!(
            filter.relative(&dir.path().join("src/a.py")).as_deref(),
            Some("src/a.py")
        );
        assert_eq!(filter.relative(Path::new("/elsewhere/a.py")), None);
    }

    #[test]
    fn event_kinds_map_to_change_types() {
        assert_eq!(
            classify(&EventKind::Create(CreateKind::File), true),
            Some(ChangeType::Created)
        );
        assert_eq!(
            classify(&EventKind::Modify(ModifyKind::Data(DataChange::Content)), true),
            Some(ChangeType::Modified)
        );
        assert_eq!(
            classify(&EventKind::Modify(ModifyKind::Name(RenameMode::To)), true),
            Some(ChangeType::Modified)
        );
        assert_eq!(
            classify(&EventKind::Modify(ModifyKind::Name(RenameMode::From)), false),
            Some(ChangeType::Deleted)
        );
        assert_eq!(
            classify(&EventKind::Remove(RemoveKind::File), false),
            Some(ChangeType::Deleted)
        );
        assert_eq!(classify(&EventKind::Any, true), None);
    }

    #[test]
    fn translated_events_carry_checksums() {
        let dir = tempfile::tempdir().expect("tempdir");
        let file = dir.path().join("a.py");
        fs::write(&file, "x = 1\n").expect("write");
        let filter = WorkspaceFilter::new(dir.path());

        let event = Event::new(EventKind::Create(CreateKind::File))
            .add_path(file.clone())
            .add_path(dir.path().join("a.py.lock"));
        let commands = translate(&filter, &event);
        assert_eq!(commands.len(), 1);
        match &commands[0] {
            HubCommand::FileEvent {
                path,
                change,
                checksum: sum,
            } => {
                assert_eq!(path, "a.py");
                assert_eq!(*change, ChangeType::Created);
                assert_eq!(sum.as_deref(), Some(checksum(b"x = 1\n").as_str()));
            }
            _ => panic!("expected a file event"),
        }

        fs::remove_file(&file).expect("remove");
        let event = Event::new(EventKind::Modify(ModifyKind::Data(DataChange::Any))).add_path(file);
        match translate(&filter, &event).as_slice() {
            [HubCommand::FileEvent { change, checksum, .. }] => {
                assert_eq!(*change, ChangeType::Deleted);
                assert!(checksum.is_none());
            }
            _ => panic!("expected a deletion"),
        }
    }
}
