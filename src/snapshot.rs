//! Snapshot directory management.
//!
//! Snapshots live as self-contained directories directly under the engine's
//! root directory, named `snapshot.<index>.<term>`. This module owns the
//! naming scheme, enumeration, the retention policy and best-effort
//! deletion; producing and consuming the directory contents is the storage
//! backend's job.

use crate::error::Result;
use crate::observability;
use crate::types::LogPosition;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Fixed prefix of every snapshot directory name.
pub const SNAPSHOT_PREFIX: &str = "snapshot";

/// Directory name for a snapshot at `position`: `snapshot.<index>.<term>`.
pub fn snapshot_name(position: LogPosition) -> String {
    format!("{}.{}.{}", SNAPSHOT_PREFIX, position.index, position.term)
}

/// Parse a snapshot directory name back into its position.
///
/// Both numeric parts must be plain non-negative decimal: no signs, no
/// leading `+`, nothing but ASCII digits. Anything else is not a snapshot.
pub fn parse_snapshot_name(name: &str) -> Option<LogPosition> {
    let rest = name.strip_prefix(SNAPSHOT_PREFIX)?.strip_prefix('.')?;
    let (index, term) = rest.split_once('.')?;
    if index.is_empty() || term.is_empty() {
        return None;
    }
    if !index.bytes().all(|b| b.is_ascii_digit()) || !term.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some(LogPosition::new(index.parse().ok()?, term.parse().ok()?))
}

/// A snapshot directory found under the root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotEntry {
    pub position: LogPosition,
    pub path: PathBuf,
}

/// Enumerates, retains and deletes snapshot directories for one partition.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    root: PathBuf,
    max_retained: usize,
}

impl SnapshotStore {
    pub fn new(root: impl Into<PathBuf>, max_retained: usize) -> Self {
        Self {
            root: root.into(),
            max_retained,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Destination directory for a snapshot at `position`.
    pub fn path_for(&self, position: LogPosition) -> PathBuf {
        self.root.join(snapshot_name(position))
    }

    /// List snapshot directories under the root, ascending by
    /// `(index, term)`. Entries that do not match the naming scheme are
    /// logged and ignored.
    pub fn list(&self) -> Result<Vec<SnapshotEntry>> {
        let mut entries = Vec::new();
        for dirent in std::fs::read_dir(&self.root)? {
            let dirent = dirent?;
            if !dirent.file_type()?.is_dir() {
                continue;
            }
            let name = dirent.file_name();
            let Some(name) = name.to_str() else {
                debug!(path = %dirent.path().display(), "ignoring non-UTF-8 directory");
                continue;
            };
            match parse_snapshot_name(name) {
                Some(position) => entries.push(SnapshotEntry {
                    position,
                    path: dirent.path(),
                }),
                None => debug!(name, "ignoring non-snapshot entry"),
            }
        }
        entries.sort_by_key(|e| e.position);
        Ok(entries)
    }

    /// Delete the lowest-sorted snapshots until at most `max_retained - 1`
    /// remain. Runs before creation so the create itself can succeed when
    /// disk space is short.
    pub fn prune_for_create(&self) {
        let entries = match self.list() {
            Ok(entries) => entries,
            Err(e) => {
                warn!(error = %e, root = %self.root.display(), "failed to list snapshots for pruning");
                return;
            }
        };

        let keep = self.max_retained.saturating_sub(1);
        let excess = entries.len().saturating_sub(keep);
        for entry in entries.into_iter().take(excess) {
            info!(position = %entry.position, "removing snapshot to satisfy retention");
            self.remove_dir(&entry.path);
        }
    }

    /// Best-effort recursive removal of a snapshot by directory name.
    /// Errors are logged, never propagated.
    pub fn delete(&self, name: &str) {
        if name.is_empty() || name.contains(std::path::is_separator) {
            warn!(name, "refusing to delete snapshot with non-local name");
            return;
        }
        self.remove_dir(&self.root.join(name));
    }

    fn remove_dir(&self, path: &Path) {
        match std::fs::remove_dir_all(path) {
            Ok(()) => observability::record_snapshot_deleted(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "snapshot already gone");
            }
            Err(e) => {
                warn!(error = %e, path = %path.display(), "failed to delete snapshot directory");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_name_format() {
        assert_eq!(
            snapshot_name(LogPosition::new(1048576, 7)),
            "snapshot.1048576.7"
        );
    }

    #[test]
    fn test_parse_valid_names() {
        assert_eq!(
            parse_snapshot_name("snapshot.12.3"),
            Some(LogPosition::new(12, 3))
        );
        assert_eq!(
            parse_snapshot_name("snapshot.0.0"),
            Some(LogPosition::ZERO)
        );
    }

    #[test]
    fn test_parse_rejects_invalid_names() {
        for name in [
            "snapshot",
            "snapshot.",
            "snapshot.1",
            "snapshot.1.",
            "snapshot..2",
            "snapshot.+1.2",
            "snapshot.1.-2",
            "snapshot.a.2",
            "snapshot.1.2.3x", // trailing junk in term
            "checkpoint.1.2",
            "live",
        ] {
            assert_eq!(parse_snapshot_name(name), None, "accepted {:?}", name);
        }
    }

    #[test]
    fn test_list_sorted_and_filtered() {
        let dir = tempdir().unwrap();
        for name in ["snapshot.3.1", "snapshot.1.2", "snapshot.10.1", "live", "junk.2.2"] {
            std::fs::create_dir(dir.path().join(name)).unwrap();
        }
        // Plain files never count, even with a valid name.
        std::fs::write(dir.path().join("snapshot.5.5"), b"").unwrap();

        let store = SnapshotStore::new(dir.path(), 1);
        let listed: Vec<LogPosition> = store.list().unwrap().into_iter().map(|e| e.position).collect();
        assert_eq!(
            listed,
            vec![
                LogPosition::new(1, 2),
                LogPosition::new(3, 1),
                LogPosition::new(10, 1)
            ]
        );
    }

    #[test]
    fn test_prune_keeps_room_for_next_create() {
        let dir = tempdir().unwrap();
        for name in ["snapshot.1.1", "snapshot.2.1", "snapshot.3.1"] {
            std::fs::create_dir(dir.path().join(name)).unwrap();
        }

        let store = SnapshotStore::new(dir.path(), 2);
        store.prune_for_create();

        let remaining: Vec<String> = store
            .list()
            .unwrap()
            .into_iter()
            .map(|e| snapshot_name(e.position))
            .collect();
        // max_retained - 1 = 1 survivor, the highest-sorted one.
        assert_eq!(remaining, vec!["snapshot.3.1"]);
    }

    #[test]
    fn test_delete_is_best_effort() {
        let dir = tempdir().unwrap();
        let store = SnapshotStore::new(dir.path(), 1);

        std::fs::create_dir(dir.path().join("snapshot.4.2")).unwrap();
        store.delete("snapshot.4.2");
        assert!(!dir.path().join("snapshot.4.2").exists());

        // Missing directories and hostile names are quietly ignored.
        store.delete("snapshot.4.2");
        store.delete("../../etc");
        store.delete("");
    }
}
