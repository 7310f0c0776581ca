//! Snapshot persistence -- dated, append-only snapshot files.
//!
//! A snapshot is first written to `data_dir/.staging/`, fsynced, then
//! renamed into `data_dir` without replacing anything that already exists.
//! Readers listing `data_dir` see either the complete file or nothing.

use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, info};

use crate::fetch::Snapshot;

/// Staging directory name inside `data_dir`.
pub const STAGING_DIR: &str = ".staging";

/// Extension of published snapshot files.
pub const SNAPSHOT_EXTENSION: &str = "json";

#[derive(Debug, Error)]
pub enum PersistError {
    #[error("snapshot file already exists: {}", .0.display())]
    AlreadyExists(PathBuf),

    #[error("disk full while writing {}", .0.display())]
    DiskFull(PathBuf),

    #[error("I/O failure on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

fn io_error(path: &Path, source: io::Error) -> PersistError {
    match source.kind() {
        io::ErrorKind::AlreadyExists => PersistError::AlreadyExists(path.to_path_buf()),
        io::ErrorKind::StorageFull => PersistError::DiskFull(path.to_path_buf()),
        _ => PersistError::Io {
            path: path.to_path_buf(),
            source,
        },
    }
}

/// Writer for the snapshot directory.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    data_dir: PathBuf,
    staging_dir: PathBuf,
}

impl SnapshotStore {
    /// Open the store, creating `data_dir` and its staging area if needed.
    pub fn open(data_dir: impl Into<PathBuf>) -> Result<Self, PersistError> {
        let data_dir = data_dir.into();
        let staging_dir = data_dir.join(STAGING_DIR);
        std::fs::create_dir_all(&staging_dir).map_err(|e| io_error(&staging_dir, e))?;
        Ok(Self {
            data_dir,
            staging_dir,
        })
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// `<source_id>_<YYYY-MM-DD>.json`, dated by the UTC collection time.
    pub fn file_name(snapshot: &Snapshot) -> String {
        format!(
            "{}_{}.{}",
            snapshot.source_id(),
            snapshot.collected_at().format("%Y-%m-%d"),
            SNAPSHOT_EXTENSION
        )
    }

    pub fn path_for(&self, snapshot: &Snapshot) -> PathBuf {
        self.data_dir.join(Self::file_name(snapshot))
    }

    /// Write the snapshot to the staging area. Nothing is visible in
    /// `data_dir` until [`StagedSnapshot::publish`].
    pub fn stage(&self, snapshot: &Snapshot) -> Result<StagedSnapshot, PersistError> {
        let target = self.path_for(snapshot);
        if target.exists() {
            return Err(PersistError::AlreadyExists(target));
        }

        let mut file = tempfile::Builder::new()
            .prefix(".snapshot-")
            .suffix(".tmp")
            .tempfile_in(&self.staging_dir)
            .map_err(|e| io_error(&self.staging_dir, e))?;

        let staged_path = file.path().to_path_buf();
        serde_json::to_writer_pretty(&mut file, snapshot)
            .map_err(|e| io_error(&staged_path, io::Error::from(e)))?;
        file.write_all(b"\n")
            .and_then(|_| file.as_file().sync_all())
            .map_err(|e| io_error(&staged_path, e))?;

        debug!(staged = %staged_path.display(), target = %target.display(), "snapshot staged");
        Ok(StagedSnapshot { file, target })
    }

    /// Stage and publish in one step. Takes ownership: once handed to the
    /// store the snapshot is no longer the caller's.
    pub fn store(&self, snapshot: Snapshot) -> Result<PathBuf, PersistError> {
        let path = self.stage(&snapshot)?.publish()?;
        info!(
            path = %path.display(),
            records = snapshot.records().len(),
            "snapshot stored"
        );
        Ok(path)
    }

    /// Published snapshot files, sorted by name. Hidden entries (staging
    /// area, run lock) are skipped.
    pub fn list_snapshots(&self) -> io::Result<Vec<PathBuf>> {
        list_snapshot_files(&self.data_dir)
    }
}

/// Published snapshot files in `data_dir`, sorted by name.
pub fn list_snapshot_files(data_dir: &Path) -> io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(data_dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.starts_with('.') || !entry.file_type()?.is_file() {
            continue;
        }
        let path = entry.path();
        if path.extension().map(|e| e == SNAPSHOT_EXTENSION).unwrap_or(false) {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// Read a published snapshot back.
pub fn read_snapshot(path: &Path) -> Result<Snapshot, PersistError> {
    let content = std::fs::read(path).map_err(|e| io_error(path, e))?;
    serde_json::from_slice(&content).map_err(|e| io_error(path, io::Error::from(e)))
}

/// A fully written, fsynced snapshot waiting in the staging area.
///
/// Dropping it without publishing removes the staging file.
#[derive(Debug)]
pub struct StagedSnapshot {
    file: NamedTempFile,
    target: PathBuf,
}

impl StagedSnapshot {
    pub fn target(&self) -> &Path {
        &self.target
    }

    pub fn staged_path(&self) -> &Path {
        self.file.path()
    }

    /// Atomically move the staged file to its final name. Fails with
    /// `AlreadyExists` instead of replacing an existing snapshot.
    pub fn publish(self) -> Result<PathBuf, PersistError> {
        let target = self.target;
        match self.file.persist_noclobber(&target) {
            Ok(_) => {
                sync_parent(&target);
                Ok(target)
            }
            Err(e) => Err(io_error(&target, e.error)),
        }
    }
}

#[cfg(unix)]
fn sync_parent(path: &Path) {
    if let Some(parent) = path.parent() {
        if let Err(e) = std::fs::File::open(parent).and_then(|d| d.sync_all()) {
            debug!(dir = %parent.display(), error = %e, "directory fsync failed");
        }
    }
}

#[cfg(not(unix))]
fn sync_parent(_path: &Path) {}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    fn snapshot(day: u32, hour: u32) -> Snapshot {
        Snapshot::new(
            "vix",
            Utc.with_ymd_and_hms(2024, 3, day, hour, 30, 0).unwrap(),
            vec![json!({"ticker": "UX1 Index", "px_last": 14.25}), json!({"ticker": "VIX Index", "px_last": 13.1})],
        )
    }

    fn dir_listing(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn test_store_writes_dated_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = SnapshotStore::open(dir.path()).unwrap();

        let path = store.store(snapshot(4, 22)).unwrap();
        assert_eq!(path.file_name().unwrap(), "vix_2024-03-04.json");

        let back = read_snapshot(&path).unwrap();
        assert_eq!(back, snapshot(4, 22));
        assert_eq!(store.list_snapshots().unwrap(), vec![path]);
    }

    #[test]
    fn test_same_date_key_rejected_and_first_file_untouched() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = SnapshotStore::open(dir.path()).unwrap();

        let first = store.store(snapshot(5, 9)).unwrap();
        let original = std::fs::read(&first).unwrap();

        // Same source and UTC date, different time of day.
        let err = store.store(snapshot(5, 21)).unwrap_err();
        assert!(matches!(err, PersistError::AlreadyExists(ref p) if p == &first));

        assert_eq!(std::fs::read(&first).unwrap(), original);
        assert_eq!(store.list_snapshots().unwrap().len(), 1);
    }

    #[test]
    fn test_publish_does_not_clobber_file_that_appeared_after_staging() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = SnapshotStore::open(dir.path()).unwrap();

        let staged = store.stage(&snapshot(6, 12)).unwrap();
        std::fs::write(staged.target(), b"written by someone else").unwrap();

        let err = staged.publish().unwrap_err();
        assert!(matches!(err, PersistError::AlreadyExists(_)));
        assert_eq!(
            std::fs::read(store.path_for(&snapshot(6, 12))).unwrap(),
            b"written by someone else"
        );
    }

    #[test]
    fn test_abandoned_stage_leaves_listing_unchanged() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = SnapshotStore::open(dir.path()).unwrap();
        store.store(snapshot(1, 10)).unwrap();

        let before = dir_listing(dir.path());
        let snapshots_before = store.list_snapshots().unwrap();

        // Simulate the process dying after the temp write but before the
        // rename: the staging file is never cleaned up.
        let staged = store.stage(&snapshot(2, 10)).unwrap();
        let staged_path = staged.staged_path().to_path_buf();
        std::mem::forget(staged);

        assert!(staged_path.exists());
        assert_eq!(dir_listing(dir.path()), before);
        assert_eq!(store.list_snapshots().unwrap(), snapshots_before);
    }

    #[test]
    fn test_dropped_stage_cleans_up() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = SnapshotStore::open(dir.path()).unwrap();

        let staged = store.stage(&snapshot(3, 10)).unwrap();
        let staged_path = staged.staged_path().to_path_buf();
        drop(staged);

        assert!(!staged_path.exists());
        assert!(store.list_snapshots().unwrap().is_empty());
    }

    #[test]
    fn test_listing_skips_hidden_and_foreign_files() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = SnapshotStore::open(dir.path()).unwrap();
        std::fs::write(dir.path().join(".run.lock"), b"").unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"hi").unwrap();
        let stored = store.store(snapshot(7, 10)).unwrap();

        assert_eq!(store.list_snapshots().unwrap(), vec![stored]);
    }

    #[test]
    fn test_error_mapping() {
        let path = Path::new("/data/vix_2024-03-04.json");
        assert!(matches!(
            io_error(path, io::Error::from(io::ErrorKind::StorageFull)),
            PersistError::DiskFull(_)
        ));
        assert!(matches!(
            io_error(path, io::Error::from(io::ErrorKind::PermissionDenied)),
            PersistError::Io { .. }
        ));
    }
}
