use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::date_util::is_day_key;
use crate::error::{Error, MigrationErrors, Recovered, Result};
use crate::source::{Event, RoomId};
use crate::storage::shard::{merge_events, read_shard};
use crate::storage::{
    room_id_from_dir_name, CHECKPOINT_FILENAME, DATA_FILENAME, LEGACY_CHECKPOINT_FILENAME,
};

/// What happened while folding old directories of a room into the current one.
///
/// Migration is best-effort: nothing in here aborts the room's sync.
#[derive(Debug, Default)]
pub struct MigrationReport {
    /// Old directory names that were merged and removed.
    pub merged_dirs: Vec<String>,
    pub events_merged: usize,
    /// Files skipped or shards rebuilt along the way.
    pub recovered: Vec<Recovered>,
    /// Directories that could not be fully migrated; they are left on disk
    /// unless the failure happened after a successful merge.
    pub failures: Vec<Error>,
}

impl MigrationReport {
    /// All failures combined into a single error, if there were any.
    pub fn into_error(self) -> Option<Error> {
        if self.failures.is_empty() {
            None
        } else {
            Some(Error::Migration(MigrationErrors(self.failures)))
        }
    }
}

/// Find directories in `backup_root` that belong to `room_id` under an older
/// label, merge their events into `target_path` and delete them.
///
/// A directory is only removed after its events were merged. Each candidate
/// is handled independently; failures are collected in the report.
pub fn migrate_old_rooms(
    backup_root: &Path,
    room_id: &RoomId,
    current_dir_name: &str,
    target_path: &Path,
) -> MigrationReport {
    let mut report = MigrationReport::default();

    let entries = match fs::read_dir(backup_root) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return report,
        Err(e) => {
            report.failures.push(Error::io(backup_root, e));
            return report;
        }
    };

    let mut candidates: Vec<String> = entries
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|t| t.is_dir()).unwrap_or(false))
        .filter_map(|entry| entry.file_name().into_string().ok())
        .filter(|name| name != current_dir_name)
        .filter(|name| room_id_from_dir_name(name) == Some(room_id.as_str()))
        .collect();
    candidates.sort();

    for dir_name in candidates {
        log::info!("Found old directory {dir_name} for room {room_id}, merging data");
        match merge_old_dir(&backup_root.join(&dir_name), target_path, &mut report) {
            Ok(count) => {
                log::info!("Merged {count} events from {dir_name} and removed it");
                report.events_merged += count;
                report.merged_dirs.push(dir_name);
            }
            Err(e) => {
                log::error!("Failed to process old directory {dir_name}: {e}");
                report.failures.push(e);
            }
        }
    }

    report
}

/// Merge one old directory into `target_path`, then remove it.
fn merge_old_dir(
    old_path: &Path,
    target_path: &Path,
    report: &mut MigrationReport,
) -> Result<usize> {
    let mut events: Vec<Event> = Vec::new();
    for file in shard_files(old_path)? {
        match read_shard(&file) {
            Ok(mut batch) => events.append(&mut batch),
            Err(e) => {
                log::warn!("Skipping unreadable file {} in old directory: {e}", file.display());
                report.recovered.push(Recovered {
                    path: file,
                    message: format!("skipped during migration: {e}"),
                });
            }
        }
    }

    if events.is_empty() {
        log::debug!("No events found in {}", old_path.display());
    } else {
        let merged = merge_events(target_path, &events)?;
        report.recovered.extend(merged.recovered);
    }

    fs::remove_dir_all(old_path).map_err(|e| Error::io(old_path, e))?;
    Ok(events.len())
}

/// Event files inside a room directory: `<YYYY-MM-DD>/data.json` shards plus
/// any flat `*.json` file other than the checkpoint.
fn shard_files(room_path: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let entries = fs::read_dir(room_path).map_err(|e| Error::io(room_path, e))?;

    for entry in entries {
        let entry = entry.map_err(|e| Error::io(room_path, e))?;
        let name = entry.file_name().to_string_lossy().into_owned();
        let path = entry.path();
        let is_dir = entry
            .file_type()
            .map_err(|e| Error::io(&path, e))?
            .is_dir();

        if is_dir {
            if is_day_key(&name) {
                let data = path.join(DATA_FILENAME);
                if data.is_file() {
                    files.push(data);
                }
            }
        } else if name != CHECKPOINT_FILENAME
            && name != LEGACY_CHECKPOINT_FILENAME
            && name.ends_with(".json")
        {
            files.push(path);
        } else {
            log::debug!("Skipping {name} in old directory");
        }
    }

    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::testing::event;
    use crate::storage::Checkpoint;

    fn seed(root: &Path, dir_name: &str, events: &[Event]) -> PathBuf {
        let path = root.join(dir_name);
        fs::create_dir_all(&path).unwrap();
        merge_events(&path, events).unwrap();
        path
    }

    fn stored_ids(room: &Path, day: &str) -> Vec<String> {
        read_shard(&room.join(day).join(DATA_FILENAME))
            .unwrap()
            .into_iter()
            .map(|e| e.event_id)
            .collect()
    }

    #[test]
    fn test_migration_converges_on_current_dir() {
        let root = tempfile::tempdir().unwrap();
        let room = RoomId::new("!room1");
        let old = seed(root.path(), "Alice:!room1", &[event("a1", 10), event("shared", 20)]);
        let current = seed(root.path(), "Alice2:!room1", &[event("b1", 15), event("shared", 20)]);
        Checkpoint {
            next_token: "old-token".into(),
        }
        .save(&old)
        .unwrap();

        let report = migrate_old_rooms(root.path(), &room, "Alice2:!room1", &current);

        assert!(report.failures.is_empty());
        assert_eq!(report.merged_dirs, vec!["Alice:!room1"]);
        assert_eq!(report.events_merged, 2);
        assert!(!old.exists());
        assert_eq!(stored_ids(&current, "1970-01-01"), vec!["a1", "b1", "shared"]);
        // The old checkpoint is not carried over.
        assert_eq!(Checkpoint::load(&current).unwrap().next_token, "");
    }

    #[test]
    fn test_other_rooms_untouched() {
        let root = tempfile::tempdir().unwrap();
        let other = seed(root.path(), "Bob:!room2", &[event("x", 1)]);
        let prefix_clash = seed(root.path(), "Carol:!room10", &[event("y", 1)]);
        let current = root.path().join("Alice:!room1");
        fs::create_dir_all(&current).unwrap();
        fs::create_dir_all(root.path().join("plain-dir")).unwrap();
        fs::write(root.path().join("Stray:!room1"), b"file, not dir").unwrap();

        let room = RoomId::new("!room1");
        let report = migrate_old_rooms(root.path(), &room, "Alice:!room1", &current);

        assert!(report.merged_dirs.is_empty());
        assert!(report.failures.is_empty());
        assert!(other.exists());
        assert!(prefix_clash.exists());
        assert!(root.path().join("Stray:!room1").exists());
    }

    #[test]
    fn test_multiple_candidates_and_flat_legacy_files() {
        let root = tempfile::tempdir().unwrap();
        let room = RoomId::new("!r:x");
        seed(root.path(), "One:!r:x", &[event("e1", 1)]);
        let two = root.path().join("Two:!r:x");
        fs::create_dir_all(&two).unwrap();
        fs::write(
            two.join("1970-01-01.json"),
            serde_json::to_vec(&vec![event("e2", 2)]).unwrap(),
        )
        .unwrap();
        fs::write(two.join("notes.txt"), b"ignored").unwrap();
        let current = root.path().join("Three:!r:x");

        let report = migrate_old_rooms(root.path(), &room, "Three:!r:x", &current);

        assert_eq!(report.merged_dirs, vec!["One:!r:x", "Two:!r:x"]);
        assert_eq!(stored_ids(&current, "1970-01-01"), vec!["e1", "e2"]);
        assert!(!two.exists());
    }

    #[test]
    fn test_undecodable_file_is_skipped_and_reported() {
        let root = tempfile::tempdir().unwrap();
        let room = RoomId::new("!r");
        let old = seed(root.path(), "Old:!r", &[event("good", 1)]);
        let bad_day = old.join("1970-01-05");
        fs::create_dir_all(&bad_day).unwrap();
        fs::write(bad_day.join(DATA_FILENAME), b"not json").unwrap();
        let current = root.path().join("New:!r");

        let report = migrate_old_rooms(root.path(), &room, "New:!r", &current);

        assert!(report.failures.is_empty());
        assert_eq!(report.recovered.len(), 1);
        assert_eq!(report.recovered[0].path, bad_day.join(DATA_FILENAME));
        assert_eq!(stored_ids(&current, "1970-01-01"), vec!["good"]);
        assert!(!old.exists());
    }

    #[test]
    fn test_empty_candidate_is_removed() {
        let root = tempfile::tempdir().unwrap();
        let old = root.path().join("Old:!r");
        fs::create_dir_all(&old).unwrap();
        Checkpoint {
            next_token: "t".into(),
        }
        .save(&old)
        .unwrap();
        let current = root.path().join("New:!r");

        let report = migrate_old_rooms(root.path(), &RoomId::new("!r"), "New:!r", &current);

        assert_eq!(report.merged_dirs, vec!["Old:!r"]);
        assert_eq!(report.events_merged, 0);
        assert!(!old.exists());
        assert!(!current.exists());
    }

    #[test]
    fn test_failed_merge_keeps_old_dir_and_continues() {
        let root = tempfile::tempdir().unwrap();
        let room = RoomId::new("!r");
        let blocked = seed(root.path(), "A:!r", &[event("a", 0)]);
        let fine = seed(root.path(), "B:!r", &[event("b", 86_400_000)]);
        let current = root.path().join("C:!r");
        fs::create_dir_all(&current).unwrap();
        // Day 1970-01-01 cannot be created in the target.
        fs::write(current.join("1970-01-01"), b"blocker").unwrap();

        let report = migrate_old_rooms(root.path(), &room, "C:!r", &current);

        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.merged_dirs, vec!["B:!r"]);
        assert!(blocked.exists());
        assert!(!fine.exists());
        assert_eq!(stored_ids(&current, "1970-01-02"), vec!["b"]);

        let err = report.into_error().unwrap();
        assert!(err.to_string().starts_with("Encountered errors during merge"));
    }

    #[test]
    fn test_missing_backup_root() {
        let root = tempfile::tempdir().unwrap();
        let missing = root.path().join("nope");
        let report = migrate_old_rooms(&missing, &RoomId::new("!r"), "x:!r", &missing.join("x:!r"));
        assert!(report.failures.is_empty());
        assert!(report.into_error().is_none());
    }
}
