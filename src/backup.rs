//! The local JSON snapshot written before anything touches the network.
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::info;

use crate::error::BackupError;
use crate::model::Note;

pub const BACKUP_PREFIX: &str = "apple_notes_backup_";
const MAX_NAME_ATTEMPTS: u32 = 100;

/// Every extracted note plus the instant extraction ran.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupSnapshot {
    pub captured_at: DateTime<Utc>,
    pub notes: Vec<Note>,
}

impl BackupSnapshot {
    /// Deleted notes never enter a snapshot.
    pub fn new(mut notes: Vec<Note>, captured_at: DateTime<Utc>) -> Self {
        notes.retain(|note| !note.is_deleted);
        Self { captured_at, notes }
    }
}

/// `apple_notes_backup_YYYYmmdd_HHMMSS.json`, with `-N` appended for the Nth retry.
pub fn backup_file_name(captured_at: DateTime<Utc>, attempt: u32) -> String {
    let stamp = captured_at
        .with_timezone(&Local)
        .format("%Y%m%d_%H%M%S");
    if attempt == 0 {
        format!("{BACKUP_PREFIX}{stamp}.json")
    } else {
        format!("{BACKUP_PREFIX}{stamp}-{attempt}.json")
    }
}

/// Write `snapshot` into `output_dir` and return the file's path.
///
/// The file is written to a temporary sibling, synced, and then moved into place without
/// replacing anything already there.
pub fn write(snapshot: &BackupSnapshot, output_dir: &Path) -> Result<PathBuf, BackupError> {
    let write_err = |path: &Path| {
        let path = path.to_path_buf();
        move |source| BackupError::Write { path, source }
    };

    fs::create_dir_all(output_dir).map_err(write_err(output_dir))?;
    let json = serde_json::to_vec_pretty(snapshot)?;

    let mut tmp = NamedTempFile::new_in(output_dir).map_err(write_err(output_dir))?;
    tmp.write_all(&json).map_err(write_err(tmp.path()))?;
    tmp.as_file().sync_all().map_err(write_err(tmp.path()))?;

    for attempt in 0..MAX_NAME_ATTEMPTS {
        let path = output_dir.join(backup_file_name(snapshot.captured_at, attempt));
        match tmp.persist_noclobber(&path) {
            Ok(_) => {
                info!(path = %path.display(), notes = snapshot.notes.len(), "backup written");
                return Ok(path);
            }
            Err(e) if e.error.kind() == io::ErrorKind::AlreadyExists => tmp = e.file,
            Err(e) => return Err(BackupError::Write { path, source: e.error }),
        }
    }

    Err(BackupError::Write {
        path: output_dir.to_path_buf(),
        source: io::Error::new(
            io::ErrorKind::AlreadyExists,
            "no free backup file name for this timestamp",
        ),
    })
}

/// Load a snapshot previously produced by [`write`]. Notes flagged deleted are dropped
/// again, whatever wrote the file.
pub fn read(path: &Path) -> Result<BackupSnapshot, BackupError> {
    let content = fs::read(path).map_err(|source| BackupError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let parsed: BackupSnapshot =
        serde_json::from_slice(&content).map_err(|source| BackupError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
    Ok(BackupSnapshot::new(parsed.notes, parsed.captured_at))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::NoteId;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn note(pk: i64, title: &str, body: &str) -> Note {
        let at = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        Note {
            identity: NoteId::from_primary_key(pk),
            title: title.to_string(),
            body: body.to_string(),
            folder: None,
            created_at: at,
            modified_at: at,
            is_deleted: false,
        }
    }

    fn captured_at() -> DateTime<Utc> {
        DateTime::from_timestamp(1_760_000_000, 0).unwrap()
    }

    #[test]
    fn file_name_embeds_local_time_to_the_second() {
        let stamp = captured_at().with_timezone(&Local).format("%Y%m%d_%H%M%S");
        assert_eq!(
            backup_file_name(captured_at(), 0),
            format!("apple_notes_backup_{stamp}.json")
        );
        assert_eq!(
            backup_file_name(captured_at(), 2),
            format!("apple_notes_backup_{stamp}-2.json")
        );
    }

    #[test]
    fn round_trip_preserves_text_exactly() {
        let dir = TempDir::new().unwrap();
        let snapshot = BackupSnapshot::new(
            vec![
                note(1, "Groceries", "milk, eggs"),
                note(2, "", ""),
                note(3, "Ünïcödé \"quotes\"", "line one\n\ttabbed\r\nemoji 🎉 \u{0}nul"),
            ],
            captured_at(),
        );

        let path = write(&snapshot, dir.path()).unwrap();
        let loaded = read(&path).unwrap();

        assert_eq!(loaded, snapshot);
    }

    #[test]
    fn same_second_backups_never_collide() {
        let dir = TempDir::new().unwrap();
        let snapshot = BackupSnapshot::new(vec![note(1, "a", "b")], captured_at());

        let first = write(&snapshot, dir.path()).unwrap();
        let second = write(&snapshot, dir.path()).unwrap();

        assert_ne!(first, second);
        assert_eq!(
            second.file_name().unwrap().to_string_lossy(),
            backup_file_name(captured_at(), 1)
        );
        assert_eq!(read(&first).unwrap(), read(&second).unwrap());
    }

    #[test]
    fn snapshot_drops_deleted_notes() {
        let mut deleted = note(2, "gone", "");
        deleted.is_deleted = true;
        let snapshot = BackupSnapshot::new(vec![note(1, "kept", ""), deleted], captured_at());
        assert_eq!(snapshot.notes.len(), 1);
        assert_eq!(snapshot.notes[0].title, "kept");
    }

    #[test]
    fn reading_drops_notes_flagged_deleted() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("edited.json");
        let mut deleted = note(2, "gone", "");
        deleted.is_deleted = true;
        let edited = BackupSnapshot {
            captured_at: captured_at(),
            notes: vec![note(1, "kept", ""), deleted],
        };
        fs::write(&path, serde_json::to_vec(&edited).unwrap()).unwrap();

        let loaded = read(&path).unwrap();
        let titles: Vec<&str> = loaded.notes.iter().map(|n| n.title.as_str()).collect();
        assert_eq!(titles, vec!["kept"]);
    }

    #[test]
    fn unwritable_target_is_a_write_error() {
        let dir = TempDir::new().unwrap();
        let blocker = dir.path().join("not-a-dir");
        fs::write(&blocker, b"file in the way").unwrap();

        let snapshot = BackupSnapshot::new(vec![], captured_at());
        let err = write(&snapshot, &blocker.join("backups")).unwrap_err();
        assert!(matches!(err, BackupError::Write { .. }));
    }

    #[test]
    fn reading_garbage_is_a_parse_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("broken.json");
        fs::write(&path, b"{ not json").unwrap();
        assert!(matches!(read(&path), Err(BackupError::Parse { .. })));
    }
}
