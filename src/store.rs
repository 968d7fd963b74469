//! Read-only access to the Apple Notes Core Data store.
//!
//! Storage format: SQLite (`NoteStore.sqlite`) managed by Core Data. Note bodies live in a
//! separate table as gzip-compressed protobuf blobs.
//!
//! Relevant tables (column names drift between Notes releases):
//! ```sql
//! CREATE TABLE ZICCLOUDSYNCINGOBJECT (
//!     Z_PK                INTEGER PRIMARY KEY,
//!     ZTITLE1             VARCHAR,    -- note title ("ZTITLE" on old stores)
//!     ZTITLE2             VARCHAR,    -- folder title (folder rows only)
//!     ZSNIPPET            VARCHAR,
//!     ZFOLDER             INTEGER,    -- Z_PK of the owning folder row
//!     ZFOLDERTYPE         INTEGER,    -- 1 = "Recently Deleted"
//!     ZCREATIONDATE1      TIMESTAMP,  -- also ZCREATIONDATE3 / ZCREATIONDATE
//!     ZMODIFICATIONDATE1  TIMESTAMP,  -- also ZMODIFICATIONDATE
//!     ZMARKEDFORDELETION  INTEGER,
//!     ...
//! );
//! CREATE TABLE ZICNOTEDATA (
//!     Z_PK   INTEGER PRIMARY KEY,
//!     ZNOTE  INTEGER,                 -- Z_PK of the note row
//!     ZDATA  BLOB,
//!     ...
//! );
//! ```
//!
//! Timestamps are Core Data reference dates: seconds since 2001-01-01T00:00:00Z.
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::types::ValueRef;
use rusqlite::{Connection, OpenFlags, Row, backup::Backup, params};
use tempfile::NamedTempFile;
use tracing::{debug, info};

use crate::error::StoreError;

/// Seconds between the Unix epoch and the Core Data reference date.
pub const CORE_DATA_EPOCH_OFFSET: i64 = 978_307_200;

const OBJECT_TABLE: &str = "ZICCLOUDSYNCINGOBJECT";
const DATA_TABLE: &str = "ZICNOTEDATA";
const PAGE_SIZE: usize = 256;
const TRASH_FOLDER_TYPE: i64 = 1;

const TITLE_COLUMNS: &[&str] = &["ZTITLE1", "ZTITLE"];
const CREATED_COLUMNS: &[&str] = &["ZCREATIONDATE3", "ZCREATIONDATE1", "ZCREATIONDATE"];
const MODIFIED_COLUMNS: &[&str] = &["ZMODIFICATIONDATE1", "ZMODIFICATIONDATE"];

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// One note row exactly as the store holds it, before any decoding.
#[derive(Debug, Clone, PartialEq)]
pub struct RawNoteRecord {
    /// Core Data primary key (`Z_PK`).
    pub pk: i64,
    pub title: String,
    pub folder: Option<String>,
    /// Plain-text preview maintained by Notes; used when the body blob is missing.
    pub snippet: Option<String>,
    /// Compressed body blob, absent when the note has no `ZICNOTEDATA` row.
    pub data: Option<Vec<u8>>,
    pub created_at: Option<DateTime<Utc>>,
    pub modified_at: Option<DateTime<Utc>>,
    /// Set for notes sitting in "Recently Deleted".
    pub marked_for_deletion: bool,
}

/// Convert a Core Data reference date to UTC. Returns `None` for values chrono can't represent.
pub fn core_data_to_utc(seconds: f64) -> Option<DateTime<Utc>> {
    if !seconds.is_finite() {
        return None;
    }
    let whole = seconds.floor();
    let nanos = (((seconds - whole) * 1e9) as u32).min(999_999_999);
    let secs = (whole as i64).checked_add(CORE_DATA_EPOCH_OFFSET)?;
    DateTime::from_timestamp(secs, nanos)
}

// ---------------------------------------------------------------------------
// Schema probing
// ---------------------------------------------------------------------------

/// Column layout detected for a particular store.
#[derive(Debug, Clone, PartialEq, Eq)]
struct NoteColumns {
    title: &'static str,
    created: Option<&'static str>,
    modified: Option<&'static str>,
    snippet: bool,
    deletion_flag: bool,
    folder_title: bool,
    folder_type: bool,
    note_data: bool,
}

impl NoteColumns {
    fn probe(conn: &Connection, path: &Path) -> Result<Self, StoreError> {
        let access = |source| StoreError::Access {
            path: path.to_path_buf(),
            source,
        };
        let objects = table_columns(conn, OBJECT_TABLE).map_err(access)?;
        if objects.is_empty() {
            return Err(StoreError::UnrecognizedSchema {
                path: path.to_path_buf(),
                reason: format!("missing table {OBJECT_TABLE}"),
            });
        }
        let data = table_columns(conn, DATA_TABLE).map_err(access)?;

        let pick = |candidates: &[&'static str]| {
            candidates
                .iter()
                .copied()
                .find(|c| objects.contains(*c))
        };
        let title = pick(TITLE_COLUMNS).ok_or_else(|| StoreError::UnrecognizedSchema {
            path: path.to_path_buf(),
            reason: "no note title column".to_string(),
        })?;

        Ok(Self {
            title,
            created: pick(CREATED_COLUMNS),
            modified: pick(MODIFIED_COLUMNS),
            snippet: objects.contains("ZSNIPPET"),
            deletion_flag: objects.contains("ZMARKEDFORDELETION"),
            folder_title: objects.contains("ZFOLDER") && objects.contains("ZTITLE2"),
            folder_type: objects.contains("ZFOLDER") && objects.contains("ZFOLDERTYPE"),
            note_data: data.contains("ZNOTE") && data.contains("ZDATA"),
        })
    }

    /// Keyset-paginated query: `?1` is the last primary key seen, `?2` the page size.
    fn page_query(&self) -> String {
        let opt = |present: bool, expr: &str| {
            if present {
                expr.to_string()
            } else {
                "NULL".to_string()
            }
        };
        let folder_title = opt(
            self.folder_title,
            &format!("(SELECT f.ZTITLE2 FROM {OBJECT_TABLE} f WHERE f.Z_PK = n.ZFOLDER)"),
        );
        let in_trash = opt(
            self.folder_type,
            &format!(
                "(SELECT f.ZFOLDERTYPE = {TRASH_FOLDER_TYPE} FROM {OBJECT_TABLE} f WHERE f.Z_PK = n.ZFOLDER)"
            ),
        );
        let data = opt(
            self.note_data,
            &format!(
                "(SELECT d.ZDATA FROM {DATA_TABLE} d WHERE d.ZNOTE = n.Z_PK ORDER BY d.Z_PK LIMIT 1)"
            ),
        );
        let snippet = opt(self.snippet, "n.ZSNIPPET");
        let created = self.created.map_or_else(|| "NULL".into(), |c| format!("n.{c}"));
        let modified = self.modified.map_or_else(|| "NULL".into(), |c| format!("n.{c}"));
        let not_deleted = if self.deletion_flag {
            "AND COALESCE(n.ZMARKEDFORDELETION, 0) = 0"
        } else {
            ""
        };

        format!(
            "SELECT n.Z_PK, n.{title}, {folder_title}, {snippet}, {data}, {created}, {modified}, {in_trash} \
             FROM {OBJECT_TABLE} n \
             WHERE n.{title} IS NOT NULL {not_deleted} AND n.Z_PK > ?1 \
             ORDER BY n.Z_PK LIMIT ?2",
            title = self.title,
        )
    }
}

fn table_columns(conn: &Connection, table: &str) -> rusqlite::Result<HashSet<String>> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
    stmt.query_map([], |row| row.get::<_, String>(1))?
        .collect()
}

/// Text as stored, with invalid UTF-8 replaced rather than rejected.
fn lossy_text(value: ValueRef<'_>) -> Option<String> {
    match value {
        ValueRef::Text(bytes) | ValueRef::Blob(bytes) => {
            Some(String::from_utf8_lossy(bytes).into_owned())
        }
        ValueRef::Integer(i) => Some(i.to_string()),
        ValueRef::Real(f) => Some(f.to_string()),
        ValueRef::Null => None,
    }
}

/// Only numeric values are Core Data dates; anything else reads as missing.
fn lossy_timestamp(value: ValueRef<'_>) -> Option<DateTime<Utc>> {
    match value {
        ValueRef::Real(seconds) => core_data_to_utc(seconds),
        ValueRef::Integer(seconds) => core_data_to_utc(seconds as f64),
        _ => None,
    }
}

fn lossy_blob(value: ValueRef<'_>) -> Option<Vec<u8>> {
    match value {
        ValueRef::Blob(bytes) | ValueRef::Text(bytes) => Some(bytes.to_vec()),
        _ => None,
    }
}

fn lossy_flag(value: ValueRef<'_>) -> bool {
    match value {
        ValueRef::Integer(i) => i != 0,
        ValueRef::Real(f) => f != 0.0,
        _ => false,
    }
}

/// Map one row. Only the primary key is strict: a malformed value in any other column
/// degrades that field instead of failing the page.
fn read_row(row: &Row<'_>) -> rusqlite::Result<RawNoteRecord> {
    Ok(RawNoteRecord {
        pk: row.get(0)?,
        title: lossy_text(row.get_ref(1)?).unwrap_or_default(),
        folder: lossy_text(row.get_ref(2)?),
        snippet: lossy_text(row.get_ref(3)?),
        data: lossy_blob(row.get_ref(4)?),
        created_at: lossy_timestamp(row.get_ref(5)?),
        modified_at: lossy_timestamp(row.get_ref(6)?),
        marked_for_deletion: lossy_flag(row.get_ref(7)?),
    })
}

// ---------------------------------------------------------------------------
// Reader
// ---------------------------------------------------------------------------

fn open_db(path: &Path) -> Result<Connection, StoreError> {
    let access = |source| StoreError::Access {
        path: path.to_path_buf(),
        source,
    };
    let conn = Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )
    .map_err(access)?;
    conn.busy_timeout(Duration::from_secs(5)).map_err(access)?;
    conn.execute_batch("PRAGMA query_only = ON; PRAGMA cache_size = -16384;")
        .map_err(access)?;
    Ok(conn)
}

/// Copy the live store into a private temporary database through SQLite's online backup API.
fn snapshot_database(db_path: &Path) -> Result<NamedTempFile, StoreError> {
    let access = |source| StoreError::Access {
        path: db_path.to_path_buf(),
        source,
    };
    let src = open_db(db_path)?;
    let tmp = NamedTempFile::new()?;
    let mut dst = Connection::open(tmp.path()).map_err(access)?;

    {
        let backup = Backup::new(&src, &mut dst).map_err(access)?;
        backup
            .run_to_completion(1000, Duration::from_millis(5), None)
            .map_err(access)?;
    }

    debug!(snapshot = %tmp.path().display(), "snapshotted note store");
    Ok(tmp)
}

/// Open the store read-only and return a lazy sequence of non-deleted note records.
///
/// With `snapshot` set, the live store is copied to a temporary file first and the
/// records are read from the copy. The connection (and snapshot) are released when the
/// returned sequence is dropped.
pub fn read_notes(db_path: &Path, snapshot: bool) -> Result<NoteRecords, StoreError> {
    if !db_path.exists() {
        return Err(StoreError::NotFound(db_path.to_path_buf()));
    }

    let snapshot_file = if snapshot {
        Some(snapshot_database(db_path)?)
    } else {
        None
    };
    let read_path: PathBuf = snapshot_file
        .as_ref()
        .map_or_else(|| db_path.to_path_buf(), |f| f.path().to_path_buf());

    let conn = open_db(&read_path)?;
    let columns = NoteColumns::probe(&conn, db_path)?;
    info!(
        path = %db_path.display(),
        title_column = columns.title,
        snapshot,
        "opened Apple Notes store"
    );

    Ok(NoteRecords {
        conn,
        sql: columns.page_query(),
        after_pk: i64::MIN,
        page: Vec::new().into_iter(),
        exhausted: false,
        _snapshot: snapshot_file,
    })
}

/// Lazy, finite, single-pass sequence of note rows ordered by primary key.
pub struct NoteRecords {
    conn: Connection,
    sql: String,
    after_pk: i64,
    page: std::vec::IntoIter<RawNoteRecord>,
    exhausted: bool,
    // Declared after `conn` so the connection closes before the file is removed.
    _snapshot: Option<NamedTempFile>,
}

impl NoteRecords {
    fn fetch_page(&mut self) -> Result<(), StoreError> {
        let rows: Vec<RawNoteRecord> = {
            let mut stmt = self.conn.prepare_cached(&self.sql)?;
            stmt.query_map(params![self.after_pk, PAGE_SIZE as i64], read_row)?
                .collect::<rusqlite::Result<_>>()?
        };
        if rows.len() < PAGE_SIZE {
            self.exhausted = true;
        }
        if let Some(last) = rows.last() {
            self.after_pk = last.pk;
        }
        debug!(rows = rows.len(), after_pk = self.after_pk, "fetched note page");
        self.page = rows.into_iter();
        Ok(())
    }
}

impl Iterator for NoteRecords {
    type Item = Result<RawNoteRecord, StoreError>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(record) = self.page.next() {
            return Some(Ok(record));
        }
        if self.exhausted {
            return None;
        }
        match self.fetch_page() {
            Ok(()) => self.page.next().map(Ok),
            Err(e) => {
                self.exhausted = true;
                Some(Err(e))
            }
        }
    }
}
