#![allow(dead_code)]

use std::cell::RefCell;
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use apple_notes_migrate::{AuthError, Credentials, RemoteId, RemoteNoteStore, UploadError};
use flate2::Compression;
use flate2::write::GzEncoder;
use rusqlite::{Connection, params};

fn varint(mut value: u64, out: &mut Vec<u8>) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

fn field(number: u64, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    varint(number << 3 | 2, &mut out);
    varint(payload.len() as u64, &mut out);
    out.extend_from_slice(payload);
    out
}

/// A gzip-compressed note document holding `text`, shaped the way Notes stores bodies.
pub fn note_blob(text: &str) -> Vec<u8> {
    let mut note = vec![0x08, 0x00];
    note.extend(field(2, text.as_bytes()));
    let mut document = vec![0x08, 0x00, 0x10, 0x00];
    document.extend(field(3, &note));
    let mut root = vec![0x08, 0x00];
    root.extend(field(2, &document));

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&root).unwrap();
    encoder.finish().unwrap()
}

/// Builds a minimal `NoteStore.sqlite` with one "Notes" folder.
pub struct StoreFixture {
    path: PathBuf,
    conn: Connection,
}

impl StoreFixture {
    pub fn create(dir: &Path) -> Self {
        let path = dir.join("NoteStore.sqlite");
        let conn = Connection::open(&path).unwrap();
        conn.execute_batch(
            "CREATE TABLE ZICCLOUDSYNCINGOBJECT (
                 Z_PK INTEGER PRIMARY KEY,
                 ZTITLE1 VARCHAR,
                 ZTITLE2 VARCHAR,
                 ZSNIPPET VARCHAR,
                 ZFOLDER INTEGER,
                 ZFOLDERTYPE INTEGER,
                 ZCREATIONDATE1 TIMESTAMP,
                 ZMODIFICATIONDATE1 TIMESTAMP,
                 ZMARKEDFORDELETION INTEGER
             );
             CREATE TABLE ZICNOTEDATA (Z_PK INTEGER PRIMARY KEY, ZNOTE INTEGER, ZDATA BLOB);
             INSERT INTO ZICCLOUDSYNCINGOBJECT (Z_PK, ZTITLE2, ZFOLDERTYPE) VALUES (1, 'Notes', 0);",
        )
        .unwrap();
        Self { path, conn }
    }

    pub fn note(self, pk: i64, title: &str, body: &str) -> Self {
        self.raw_note(pk, title, Some(note_blob(body)), false)
    }

    pub fn raw_note(self, pk: i64, title: &str, blob: Option<Vec<u8>>, deleted: bool) -> Self {
        self.conn
            .execute(
                "INSERT INTO ZICCLOUDSYNCINGOBJECT
                     (Z_PK, ZTITLE1, ZFOLDER, ZCREATIONDATE1, ZMODIFICATIONDATE1, ZMARKEDFORDELETION)
                 VALUES (?1, ?2, 1, 700000000.0, 700003600.0, ?3)",
                params![pk, title, deleted],
            )
            .unwrap();
        if let Some(blob) = blob {
            self.conn
                .execute(
                    "INSERT INTO ZICNOTEDATA (ZNOTE, ZDATA) VALUES (?1, ?2)",
                    params![pk, blob],
                )
                .unwrap();
        }
        self
    }

    pub fn sql(self, statements: &str) -> Self {
        self.conn.execute_batch(statements).unwrap();
        self
    }

    pub fn finish(self) -> PathBuf {
        self.path
    }
}

/// In-memory note service that records every call and fails notes by title.
#[derive(Default)]
pub struct FakeNoteStore {
    pub reject_login: Option<String>,
    pub failures: HashMap<String, UploadError>,
    pub crash_on: Option<String>,
    pub logins: RefCell<Vec<String>>,
    pub created: RefCell<Vec<(String, String)>>,
}

impl FakeNoteStore {
    pub fn failing(mut self, title: &str, error: UploadError) -> Self {
        self.failures.insert(title.to_string(), error);
        self
    }

    /// Panic mid-upload on `title`, standing in for a process killed during replay.
    pub fn crashing_on(mut self, title: &str) -> Self {
        self.crash_on = Some(title.to_string());
        self
    }

    pub fn rejecting_login(mut self, message: &str) -> Self {
        self.reject_login = Some(message.to_string());
        self
    }

    pub fn calls(&self) -> usize {
        self.logins.borrow().len() + self.created.borrow().len()
    }

    pub fn created_titles(&self) -> Vec<String> {
        self.created.borrow().iter().map(|(t, _)| t.clone()).collect()
    }
}

impl RemoteNoteStore for FakeNoteStore {
    type Session = String;

    fn login(&self, credentials: &Credentials) -> Result<String, AuthError> {
        self.logins.borrow_mut().push(credentials.identity.clone());
        match &self.reject_login {
            Some(message) => Err(AuthError::Rejected(message.clone())),
            None => Ok(format!("token-for-{}", credentials.identity)),
        }
    }

    fn create_note(&self, session: &String, title: &str, body: &str) -> Result<RemoteId, UploadError> {
        assert!(session.starts_with("token-for-"));
        if self.crash_on.as_deref() == Some(title) {
            panic!("connection dropped while creating {title:?}");
        }
        if let Some(error) = self.failures.get(title) {
            return Err(error.clone());
        }
        let mut created = self.created.borrow_mut();
        created.push((title.to_string(), body.to_string()));
        Ok(RemoteId::new(format!("remote-{}", created.len())))
    }
}

pub fn credentials() -> Result<Credentials, AuthError> {
    Ok(Credentials::new("me@example.com", "hunter2"))
}
