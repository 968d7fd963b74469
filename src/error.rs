//! Error types for each stage of a migration run.
//!
//! Everything upstream of the backup snapshot is fatal and surfaces through
//! [`RunError`]. Decode anomalies never become errors, and [`UploadError`] is
//! folded into a per-note replay outcome.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Failures opening or querying the Apple Notes store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Apple Notes database not found at: {}", .0.display())]
    NotFound(PathBuf),

    /// The file exists but cannot be used: locked, permission denied, or not a SQLite file.
    #[error("Failed to open Apple Notes database {}: {source}", path.display())]
    Access {
        path: PathBuf,
        #[source]
        source: rusqlite::Error,
    },

    #[error("{} does not look like an Apple Notes store: {reason}", path.display())]
    UnrecognizedSchema { path: PathBuf, reason: String },

    #[error("Failed to snapshot the note store: {0}")]
    Snapshot(#[from] io::Error),

    #[error("Failed to read note records: {0}")]
    Query(#[from] rusqlite::Error),
}

#[derive(Debug, Error)]
pub enum BackupError {
    #[error("Failed to write backup to {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to serialize backup: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Failed to read backup {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("{} is not a valid notes backup: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Account identity must not be empty")]
    MissingIdentity,

    #[error("Credentials rejected: {0}")]
    Rejected(String),

    #[error("Note service returned {status} during login: {message}")]
    Service { status: u16, message: String },

    #[error("Invalid note service endpoint: {0}")]
    Endpoint(#[from] url::ParseError),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Failed to read credentials: {0}")]
    Prompt(String),
}

/// A single note that the remote store refused or could not receive.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UploadError {
    #[error("{message}")]
    Rejected { status: Option<u16>, message: String },

    #[error("session is no longer valid")]
    SessionExpired,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("unexpected response: {0}")]
    InvalidResponse(String),
}

impl UploadError {
    /// Rate limits, server-side faults and transport failures may succeed on a later attempt.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Rejected {
                status: Some(status),
                ..
            } => *status == 429 || *status >= 500,
            Self::Transport(_) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("Failed to access replay ledger {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Replay ledger {} is corrupt: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Fatal errors that halt a run before replay begins.
#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Backup(#[from] BackupError),

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),
}
