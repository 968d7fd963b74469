//! # apple-notes-migrate
//!
//! Moves notes out of Apple Notes and into a remote note service.
//!
//! ## What it does
//!
//! Apple Notes keeps everything in a Core Data SQLite database (`NoteStore.sqlite`) with
//! each note body stored as a gzip-compressed protobuf blob. This crate reads that
//! database, recovers plain text from every body, writes a timestamped JSON backup of
//! all notes, and only then uploads each note to the remote service, reporting which
//! ones succeeded and which need another attempt.
//!
//! The database is opened **read-only**. Your Notes data is never modified.
//!
//! ## Failure model
//!
//! Anything that goes wrong before the backup is safely on disk stops the run. Once the
//! backup exists, each upload stands alone: a rejected note is reported and the run moves
//! on. Outcomes are kept in a ledger beside the backup, so re-running with
//! `--resume <backup>` only retries what failed.
//!
//! ## Usage
//!
//! ```sh
//! # Back up and upload, prompting for the password
//! apple-notes-migrate --endpoint https://notes.example.com/api --identity me@example.com
//!
//! # Only write the backup
//! apple-notes-migrate --extract-only --output-dir ~/notes-backups
//!
//! # Retry the failures of an earlier run
//! apple-notes-migrate --resume apple_notes_backup_20260301_120000.json --endpoint ...
//! ```
//!
//! Preferences can be persisted in `~/.config/apple-notes-migrate/config.toml`.
//!
//! ## Compatibility
//!
//! Tracks Apple's internal (undocumented) schema. Column names are probed at runtime, and
//! body decoding falls back to recovering readable text when the protobuf layout is not
//! the expected one.
pub mod backup;
pub mod decoder;
pub mod error;
pub mod ledger;
pub mod model;
pub mod pipeline;
pub mod remote;
pub mod replay;
pub mod session;
pub mod store;

pub use backup::BackupSnapshot;
pub use decoder::DecodedText;
pub use error::{AuthError, BackupError, LedgerError, RunError, StoreError, UploadError};
pub use model::{Note, NoteId};
pub use pipeline::{MigrateConfig, RunPhase, RunReport};
pub use remote::{HttpNoteStore, RemoteId, RemoteNoteStore};
pub use replay::{ReplayOutcome, ReplayReport, ReplayStatus, RetryPolicy};
pub use session::Credentials;
