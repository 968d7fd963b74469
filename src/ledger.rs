//! Persisted replay outcomes, kept beside a backup so a later run retries only what failed.
//!
//! The ledger is a separate file (`<backup>.replay.json`); the backup itself is never
//! touched. Entries are keyed by note identity, which is only meaningful for the backup
//! the ledger sits next to.
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use crate::error::LedgerError;
use crate::model::NoteId;
use crate::remote::RemoteId;
use crate::replay::{ReplayOutcome, ReplayStatus};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerEntry {
    pub title: String,
    #[serde(flatten)]
    pub status: ReplayStatus,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayLedger {
    entries: BTreeMap<NoteId, LedgerEntry>,
}

/// `apple_notes_backup_X.json` → `apple_notes_backup_X.json.replay.json`.
pub fn ledger_path(backup_path: &Path) -> PathBuf {
    let mut name = backup_path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".replay.json");
    backup_path.with_file_name(name)
}

impl ReplayLedger {
    /// Load the ledger at `path`; a missing file is an empty ledger.
    pub fn load(path: &Path) -> Result<Self, LedgerError> {
        let content = match fs::read(path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(source) => {
                return Err(LedgerError::Io {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };
        serde_json::from_slice(&content).map_err(|source| LedgerError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Atomically replace the ledger file.
    pub fn save(&self, path: &Path) -> Result<(), LedgerError> {
        let io_err = |source| LedgerError::Io {
            path: path.to_path_buf(),
            source,
        };
        let dir = path.parent().filter(|p| !p.as_os_str().is_empty());
        let mut tmp = match dir {
            Some(dir) => NamedTempFile::new_in(dir),
            None => NamedTempFile::new_in("."),
        }
        .map_err(io_err)?;
        let json = serde_json::to_vec_pretty(self).map_err(|e| io_err(e.into()))?;
        tmp.write_all(&json).map_err(io_err)?;
        tmp.as_file().sync_all().map_err(io_err)?;
        tmp.persist(path).map_err(|e| io_err(e.error))?;
        Ok(())
    }

    /// Record an outcome. Skips are no-ops and a recorded success is never downgraded.
    pub fn record(&mut self, outcome: &ReplayOutcome, recorded_at: DateTime<Utc>) {
        match &outcome.status {
            ReplayStatus::Skipped { .. } => {}
            ReplayStatus::Failure { .. }
                if self
                    .entries
                    .get(&outcome.identity)
                    .is_some_and(|e| matches!(e.status, ReplayStatus::Success { .. })) => {}
            status => {
                self.entries.insert(
                    outcome.identity.clone(),
                    LedgerEntry {
                        title: outcome.title.clone(),
                        status: status.clone(),
                        recorded_at,
                    },
                );
            }
        }
    }

    /// Notes already created remotely, with the id the service gave them.
    pub fn created(&self) -> HashMap<NoteId, RemoteId> {
        self.entries
            .iter()
            .filter_map(|(id, entry)| match &entry.status {
                ReplayStatus::Success { remote_id } => Some((id.clone(), remote_id.clone())),
                _ => None,
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
