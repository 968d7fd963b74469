//! Portable note records built from raw store rows.
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::decoder::{self, DecodedText};
use crate::error::StoreError;
use crate::store::RawNoteRecord;

/// Identity of a note within one extraction run.
///
/// Derived from the Core Data primary key, which Notes may reassign between releases, so
/// identities from backups taken on different days must not be compared.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NoteId(String);

impl NoteId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn from_primary_key(pk: i64) -> Self {
        Self(format!("x-coredata-pk-{pk}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NoteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A normalized note as written to the backup and replayed remotely.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Note {
    pub identity: NoteId,
    pub title: String,
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub folder: Option<String>,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
    #[serde(default)]
    pub is_deleted: bool,
}

/// Compose a raw row and its decoded body into a [`Note`].
///
/// Missing timestamps fall back to `extracted_at`. A row without any body blob takes the
/// store's snippet; a blob that decoded to nothing yields an empty body.
pub fn build(raw: RawNoteRecord, decoded: DecodedText, extracted_at: DateTime<Utc>) -> Note {
    let body = match decoded {
        DecodedText::Unparseable if raw.data.is_none() => raw.snippet.unwrap_or_default(),
        decoded => decoded.into_body(),
    };

    Note {
        identity: NoteId::from_primary_key(raw.pk),
        title: raw.title,
        body,
        folder: raw.folder,
        created_at: raw.created_at.unwrap_or(extracted_at),
        modified_at: raw.modified_at.unwrap_or(extracted_at),
        is_deleted: raw.marked_for_deletion,
    }
}

/// Decode and build every record, dropping deleted notes.
///
/// A store error while iterating aborts the whole extraction; a note that fails to decode
/// never does.
pub fn extract<I>(records: I, extracted_at: DateTime<Utc>) -> Result<Vec<Note>, StoreError>
where
    I: IntoIterator<Item = Result<RawNoteRecord, StoreError>>,
{
    let mut notes = Vec::new();
    let mut deleted = 0usize;
    let mut degraded = 0usize;

    for record in records {
        let record = record?;
        if record.marked_for_deletion {
            debug!(pk = record.pk, "skipping deleted note");
            deleted += 1;
            continue;
        }

        let decoded = record
            .data
            .as_deref()
            .map_or(DecodedText::Unparseable, decoder::decode);
        match &decoded {
            DecodedText::FullyParsed(_) => {}
            DecodedText::PartiallyParsed(_) => {
                degraded += 1;
                debug!(pk = record.pk, "note body recovered heuristically");
            }
            DecodedText::Unparseable if record.data.is_some() => {
                degraded += 1;
                warn!(pk = record.pk, title = %record.title, "note body unreadable, keeping an empty body");
            }
            DecodedText::Unparseable => {}
        }

        notes.push(build(record, decoded, extracted_at));
    }

    info!(notes = notes.len(), deleted, degraded, "extracted notes");
    Ok(notes)
}
