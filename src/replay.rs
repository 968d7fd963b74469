//! Re-creating backed-up notes in the remote service, one independent call per note.
use std::collections::HashMap;
use std::fmt::Write as _;
use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::UploadError;
use crate::model::{Note, NoteId};
use crate::remote::{RemoteId, RemoteNoteStore};

/// How many times a note is attempted when the remote error looks transient.
///
/// The default is a single attempt: failed notes are reported, not retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            backoff: Duration::ZERO,
        }
    }
}

impl RetryPolicy {
    fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum ReplayStatus {
    #[serde(rename_all = "camelCase")]
    Success { remote_id: RemoteId },
    Failure { error: String },
    /// Already created by an earlier run over the same backup.
    #[serde(rename_all = "camelCase")]
    Skipped { remote_id: RemoteId },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplayOutcome {
    pub identity: NoteId,
    pub title: String,
    #[serde(flatten)]
    pub status: ReplayStatus,
    pub attempts: u32,
}

impl ReplayOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self.status, ReplayStatus::Success { .. })
    }

    pub fn is_failure(&self) -> bool {
        matches!(self.status, ReplayStatus::Failure { .. })
    }
}

/// Iterator yielding one outcome per note, in snapshot order.
pub struct Replay<'a, S: RemoteNoteStore> {
    store: &'a S,
    session: &'a S::Session,
    notes: std::slice::Iter<'a, Note>,
    policy: RetryPolicy,
    already_created: HashMap<NoteId, RemoteId>,
}

/// Replay `notes` through `store` under `session`.
pub fn replay<'a, S: RemoteNoteStore>(
    store: &'a S,
    session: &'a S::Session,
    notes: &'a [Note],
    policy: RetryPolicy,
) -> Replay<'a, S> {
    Replay {
        store,
        session,
        notes: notes.iter(),
        policy,
        already_created: HashMap::new(),
    }
}

impl<S: RemoteNoteStore> Replay<'_, S> {
    /// Skip notes a previous run already created; they are reported as [`ReplayStatus::Skipped`].
    pub fn resuming(mut self, already_created: HashMap<NoteId, RemoteId>) -> Self {
        self.already_created = already_created;
        self
    }

    fn upload(&self, note: &Note) -> (ReplayStatus, u32) {
        let max = self.policy.attempts();
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self
                .store
                .create_note(self.session, &note.title, &note.body)
            {
                Ok(remote_id) => {
                    debug!(identity = %note.identity, %remote_id, attempt, "note created");
                    return (ReplayStatus::Success { remote_id }, attempt);
                }
                Err(e) if attempt < max && e.is_transient() => {
                    warn!(identity = %note.identity, attempt, error = %e, "transient upload failure, retrying");
                    if !self.policy.backoff.is_zero() {
                        thread::sleep(self.policy.backoff);
                    }
                }
                Err(e) => {
                    warn!(identity = %note.identity, title = %note.title, error = %e, "upload failed");
                    return (
                        ReplayStatus::Failure {
                            error: e.to_string(),
                        },
                        attempt,
                    );
                }
            }
        }
    }
}

impl<S: RemoteNoteStore> Iterator for Replay<'_, S> {
    type Item = ReplayOutcome;

    fn next(&mut self) -> Option<ReplayOutcome> {
        let note = self.notes.next()?;
        let (status, attempts) = match self.already_created.get(&note.identity) {
            Some(remote_id) => (
                ReplayStatus::Skipped {
                    remote_id: remote_id.clone(),
                },
                0,
            ),
            None => self.upload(note),
        };
        Some(ReplayOutcome {
            identity: note.identity.clone(),
            title: note.title.clone(),
            status,
            attempts,
        })
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.notes.size_hint()
    }
}

/// Every outcome of one replay, in order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplayReport {
    pub outcomes: Vec<ReplayOutcome>,
}

impl ReplayReport {
    pub fn succeeded(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_success()).count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_failure()).count()
    }

    pub fn skipped(&self) -> usize {
        self.outcomes.len() - self.succeeded() - self.failed()
    }

    pub fn failures(&self) -> impl Iterator<Item = &ReplayOutcome> {
        self.outcomes.iter().filter(|o| o.is_failure())
    }

    /// Human-readable summary: totals, then one line per note needing manual re-submission.
    pub fn summary(&self) -> String {
        let mut out = format!(
            "Results: {} succeeded, {} failed",
            self.succeeded(),
            self.failed()
        );
        if self.skipped() > 0 {
            let _ = write!(out, ", {} already uploaded", self.skipped());
        }
        out.push('.');
        for outcome in self.failures() {
            if let ReplayStatus::Failure { error } = &outcome.status {
                let title = if outcome.title.is_empty() {
                    "(untitled)"
                } else {
                    outcome.title.as_str()
                };
                let _ = write!(out, "\n  FAILED {} {:?}: {}", outcome.identity, title, error);
            }
        }
        out
    }
}

impl FromIterator<ReplayOutcome> for ReplayReport {
    fn from_iter<I: IntoIterator<Item = ReplayOutcome>>(iter: I) -> Self {
        Self {
            outcomes: iter.into_iter().collect(),
        }
    }
}

/// Replay every note and collect the report.
pub fn replay_all<S: RemoteNoteStore>(
    store: &S,
    session: &S::Session,
    notes: &[Note],
    policy: RetryPolicy,
) -> ReplayReport {
    replay(store, session, notes, policy).collect()
}
