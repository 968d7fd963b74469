//! One migration run: extract, back up, authenticate, replay, report.
//!
//! Phases only move forward. A fatal error before [`RunPhase::Replaying`] ends the run;
//! once replay starts the run always reaches [`RunPhase::Reported`].
use std::path::PathBuf;

use chrono::Utc;
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{info, warn};

use crate::backup::{self, BackupSnapshot};
use crate::error::{AuthError, RunError};
use crate::ledger::{ReplayLedger, ledger_path};
use crate::model;
use crate::remote::RemoteNoteStore;
use crate::replay::{self, ReplayReport, RetryPolicy};
use crate::session::{self, Credentials};
use crate::store;

const LEDGER_FLUSH_EVERY: usize = 25;

/// Configuration required to run a migration.
/// This decouples the pipeline from how the arguments were parsed (CLI/config file).
#[derive(Debug, Clone)]
pub struct MigrateConfig {
    pub db_path: PathBuf,
    pub output_dir: PathBuf,
    /// Replay this existing backup instead of extracting a new one.
    pub resume_from: Option<PathBuf>,
    /// Read from a private copy of the store rather than the live file.
    pub snapshot_source: bool,
    pub retry: RetryPolicy,
    pub quiet: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RunPhase {
    Idle,
    Extracting,
    BackedUp,
    Authenticating,
    Replaying,
    Reported,
}

#[derive(Debug)]
pub struct RunReport {
    pub backup_path: PathBuf,
    pub notes: usize,
    /// `None` when nothing was replayed (no remote store, or no notes).
    pub replay: Option<ReplayReport>,
    pub phase: RunPhase,
}

struct Run {
    phase: RunPhase,
}

impl Run {
    fn enter(&mut self, next: RunPhase) {
        debug_assert!(next > self.phase, "{:?} -> {:?}", self.phase, next);
        info!(from = ?self.phase, to = ?next, "run phase");
        self.phase = next;
    }
}

fn progress_bar(len: usize, quiet: bool) -> ProgressBar {
    if quiet {
        return ProgressBar::hidden();
    }
    let bar = ProgressBar::new(len as u64);
    if let Ok(style) =
        ProgressStyle::with_template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} {msg}")
    {
        bar.set_style(style.progress_chars("=>-"));
    }
    bar
}

/// Execute a full run.
///
/// Without a remote `store` the run ends once the backup is written. `credentials` is only
/// invoked once a durable backup exists and there is something to upload, so a failed
/// extraction never prompts the user.
pub fn execute<S, F>(
    config: &MigrateConfig,
    store: Option<&S>,
    credentials: F,
) -> Result<RunReport, RunError>
where
    S: RemoteNoteStore,
    F: FnOnce() -> Result<Credentials, AuthError>,
{
    let mut run = Run {
        phase: RunPhase::Idle,
    };

    run.enter(RunPhase::Extracting);
    let (snapshot, backup_path) = match &config.resume_from {
        Some(path) => {
            let snapshot = backup::read(path)?;
            info!(path = %path.display(), notes = snapshot.notes.len(), "resuming from existing backup");
            (snapshot, path.clone())
        }
        None => {
            let extracted_at = Utc::now();
            let records = store::read_notes(&config.db_path, config.snapshot_source)?;
            let notes = model::extract(records, extracted_at)?;
            let snapshot = BackupSnapshot::new(notes, extracted_at);
            let path = backup::write(&snapshot, &config.output_dir)?;
            (snapshot, path)
        }
    };
    run.enter(RunPhase::BackedUp);

    let store = match store {
        Some(store) if !snapshot.notes.is_empty() => store,
        _ => {
            if snapshot.notes.is_empty() {
                warn!("no notes to upload");
            }
            run.enter(RunPhase::Reported);
            return Ok(RunReport {
                backup_path,
                notes: snapshot.notes.len(),
                replay: None,
                phase: run.phase,
            });
        }
    };

    run.enter(RunPhase::Authenticating);
    let ledger_file = ledger_path(&backup_path);
    let mut ledger = ReplayLedger::load(&ledger_file)?;
    let credentials = credentials()?;
    let session = session::authenticate(store, &credentials)?;

    run.enter(RunPhase::Replaying);
    let created = ledger.created();
    if !created.is_empty() {
        info!(already_created = created.len(), "skipping notes uploaded by an earlier run");
    }

    let pb = progress_bar(snapshot.notes.len(), config.quiet);
    let mut outcomes = Vec::with_capacity(snapshot.notes.len());
    for outcome in replay::replay(store, &session, &snapshot.notes, config.retry).resuming(created) {
        if outcome.is_failure() {
            pb.println(format!("Failed:   {} ({})", outcome.title, outcome.identity));
        }
        pb.inc(1);
        ledger.record(&outcome, Utc::now());
        let created = outcome.is_success();
        outcomes.push(outcome);
        // Successes are persisted before the next upload starts.
        if (created || outcomes.len() % LEDGER_FLUSH_EVERY == 0)
            && let Err(e) = ledger.save(&ledger_file)
        {
            warn!(error = %e, "could not update replay ledger");
        }
    }
    pb.finish_and_clear();
    drop(session);

    if let Err(e) = ledger.save(&ledger_file) {
        warn!(error = %e, "could not save replay ledger; a resumed run will retry every note");
    }

    let report = ReplayReport { outcomes };
    run.enter(RunPhase::Reported);
    info!(
        succeeded = report.succeeded(),
        failed = report.failed(),
        skipped = report.skipped(),
        "replay finished"
    );

    Ok(RunReport {
        backup_path,
        notes: snapshot.notes.len(),
        replay: Some(report),
        phase: run.phase,
    })
}
