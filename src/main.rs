use apple_notes_migrate::pipeline::{self, MigrateConfig};
use apple_notes_migrate::{AuthError, Credentials, HttpNoteStore, RetryPolicy};
use clap::Parser;
use dialoguer::{Input, Password};
use eyre::{Context, Result, eyre};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing_subscriber::EnvFilter;
use url::Url;

const DEFAULT_TIMEOUT_SECS: u64 = 30;
const DEFAULT_BACKOFF_MS: u64 = 500;

/// Back up Apple Notes to JSON and replay them into a remote note service.
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Directory the backup file is written to.
    /// Defaults to the current directory if not set in config.
    #[arg(short, long, value_name = "DIR")]
    output_dir: Option<PathBuf>,

    /// Path to the Notes database (NoteStore.sqlite).
    /// Auto-detected if omitted.
    #[arg(long, value_name = "PATH")]
    db: Option<PathBuf>,

    /// Path to a specific configuration file.
    /// Defaults to $XDG_CONFIG_HOME/apple-notes-migrate/config.toml
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Base URL of the note service.
    #[arg(long, value_name = "URL")]
    endpoint: Option<Url>,

    /// Account to sign in as. Prompted for if omitted.
    #[arg(long, value_name = "ACCOUNT")]
    identity: Option<String>,

    /// Replay an existing backup instead of reading the database again.
    /// Notes uploaded by an earlier run of the same backup are skipped.
    #[arg(long, value_name = "BACKUP", conflicts_with = "extract_only")]
    resume: Option<PathBuf>,

    /// Write the backup and stop without contacting the note service.
    #[arg(long)]
    extract_only: bool,

    /// Read from a temporary copy of the database instead of the live file.
    #[arg(long)]
    snapshot: bool,

    /// Per-request timeout for the note service, in seconds.
    #[arg(long, value_name = "SECS")]
    timeout_secs: Option<u64>,

    /// Attempts per note for transient upload failures (1 = no retry).
    #[arg(long, value_name = "N", value_parser = clap::value_parser!(u32).range(1..))]
    max_attempts: Option<u32>,

    /// Suppress progress output; only warnings and the final summary are shown.
    #[arg(short, long)]
    quiet: bool,
}

#[derive(Deserialize, Default)]
struct FileConfig {
    output_dir: Option<PathBuf>,
    db_path: Option<PathBuf>,
    endpoint: Option<Url>,
    identity: Option<String>,
    timeout_secs: Option<u64>,
    max_attempts: Option<u32>,
    backoff_ms: Option<u64>,
}

fn default_db_path() -> Option<PathBuf> {
    dirs::home_dir()
        .map(|h| h.join("Library/Group Containers/group.com.apple.notes/NoteStore.sqlite"))
}

fn load_file_config(explicit_path: Option<&Path>) -> Result<FileConfig> {
    let path = if let Some(p) = explicit_path {
        if !p.exists() {
            return Err(eyre!("Config file not found: {}", p.display()));
        }
        Some(p.to_path_buf())
    } else {
        dirs::config_dir()
            .map(|d| d.join("apple-notes-migrate/config.toml"))
            .filter(|p| p.exists())
    };

    match path {
        None => Ok(FileConfig::default()),
        Some(p) => {
            let content = fs::read_to_string(&p)
                .wrap_err_with(|| format!("Failed to read config: {}", p.display()))?;
            toml::from_str(&content)
                .wrap_err_with(|| format!("Failed to parse config: {}", p.display()))
        }
    }
}

fn init_tracing(quiet: bool) {
    let default = if quiet {
        "apple_notes_migrate=warn"
    } else {
        "apple_notes_migrate=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn prompt_credentials(identity: Option<String>) -> Result<Credentials, AuthError> {
    let prompt_err = |e: dialoguer::Error| AuthError::Prompt(e.to_string());
    let identity = match identity {
        Some(identity) => identity,
        None => Input::<String>::new()
            .with_prompt("Account")
            .interact_text()
            .map_err(prompt_err)?,
    };
    let secret = Password::new()
        .with_prompt(format!("Password for {identity}"))
        .interact()
        .map_err(prompt_err)?;
    Ok(Credentials::new(identity, secret))
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.quiet);

    // 1. Load config file (CLI path > default path)
    let file_cfg = load_file_config(cli.config.as_deref())?;

    // 2. Resolve paths (CLI > Config > Default)
    let output_dir = cli
        .output_dir
        .or(file_cfg.output_dir)
        .unwrap_or_else(|| PathBuf::from("."));

    let db_path = cli
        .db
        .or(file_cfg.db_path)
        .or_else(default_db_path)
        .ok_or_else(|| {
            eyre!("Could not determine database path.\nUse --db to specify manually, or set db_path in config.toml.")
        })?;

    // 3. Resolve the remote side; not needed when only backing up
    let store = if cli.extract_only {
        None
    } else {
        let endpoint = cli.endpoint.or(file_cfg.endpoint).ok_or_else(|| {
            eyre!("No note service endpoint configured.\nUse --endpoint, set endpoint in config.toml, or pass --extract-only.")
        })?;
        let timeout = Duration::from_secs(
            cli.timeout_secs
                .or(file_cfg.timeout_secs)
                .unwrap_or(DEFAULT_TIMEOUT_SECS),
        );
        Some(
            HttpNoteStore::new(&endpoint, timeout)
                .wrap_err_with(|| format!("Invalid note service endpoint: {endpoint}"))?,
        )
    };

    let retry = RetryPolicy {
        max_attempts: cli
            .max_attempts
            .or(file_cfg.max_attempts)
            .unwrap_or(1)
            .max(1),
        backoff: Duration::from_millis(file_cfg.backoff_ms.unwrap_or(DEFAULT_BACKOFF_MS)),
    };

    let config = MigrateConfig {
        db_path,
        output_dir,
        resume_from: cli.resume,
        snapshot_source: cli.snapshot,
        retry,
        quiet: cli.quiet,
    };

    // 4. Run. Per-note upload failures are reported, not returned.
    let identity = cli.identity.or(file_cfg.identity);
    let report = pipeline::execute(&config, store.as_ref(), || prompt_credentials(identity))?;

    eprintln!("Backup saved to: {}", report.backup_path.display());
    match &report.replay {
        Some(replay) => {
            eprintln!("{}", replay.summary());
            if replay.failed() > 0 {
                eprintln!(
                    "Re-run with --resume {} to retry the failed notes.",
                    report.backup_path.display()
                );
            }
        }
        None => eprintln!("{} notes backed up; nothing uploaded.", report.notes),
    }
    Ok(())
}
