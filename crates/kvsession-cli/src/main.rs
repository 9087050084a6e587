//! kvsession CLI
//!
//! Inspect and maintain file-backed session directories

use anyhow::{Context, bail};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use kvsession::SessionConfig;
use kvsession_storage::file::{SESSION_FILE_EXT, decode_payload, is_expired, read_header, split_header};
use kvsession_storage::{CryptoKey, FileStorage, FileStorageOptions, SessionData, validate_session_id};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser)]
#[command(name = "kvsession")]
#[command(about = "Inspect and maintain file-backed session stores", long_about = None)]
struct Cli {
    /// Log level (overridden by RUST_LOG)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List session files with their last-touched time
    List {
        /// Session directory
        #[arg(long)]
        dir: PathBuf,

        /// TTL in seconds; marks expired sessions when given
        #[arg(long)]
        ttl: Option<u64>,
    },
    /// Print one session as JSON
    Show {
        #[arg(long)]
        dir: PathBuf,

        #[arg(long)]
        id: String,

        #[arg(long, default_value = "86400")]
        ttl: u64,

        /// 32-byte key the sessions were encrypted with
        #[arg(long, env = "KVSESSION_CRYPTO_KEY")]
        crypto_key: Option<String>,
    },
    /// Delete expired session files
    Gc {
        #[arg(long)]
        dir: PathBuf,

        #[arg(long)]
        ttl: u64,
    },
    /// Load and validate a session config file
    CheckConfig {
        /// Path to a .json, .yaml/.yml or .toml file
        file: PathBuf,
    },
}

struct SessionEntry {
    id: String,
    touched_at: i64,
    expired: Option<bool>,
}

fn init_tracing(log_level: &str) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

fn list_sessions(dir: &Path, ttl: Option<Duration>) -> anyhow::Result<Vec<SessionEntry>> {
    let now = Utc::now().timestamp_millis();
    let mut entries = Vec::new();

    for entry in std::fs::read_dir(dir).with_context(|| format!("Cannot read {}", dir.display()))? {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some(SESSION_FILE_EXT) {
            continue;
        }
        let Some(id) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };

        match read_header(&path) {
            Ok(touched_at) => entries.push(SessionEntry {
                id: id.to_string(),
                touched_at,
                expired: ttl.map(|ttl| is_expired(touched_at, ttl, now)),
            }),
            Err(e) => tracing::warn!(path = %path.display(), error = %e, "Skipping unreadable session file"),
        }
    }

    entries.sort_by(|a, b| a.id.cmp(&b.id));
    Ok(entries)
}

fn show_session(
    dir: &Path,
    id: &str,
    ttl: Duration,
    crypto_key: Option<&CryptoKey>,
) -> anyhow::Result<Option<SessionData>> {
    validate_session_id(id)?;
    let path = dir.join(format!("{}.{}", id, SESSION_FILE_EXT));
    if !path.exists() {
        return Ok(None);
    }

    let bytes = std::fs::read(&path).with_context(|| format!("Cannot read {}", path.display()))?;
    let Some((touched_at, payload)) = split_header(&bytes) else {
        bail!("{} is not a session file", path.display());
    };
    if is_expired(touched_at, ttl, Utc::now().timestamp_millis()) {
        return Ok(None);
    }

    let data = decode_payload(payload, crypto_key)
        .with_context(|| format!("Cannot decode session {}", id))?;
    Ok(Some(data))
}

fn format_timestamp(ms: i64) -> String {
    DateTime::<Utc>::from_timestamp_millis(ms)
        .map(|t| t.to_rfc3339())
        .unwrap_or_else(|| ms.to_string())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level)?;

    match cli.command {
        Commands::List { dir, ttl } => {
            let entries = list_sessions(&dir, ttl.map(Duration::from_secs))?;
            for entry in &entries {
                let state = match entry.expired {
                    Some(true) => "expired",
                    Some(false) => "live",
                    None => "-",
                };
                println!("{}\t{}\t{}", entry.id, format_timestamp(entry.touched_at), state);
            }
            tracing::info!(count = entries.len(), "Listed sessions");
        }
        Commands::Show {
            dir,
            id,
            ttl,
            crypto_key,
        } => {
            let key = crypto_key
                .map(|key| CryptoKey::from_bytes(key.as_bytes()))
                .transpose()?;
            match show_session(&dir, &id, Duration::from_secs(ttl), key.as_ref())? {
                Some(data) => println!("{}", serde_json::to_string_pretty(&data)?),
                None => tracing::info!(session_id = %id, "Session not found or expired"),
            }
        }
        Commands::Gc { dir, ttl } => {
            let options = FileStorageOptions {
                ttl_hint: Some(Duration::from_secs(ttl)),
                ..Default::default()
            };
            let storage = FileStorage::with_options(&dir, options)?;
            let removed = storage.clear_expired()?;
            println!("{}", removed);
        }
        Commands::CheckConfig { file } => {
            let config = SessionConfig::load(&file)
                .with_context(|| format!("Invalid config {}", file.display()))?;
            println!(
                "OK: backend={} ttl_secs={}",
                config.storage.backend_name(),
                config.ttl_secs
            );
        }
    }

    Ok(())
}
