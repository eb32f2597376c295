//! Custody Vault command-line front end
//!
//! Exit codes: 0 = success / chain intact, 1 = chain broken, 2 = error.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use custody_vault_lib::{
    CustodyAction, CustodyEntry, CustodyLedger, EntryDraft, EvidenceIngestor, EvidenceKey,
    EvidenceRecord, Settings, SledStore, Upload, GENESIS,
};
use custody_vault_lib::config::DEFAULT_STORAGE_TIMEOUT_MS;
use custody_vault_lib::custody::{EntryId, DEFAULT_ACTOR_TYPE};
use custody_vault_lib::ingest;

#[derive(Parser)]
#[command(
    name = "custody-vault",
    about = "Crash evidence intake with a verifiable chain of custody"
)]
struct Cli {
    /// Directory holding the custody database
    #[arg(long, env = "CUSTODY_DATA_DIR")]
    data_dir: Option<PathBuf>,
    /// Shared evidence key, 64 hex characters
    #[arg(long, env = "AES_ENCRYPTION_KEY", hide_env_values = true)]
    key: Option<String>,
    /// Upper bound on each storage call in milliseconds
    #[arg(long, env = "STORAGE_TIMEOUT_MS", default_value_t = DEFAULT_STORAGE_TIMEOUT_MS)]
    storage_timeout_ms: u64,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print a freshly generated evidence key.
    Keygen,
    /// Encrypt a JSON crash record the way an edge device does.
    Seal {
        /// Path to the plaintext JSON record.
        input: PathBuf,
        /// Output path for the encrypted blob.
        #[arg(long)]
        output: PathBuf,
        /// Also write the device's first custody entry to this path.
        #[arg(long)]
        custody_log: Option<PathBuf>,
        /// Actor named in the device custody entry.
        #[arg(long, default_value = "EDGE_DEVICE")]
        device: String,
    },
    /// Decrypt, store and record receipt of an evidence blob.
    Ingest {
        /// Path to the encrypted blob.
        blob: PathBuf,
        /// Custody entry JSON written by the collecting device.
        #[arg(long)]
        custody_log: Option<PathBuf>,
    },
    /// Append a custody entry to an event's chain.
    Append {
        event_id: String,
        /// EVIDENCE_COLLECTION, TRANSFER, STORAGE, ACCESS, VERIFICATION,
        /// MODIFICATION, EXPORT or DELETION.
        #[arg(long)]
        action: CustodyAction,
        #[arg(long)]
        actor: String,
        #[arg(long)]
        location: String,
        #[arg(long, default_value = DEFAULT_ACTOR_TYPE)]
        actor_type: String,
    },
    /// Print an event's custody chain.
    Chain { event_id: String },
    /// Verify an event's custody chain.
    Verify { event_id: String },
    /// Print stored evidence with its custody chain.
    Show { event_id: String },
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn open_store(settings: &Settings) -> Result<(Arc<SledStore>, CustodyLedger)> {
    std::fs::create_dir_all(&settings.data_dir)
        .with_context(|| format!("creating {}", settings.data_dir.display()))?;
    let store = Arc::new(
        SledStore::open(settings.data_dir.join("custody")).context("opening custody store")?,
    );
    let ledger = CustodyLedger::new(store.clone(), settings.ledger_config());
    Ok((store, ledger))
}

fn seal(
    settings: &Settings,
    input: &Path,
    output: &Path,
    custody_log: Option<&Path>,
    device: &str,
) -> Result<()> {
    let plaintext =
        std::fs::read(input).with_context(|| format!("reading {}", input.display()))?;
    let record = EvidenceRecord::from_plaintext(&plaintext)
        .with_context(|| format!("{} is not a usable crash record", input.display()))?;

    let blob = settings.cipher()?.seal(&plaintext)?;
    std::fs::write(output, &blob).with_context(|| format!("writing {}", output.display()))?;
    tracing::info!(event_id = record.event_id(), bytes = blob.len(), "Sealed evidence");

    if let Some(path) = custody_log {
        let entry = EntryDraft::new(
            record.event_id(),
            CustodyAction::EvidenceCollection,
            device,
            "EDGE",
            Utc::now(),
        )
        .with_actor_type("EDGE_DEVICE")
        .link(EntryId::FIRST, GENESIS)?;
        std::fs::write(path, serde_json::to_vec_pretty(&entry)?)
            .with_context(|| format!("writing {}", path.display()))?;
    }
    Ok(())
}

async fn ingest_blob(
    settings: &Settings,
    blob: &Path,
    custody_log: Option<&Path>,
) -> Result<()> {
    let edge_custody = custody_log
        .map(|path| -> Result<CustodyEntry> {
            let raw =
                std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
            Ok(serde_json::from_slice(&raw)?)
        })
        .transpose()?;
    let filename = blob
        .file_name()
        .and_then(|n| n.to_str())
        .map(str::to_string);
    let bytes = std::fs::read(blob).with_context(|| format!("reading {}", blob.display()))?;
    let cipher = settings.cipher()?;

    let (store, ledger) = open_store(settings)?;
    let ingestor = EvidenceIngestor::new(
        cipher,
        Arc::new(ledger),
        store.clone(),
        settings.storage_timeout,
    );
    let receipt = ingestor
        .ingest(Upload {
            blob: bytes,
            filename,
            content_type: Some("application/octet-stream".to_string()),
            edge_custody,
        })
        .await?;
    store.flush()?;
    print_json(&receipt)
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let settings = Settings::new(
        cli.data_dir.unwrap_or_else(Settings::default_data_dir),
        cli.key.as_deref(),
        cli.storage_timeout_ms,
    )?;

    match cli.command {
        Commands::Keygen => {
            println!("{}", EvidenceKey::generate().to_hex());
        }
        Commands::Seal {
            input,
            output,
            custody_log,
            device,
        } => seal(&settings, &input, &output, custody_log.as_deref(), &device)?,
        Commands::Ingest { blob, custody_log } => {
            ingest_blob(&settings, &blob, custody_log.as_deref()).await?
        }
        Commands::Append {
            event_id,
            action,
            actor,
            location,
            actor_type,
        } => {
            let (store, ledger) = open_store(&settings)?;
            let entry = ledger
                .append_entry(
                    EntryDraft::new(event_id, action, actor, location, Utc::now())
                        .with_actor_type(actor_type),
                )
                .await?;
            store.flush()?;
            print_json(&entry)?;
        }
        Commands::Chain { event_id } => {
            let (_, ledger) = open_store(&settings)?;
            print_json(&ledger.chain(&event_id).await?)?;
        }
        Commands::Verify { event_id } => {
            let (_, ledger) = open_store(&settings)?;
            let report = ledger.verify(&event_id).await?;
            print_json(&report)?;
            if !report.valid {
                return Ok(ExitCode::from(1));
            }
        }
        Commands::Show { event_id } => {
            let (store, ledger) = open_store(&settings)?;
            let bundle =
                ingest::lookup(&ledger, store.as_ref(), settings.storage_timeout, &event_id)
                    .await?;
            print_json(&bundle)?;
        }
    }
    Ok(ExitCode::SUCCESS)
}

#[tokio::main]
async fn main() -> ExitCode {
    // Initialize logging; stdout is reserved for command output
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    match run(Cli::parse()).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::from(2)
        }
    }
}
