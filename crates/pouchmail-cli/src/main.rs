//! Pouchmail CLI
//!
//! Thin command-line wiring around the sync core: sync a category, inspect
//! the cache, download and manage attachment files. Output is JSON for
//! programmatic use.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use pouchmail_core::attachments::MessagePart;
use pouchmail_core::auth::{CredentialBroker, GoogleIdentity};
use pouchmail_core::cache::{create_backend, RecordStore};
use pouchmail_core::http::ReqwestFetch;
use pouchmail_core::sync::SyncEngine;
use pouchmail_core::transfer::{DirKind, TransferManager};
use pouchmail_core::Config;

#[derive(Parser)]
#[command(name = "pouchmail")]
#[command(about = "Pouchmail - Gmail sync and local cache core", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch a record collection and merge it into the local cache
    Sync {
        /// Category (folder/label) to cache under
        category: String,
        /// Collection URL to fetch
        url: String,
    },
    /// Show the cached collection for a category
    Show {
        category: String,
    },
    /// Show when a category was last written, ignoring TTL
    Status {
        category: String,
    },
    /// Remove every cached collection
    ClearCache,
    /// Download a file into the downloads directory
    Download {
        url: String,
        filename: String,
        /// Expected MIME type
        #[arg(long, default_value = "")]
        mime: String,
    },
    /// Open a downloaded file in the platform viewer
    Open {
        filename: String,
        #[arg(long, default_value = "")]
        mime: String,
    },
    /// Delete a downloaded file
    Delete {
        filename: String,
    },
    /// Fetch every attachment of a message into private storage
    Attachments {
        /// Remote message id
        message_id: String,
        /// Path to a JSON file holding the message part structure
        structure: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::load()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| {
                    tracing_subscriber::EnvFilter::new(&config.general.log_level)
                }),
        )
        .with_writer(std::io::stderr)
        .init();

    let backend = create_backend(&config)?;
    let store = Arc::new(RecordStore::new(backend, &config.cache));
    let broker = Arc::new(CredentialBroker::new(Arc::new(GoogleIdentity::new(&config))));
    let engine = SyncEngine::new(broker.clone(), store.clone(), Arc::new(ReqwestFetch::new()));
    let transfer = TransferManager::new(&config);

    match cli.command {
        Commands::Sync { category, url } => {
            let records = engine.sync_category(&category, &url).await?;
            println!("{}", serde_json::to_string_pretty(&records)?);
        }
        Commands::Show { category } => match store.get(&category).await {
            Some(records) => println!("{}", serde_json::to_string_pretty(&records)?),
            None => println!("null"),
        },
        Commands::Status { category } => match engine.last_synced(&category).await {
            Some(written) => println!("{{\"last_synced\":\"{}\"}}", written.to_rfc3339()),
            None => println!("{{\"last_synced\":null}}"),
        },
        Commands::ClearCache => {
            store.clear_all().await?;
            info!("Cache cleared");
        }
        Commands::Download { url, filename, mime } => {
            let token = broker.get_access_token().await?;
            let headers = vec![("Authorization".to_string(), format!("Bearer {}", token))];
            let path = transfer
                .download(&url, &filename, &mime, &headers, print_progress)
                .await?;
            eprintln!();
            println!("{}", path.display());
        }
        Commands::Open { filename, mime } => {
            let (path, exists) = transfer.check_exists(&filename);
            if !exists {
                anyhow::bail!("file no longer available: {}", path.display());
            }
            transfer.open(&path, &mime).await?;
        }
        Commands::Delete { filename } => {
            let deleted = transfer.delete(&filename).await;
            println!("{{\"deleted\":{}}}", deleted);
        }
        Commands::Attachments { message_id, structure } => {
            let contents = std::fs::read_to_string(&structure)
                .with_context(|| format!("reading {}", structure.display()))?;
            let part: MessagePart = serde_json::from_str(&contents)?;

            let (descriptors, ok) = engine.fetch_attachments(&message_id, &part).await;
            if !ok {
                anyhow::bail!("message has no attachments");
            }

            transfer.ensure_directory(DirKind::Private)?;
            let mut saved = Vec::new();
            for descriptor in &descriptors {
                if let Some(data) = &descriptor.data {
                    let path = transfer
                        .save_attachment_data(data, &descriptor.filename)
                        .await?;
                    saved.push(path.display().to_string());
                } else {
                    eprintln!("fetch failed for {}", descriptor.filename);
                }
            }
            println!("{}", serde_json::to_string_pretty(&saved)?);
        }
    }

    Ok(())
}

fn print_progress(percent: u8) {
    eprint!("\r{:>3}%", percent);
    let _ = std::io::stderr().flush();
}
