//! # Record Sync CLI (`recsync`)
//!
//! ## Usage
//!
//! ```bash
//! recsync --config ./config/recsync.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `recsync init` | Create the SQLite database and schema |
//! | `recsync sources` | List configured sources with health and last sync |
//! | `recsync sync <source>` | Sync one source, a source type, or `all` |
//! | `recsync get <id>` | Show a record with its relationships |
//! | `recsync list` | List records, optionally filtered |
//! | `recsync members <id>` | List a collection's members in order |
//! | `recsync checkpoint show <source>` | Show a source's checkpoint |
//! | `recsync checkpoint reset <source>` | Forget a source's checkpoint |
//! | `recsync embed pending` | Backfill missing embeddings |
//!
//! Set `RUST_LOG` (e.g. `RUST_LOG=record_sync=debug`) for diagnostics on
//! stderr.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use record_sync::get::ListArgs;
use record_sync::ingest::SyncOverrides;
use record_sync::{config, embed_cmd, get, ingest, migrate, sources};

/// Record Sync CLI: a local-first document store kept in sync with
/// external sources.
#[derive(Parser)]
#[command(
    name = "recsync",
    about = "Record Sync: a local-first document store kept in sync with external sources",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/recsync.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Safe to run repeatedly.
    Init,

    /// List configured sources, their health, and when they last synced.
    Sources,

    /// Sync from external sources.
    ///
    /// Source format: `all`, `<type>`, or `<type>:<name>`.
    Sync {
        /// Source selector, e.g. `all`, `filesystem`, `filesystem:notes`.
        source: String,

        /// Ignore the checkpoint and rescan everything.
        #[arg(long)]
        full: bool,

        /// With `--full`, tombstone records the source no longer reports.
        #[arg(long)]
        detect_deletions: bool,

        /// Override `[sync].batch_size`.
        #[arg(long)]
        batch_size: Option<usize>,

        /// Print results as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Show a record by id.
    Get {
        id: String,
    },

    /// List records.
    List {
        /// Only records from this source (`<type>:<name>`).
        #[arg(long)]
        source: Option<String>,

        #[arg(long)]
        tag: Option<String>,

        /// Include tombstoned records.
        #[arg(long)]
        include_deleted: bool,

        #[arg(long)]
        limit: Option<usize>,
    },

    /// List the members of a collection in order.
    Members {
        /// Collection header id.
        header_id: String,
    },

    /// Inspect or reset sync checkpoints.
    Checkpoint {
        #[command(subcommand)]
        action: CheckpointAction,
    },

    /// Manage embedding vectors.
    Embed {
        #[command(subcommand)]
        action: EmbedAction,
    },
}

#[derive(Subcommand)]
enum CheckpointAction {
    /// Print the stored checkpoint for a source.
    Show {
        /// `<type>:<name>`
        source: String,
    },
    /// Delete the checkpoint; the next sync rescans from scratch.
    Reset {
        /// `<type>:<name>`
        source: String,
    },
}

#[derive(Subcommand)]
enum EmbedAction {
    /// Embed records that have no vector yet.
    Pending {
        /// Maximum number of records to embed in this run.
        #[arg(long)]
        limit: Option<usize>,

        /// Override the batch size from config (texts per API call).
        #[arg(long)]
        batch_size: Option<usize>,

        /// Show counts without performing any embedding.
        #[arg(long)]
        dry_run: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Sources => {
            sources::list_sources(&cfg).await?;
        }
        Commands::Sync {
            source,
            full,
            detect_deletions,
            batch_size,
            json,
        } => {
            let overrides = SyncOverrides {
                full,
                detect_deletions,
                batch_size,
            };
            ingest::run_sync(&cfg, &source, overrides, json).await?;
        }
        Commands::Get { id } => {
            get::run_get(&cfg, &id).await?;
        }
        Commands::List {
            source,
            tag,
            include_deleted,
            limit,
        } => {
            let args = ListArgs {
                source,
                tag,
                include_deleted,
                limit,
            };
            get::run_list(&cfg, &args).await?;
        }
        Commands::Members { header_id } => {
            get::run_members(&cfg, &header_id).await?;
        }
        Commands::Checkpoint { action } => match action {
            CheckpointAction::Show { source } => {
                sources::run_checkpoint_show(&cfg, &source).await?;
            }
            CheckpointAction::Reset { source } => {
                sources::run_checkpoint_reset(&cfg, &source).await?;
            }
        },
        Commands::Embed { action } => match action {
            EmbedAction::Pending {
                limit,
                batch_size,
                dry_run,
            } => {
                embed_cmd::run_embed_pending(&cfg, limit, batch_size, dry_run).await?;
            }
        },
    }

    Ok(())
}
