//! # Parcel Harvest CLI (`harvest`)
//!
//! ## Usage
//!
//! ```bash
//! harvest --config ./config/harvest.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `harvest init` | Create the SQLite database and all tables |
//! | `harvest sources` | List configured sources with watermark state |
//! | `harvest sync <source\|all>` | Incrementally harvest one or all sources |
//! | `harvest diagnose <source>` | Show recency metrics for candidate date fields |
//! | `harvest runs` | Show recent ingest runs |
//!
//! Logging goes to stderr and is controlled by `RUST_LOG` (default `info`).

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use parcel_harvest::ingest::{self, SyncArgs};
use parcel_harvest::{config, migrate, sources};

/// Parcel Harvest: incremental ingestion of municipal open-data datasets.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/harvest.example.toml` for a full example.
#[derive(Parser)]
#[command(name = "harvest", version, about = "Incremental open-data ingestion into SQLite")]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/harvest.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the watermark, run log, staging, and canonical tables.
    ///
    /// Idempotent.
    Init,

    /// List configured sources, their tables, and high-water marks.
    Sources,

    /// Harvest a source, or every source with `all`.
    ///
    /// Without bounds the window is the last `--days` days, never starting
    /// before the source's high-water mark. Interrupted windows resume at
    /// their last committed page.
    Sync {
        /// Source name from `[sources.<name>]`, or `all`.
        source: String,

        /// Window start (YYYY-MM-DD or RFC 3339). Disables watermark clamping.
        #[arg(long)]
        since: Option<String>,

        /// Window end, inclusive when given as YYYY-MM-DD.
        #[arg(long)]
        until: Option<String>,

        /// Days back from today when no bounds are given.
        #[arg(long)]
        days: Option<u32>,

        /// Force the cursor field instead of auto-selecting one.
        #[arg(long)]
        date_field: Option<String>,

        /// Rows per request.
        #[arg(long)]
        page_size: Option<u32>,

        /// Select a field and fetch a small sample without writing anything.
        #[arg(long)]
        dry_run: bool,

        /// Clear staging and watermarks and harvest from scratch.
        #[arg(long)]
        full: bool,
    },

    /// Probe every date-like column of a source.
    Diagnose {
        /// Source name.
        source: String,
    },

    /// Show recent ingest runs.
    Runs {
        /// Only runs of this source.
        #[arg(long)]
        source: Option<String>,

        /// Maximum number of runs to show.
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

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
            since,
            until,
            days,
            date_field,
            page_size,
            dry_run,
            full,
        } => {
            let interrupt = Arc::new(AtomicBool::new(false));
            let flag = interrupt.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    eprintln!("interrupt received, stopping after the current page");
                    flag.store(true, Ordering::SeqCst);
                }
            });

            let args = SyncArgs {
                since,
                until,
                days,
                date_field,
                page_size,
                dry_run,
                full,
            };
            ingest::run_sync(&cfg, &source, &args, interrupt).await?;
        }
        Commands::Diagnose { source } => {
            ingest::run_diagnose(&cfg, &source).await?;
        }
        Commands::Runs { source, limit } => {
            sources::list_runs(&cfg, source.as_deref(), limit).await?;
        }
    }

    Ok(())
}
