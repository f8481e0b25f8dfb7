//! # vcon-sync CLI
//!
//! The `vcon-sync` binary loads vCon conversation records from a local
//! directory or a date-partitioned S3 bucket into a SQLite store.
//!
//! ## Usage
//!
//! ```bash
//! vcon-sync --config ./config/vcon-sync.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `vcon-sync init` | Create the SQLite database and run schema migrations |
//! | `vcon-sync sync [DIR]` | Ingest vCons from DIR, or from the configured source |
//! | `vcon-sync stats` | Show row counts and the last ingestion time |
//!
//! ## Examples
//!
//! ```bash
//! # Load everything under a local directory
//! vcon-sync sync ./exports
//!
//! # Load the last 6 hours of an S3 archive
//! vcon-sync sync --hours 6
//!
//! # Keep syncing every 5 minutes until interrupted
//! vcon-sync sync --continuous --interval 300
//! ```
//!
//! Logging goes to stderr and is controlled by `RUST_LOG` (default `info`).

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use vcon_sync::ingest::SyncArgs;
use vcon_sync::progress::ProgressMode;
use vcon_sync::{config, db, ingest, migrate, stats};

/// vcon-sync: bulk ingestion and continuous sync of vCon records.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/vcon-sync.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "vcon-sync",
    about = "Bulk ingestion and continuous sync of vCon conversation records",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/vcon-sync.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Creates the SQLite database file and the vcons, parties, dialog,
    /// analysis and attachments tables. Safe to run repeatedly.
    Init,

    /// Ingest vCons.
    ///
    /// With DIR, walks that directory. Otherwise uses `[source.s3]`, falling
    /// back to `[source.local]`.
    Sync {
        /// Local directory to load instead of the configured source.
        dir: Option<PathBuf>,

        /// Records per batch.
        #[arg(long)]
        batch_size: Option<usize>,

        /// Batches run at the same time.
        #[arg(long)]
        concurrency: Option<usize>,

        /// Attempts per record write.
        #[arg(long)]
        retry_attempts: Option<u32>,

        /// Base retry delay in milliseconds.
        #[arg(long)]
        retry_delay_ms: Option<u64>,

        /// Lookback window in hours for S3 listings.
        #[arg(long)]
        hours: Option<u32>,

        /// Override the S3 key prefix.
        #[arg(long)]
        prefix: Option<String>,

        /// Parse, normalize and validate without writing.
        #[arg(long)]
        dry_run: bool,

        /// Keep syncing until interrupted.
        #[arg(long)]
        continuous: bool,

        /// Seconds between continuous sync cycles.
        #[arg(long)]
        interval: Option<u64>,

        /// Do not consult or update the dedup tracker.
        #[arg(long)]
        no_dedup: bool,

        /// Progress output on stderr. Defaults to human on a TTY, off otherwise.
        #[arg(long, value_enum)]
        progress: Option<ProgressArg>,
    },

    /// Show store statistics.
    Stats,
}

#[derive(Clone, Copy, ValueEnum)]
enum ProgressArg {
    Off,
    Human,
    Json,
}

impl From<ProgressArg> for ProgressMode {
    fn from(arg: ProgressArg) -> Self {
        match arg {
            ProgressArg::Off => ProgressMode::Off,
            ProgressArg::Human => ProgressMode::Human,
            ProgressArg::Json => ProgressMode::Json,
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing();

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            let pool = db::connect(&cfg.db).await?;
            migrate::run_migrations(&pool).await?;
            pool.close().await;
            println!("Database initialized successfully.");
        }
        Commands::Sync {
            dir,
            batch_size,
            concurrency,
            retry_attempts,
            retry_delay_ms,
            hours,
            prefix,
            dry_run,
            continuous,
            interval,
            no_dedup,
            progress,
        } => {
            let args = SyncArgs {
                dir,
                batch_size,
                concurrency,
                retry_attempts,
                retry_delay_ms,
                hours,
                prefix,
                dry_run,
                continuous,
                interval_secs: interval,
                no_dedup,
                progress: progress
                    .map(ProgressMode::from)
                    .unwrap_or_else(ProgressMode::default_for_tty),
            };
            ingest::run_sync(&cfg, args).await?;
        }
        Commands::Stats => {
            stats::run_stats(&cfg).await?;
        }
    }

    Ok(())
}
