//! Courier admin CLI - inspect and repair the outbox, DLQ and idempotency records.

mod commands;

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use courier_config_and_utils::{init_logging, Config, LogFormat, Paths};

/// Courier command-line interface.
#[derive(Parser, Debug)]
#[command(name = "courier")]
#[command(about = "Administer the Courier outbox, dead-letter queue and idempotency records")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (trace, debug, info, warn, error). Defaults to the configured level
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    /// Base directory for runtime files (config, database, logs). Defaults to ~/.courier
    #[arg(long, global = true)]
    base_dir: Option<PathBuf>,

    /// Database file. Defaults to <base-dir>/courier.sqlite
    #[arg(long, global = true, env = "COURIER_DATABASE")]
    database: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Dead-letter queue administration
    #[command(subcommand)]
    Dlq(DlqCommand),
    /// Outbox maintenance
    #[command(subcommand)]
    Outbox(OutboxCommand),
    /// Idempotency record administration
    #[command(subcommand)]
    Idempotency(IdempotencyCommand),
}

/// Filters shared by `dlq list` and `dlq count`.
#[derive(Args, Debug, Default)]
struct DlqFilterArgs {
    /// Only items of this kind (email, webhook)
    #[arg(long)]
    kind: Option<String>,

    /// Only items in this scope
    #[arg(long)]
    scope: Option<String>,

    /// Case-insensitive regex over the last error
    #[arg(long)]
    error: Option<String>,
}

#[derive(Subcommand, Debug)]
enum DlqCommand {
    /// List dead items, newest first
    List {
        #[command(flatten)]
        filter: DlqFilterArgs,

        /// Cursor from a previous page
        #[arg(long)]
        cursor: Option<String>,

        /// Page size (max 100)
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Show one dead item
    Show { id: String },
    /// Aggregate counts over the dead set
    Stats,
    /// Count dead items matching the filters
    Count {
        #[command(flatten)]
        filter: DlqFilterArgs,
    },
    /// Requeue dead items with a fresh attempt budget
    Retry {
        #[arg(required = true)]
        ids: Vec<String>,
    },
    /// Delete dead items
    Purge {
        #[arg(required = true)]
        ids: Vec<String>,
    },
}

#[derive(Subcommand, Debug)]
enum OutboxCommand {
    /// Enqueue a message given as JSON, e.g. '{"kind":"email","payload":{...}}'
    Enqueue {
        message: String,

        /// Explicit item id. Generated when omitted
        #[arg(long)]
        id: Option<String>,

        #[arg(long)]
        scope: Option<String>,
    },
    /// Return stale `delivering` items to the queue
    ReclaimLeases {
        /// Lease age in seconds. Defaults to worker.lease_timeout_secs
        #[arg(long)]
        older_than_secs: Option<u64>,
    },
    /// Delete delivered items
    PruneDelivered {
        /// Age in seconds. Defaults to worker.prune_delivered_after_secs
        #[arg(long)]
        older_than_secs: Option<u64>,
    },
    /// Requeue dead or failed items, keeping their attempt counts
    Requeue {
        #[arg(required = true)]
        ids: Vec<String>,
    },
}

#[derive(Subcommand, Debug)]
enum IdempotencyCommand {
    /// Show the stored record for a key
    Show { key: String },
    /// Delete the record for a key
    Clear { key: String },
    /// Delete expired records
    PurgeExpired,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let paths = match cli.base_dir {
        Some(base) => Paths::with_base_dir(base),
        None => Paths::new()?,
    };
    let config = Config::load(&paths)?;

    let level = cli.log_level.as_deref().unwrap_or(&config.log_level);
    init_logging(level, LogFormat::from_str(&config.log_format));

    let database = cli.database.unwrap_or_else(|| paths.database_file());
    let services = commands::Services::open(&database, &config).await?;

    let output = commands::execute(&services, &config, cli.command).await?;
    println!("{}", serde_json::to_string_pretty(&output)?);

    services.close().await?;
    Ok(())
}
