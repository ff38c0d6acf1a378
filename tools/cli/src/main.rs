//! offsync - operator tool for an offline sync data directory.
//!
//! Inspects the persisted offline queue and conflict store, and performs
//! the manual interventions the engine leaves to a human: requeueing or
//! discarding failed records, resolving conflicts and compacting the log.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use offsync_common::{ConflictId, RecordId};
use offsync_storage::{FileLog, LogStore};
use offsync_sync::{
    ConflictResolution, ConflictResolver, ConflictStore, EventBus, OfflineQueue, RecordStatus,
    ResolutionOutcome, SyncConfig, SyncRecord,
};

#[derive(Parser)]
#[command(name = "offsync")]
#[command(about = "Inspect and repair an offline sync queue")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,

    /// Directory holding the queue and conflict logs.
    #[arg(short, long)]
    data_dir: PathBuf,

    /// Sync configuration file (JSON).
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show record counts by status and open conflicts.
    Status,

    /// List queued records.
    List {
        /// Only show records in this status (pending, in-progress, failed, ...).
        #[arg(short, long)]
        status: Option<RecordStatus>,

        /// Print records as JSON.
        #[arg(long)]
        json: bool,
    },

    /// List unresolved conflicts.
    Conflicts {
        /// Print conflicts as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Return a FAILED record to PENDING with a fresh retry budget.
    Requeue {
        /// Record id.
        id: RecordId,
    },

    /// Drop a record from the queue. Conflicted records are cleared with `resolve`.
    Discard {
        /// Record id.
        id: RecordId,
    },

    /// Resolve a conflict.
    Resolve {
        /// Conflict id.
        id: ConflictId,

        /// "server-wins", "client-wins" or "merge". Defaults to the configured strategy.
        #[arg(short, long)]
        strategy: Option<ConflictResolution>,

        /// Resolve with the contents of this file instead of a strategy.
        #[arg(short, long, conflicts_with = "strategy")]
        payload: Option<PathBuf>,
    },

    /// Rewrite the queue log to one entry per live record.
    Compact,
}

/// Queue and conflict store opened over a data directory.
struct Workspace {
    config: SyncConfig,
    queue: Arc<OfflineQueue>,
    conflicts: Arc<ConflictStore>,
}

impl Workspace {
    async fn open(data_dir: &Path, config: Option<&Path>) -> Result<Self> {
        let config = match config {
            Some(path) => SyncConfig::load(path)
                .await
                .with_context(|| format!("Failed to load config from {}", path.display()))?,
            None => SyncConfig::default(),
        };

        let log: Arc<dyn LogStore> = Arc::new(
            FileLog::new(data_dir)
                .with_context(|| format!("Failed to open data directory {}", data_dir.display()))?,
        );
        let queue = OfflineQueue::open(log.clone())
            .await
            .context("Failed to open offline queue")?;
        let conflicts = ConflictStore::open(log)
            .await
            .context("Failed to open conflict store")?;

        Ok(Self {
            config,
            queue: Arc::new(queue),
            conflicts: Arc::new(conflicts),
        })
    }

    fn resolver(&self) -> ConflictResolver {
        ConflictResolver::new(self.conflicts.clone(), self.queue.clone(), EventBus::new())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let workspace = Workspace::open(&cli.data_dir, cli.config.as_deref()).await?;

    match cli.command {
        Commands::Status => cmd_status(&workspace),

        Commands::List { status, json } => cmd_list(&workspace, status, json),

        Commands::Conflicts { json } => cmd_conflicts(&workspace, json),

        Commands::Requeue { id } => cmd_requeue(&workspace, &id).await,

        Commands::Discard { id } => cmd_discard(&workspace, &id).await,

        Commands::Resolve {
            id,
            strategy,
            payload,
        } => cmd_resolve(&workspace, &id, strategy, payload.as_deref()).await,

        Commands::Compact => cmd_compact(&workspace).await,
    }
}

/// Render a payload for terminal output.
fn preview(bytes: &[u8]) -> String {
    const MAX: usize = 60;
    let text = String::from_utf8_lossy(bytes);
    if text.chars().count() > MAX {
        format!("{}...", text.chars().take(MAX).collect::<String>())
    } else {
        text.into_owned()
    }
}

fn print_record(record: &SyncRecord) {
    println!(
        "{}  #{:<5} {:<11} {:<6} {}",
        record.id, record.seq, record.status, record.operation, record.entity
    );
    println!(
        "    created {}  retries {}{}",
        record.timestamp.format("%Y-%m-%d %H:%M:%S"),
        record.retry_count,
        if record.forced { "  (forced)" } else { "" }
    );
    if let Some(error) = &record.last_error {
        println!("    last error: {}", error);
    }
}

fn cmd_status(workspace: &Workspace) -> Result<()> {
    let counts = workspace.queue.counts();

    println!("Queued records: {}", workspace.queue.len());
    for status in [
        RecordStatus::Pending,
        RecordStatus::InProgress,
        RecordStatus::Failed,
        RecordStatus::Conflict,
    ] {
        println!(
            "  {:<11} {}",
            status,
            counts.get(&status).copied().unwrap_or(0)
        );
    }
    println!("Open conflicts: {}", workspace.conflicts.len());
    println!(
        "Default strategy: {}",
        workspace.config.conflict_resolution
    );

    Ok(())
}

fn cmd_list(workspace: &Workspace, status: Option<RecordStatus>, json: bool) -> Result<()> {
    let records = workspace.queue.list(status);

    if json {
        println!("{}", serde_json::to_string_pretty(&records)?);
        return Ok(());
    }

    if records.is_empty() {
        println!("(no records)");
        return Ok(());
    }
    for record in &records {
        print_record(record);
    }

    Ok(())
}

fn cmd_conflicts(workspace: &Workspace, json: bool) -> Result<()> {
    let conflicts = workspace.conflicts.list();

    if json {
        println!("{}", serde_json::to_string_pretty(&conflicts)?);
        return Ok(());
    }

    if conflicts.is_empty() {
        println!("(no conflicts)");
        return Ok(());
    }
    for conflict in &conflicts {
        println!(
            "{}  {} {}  detected {}",
            conflict.id,
            conflict.operation,
            conflict.entity,
            conflict.timestamp.format("%Y-%m-%d %H:%M:%S")
        );
        println!("    local:  {}", preview(&conflict.local_data));
        println!("    server: {}", preview(&conflict.server_data));
    }

    Ok(())
}

async fn cmd_requeue(workspace: &Workspace, id: &RecordId) -> Result<()> {
    let record = workspace
        .queue
        .requeue(id)
        .await
        .with_context(|| format!("Failed to requeue {}", id))?;

    info!("Requeued {} for {}", record.id, record.entity);
    println!("Record {} is pending again", record.id);
    Ok(())
}

async fn cmd_discard(workspace: &Workspace, id: &RecordId) -> Result<()> {
    let record = workspace
        .queue
        .remove(id)
        .await
        .with_context(|| format!("Failed to discard {}", id))?;

    println!(
        "Discarded {} {} for {}",
        record.status, record.operation, record.entity
    );
    Ok(())
}

async fn cmd_resolve(
    workspace: &Workspace,
    id: &ConflictId,
    strategy: Option<ConflictResolution>,
    payload: Option<&Path>,
) -> Result<()> {
    let resolver = workspace.resolver();

    let outcome = match payload {
        Some(path) => {
            let merged = tokio::fs::read(path)
                .await
                .with_context(|| format!("Failed to read {}", path.display()))?;
            resolver.resolve_manually(id, merged).await
        }
        None => {
            let strategy = strategy.unwrap_or(workspace.config.conflict_resolution);
            resolver.resolve(id, strategy).await
        }
    }
    .with_context(|| format!("Failed to resolve conflict {}", id))?;

    match outcome {
        ResolutionOutcome::AcceptedRemote => {
            println!("Conflict {} resolved: server state kept", id)
        }
        ResolutionOutcome::Requeued(record) => println!(
            "Conflict {} resolved: queued {} {} as {}",
            id, record.operation, record.entity, record.id
        ),
    }
    Ok(())
}

async fn cmd_compact(workspace: &Workspace) -> Result<()> {
    let live = workspace
        .queue
        .compact()
        .await
        .context("Failed to compact queue log")?;

    println!("Queue log compacted to {} records", live);
    Ok(())
}
