//! Inventory Management Engine — operator CLI.
//!
//! `engine start` boots the shard dispatcher and runs until interrupted;
//! `engine replay` and `engine inspect position` read back from the
//! snapshot store without standing up the full event pipeline, for
//! after-the-fact inspection during an incident.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use ims_engine::config::EngineConfig;
use ims_engine::ids::{BookId, SecurityId};
use ims_engine::publisher::{Publisher, PublisherConfig};
use ims_engine::shard::{ShardActor, ShardDispatcher};
use ims_engine::snapshot::SnapshotStore;
use ims_engine::telemetry::metrics;

#[derive(Parser, Debug)]
#[command(name = "engine")]
#[command(about = "Position-and-inventory calculation engine")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Boot the shard dispatcher and run until interrupted.
    Start {
        #[arg(long)]
        shards: Option<usize>,
        #[arg(long)]
        snapshot_dir: Option<PathBuf>,
    },
    /// Summarize a shard's snapshot history up to (and including) a sequence.
    Replay {
        #[arg(long)]
        shard: usize,
        #[arg(long)]
        from: u64,
        #[arg(long)]
        snapshot_dir: Option<PathBuf>,
    },
    /// Inspect a single position from the latest on-disk snapshot.
    Inspect {
        #[command(subcommand)]
        target: InspectTarget,
    },
}

#[derive(Subcommand, Debug)]
enum InspectTarget {
    Position {
        #[arg(long)]
        book: String,
        #[arg(long)]
        security: String,
        #[arg(long)]
        date: chrono::NaiveDate,
        #[arg(long)]
        shard: usize,
        #[arg(long)]
        snapshot_dir: Option<PathBuf>,
    },
}

/// Exit codes per the operator CLI contract: 0 ok, 1 config error, 2 I/O
/// fatal, 3 invariant violation.
const EXIT_OK: u8 = 0;
const EXIT_CONFIG_ERROR: u8 = 1;
const EXIT_IO_FATAL: u8 = 2;
const EXIT_INVARIANT_VIOLATION: u8 = 3;

fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();

    let mut config = match EngineConfig::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("config error: {e:#}");
            return ExitCode::from(EXIT_CONFIG_ERROR);
        }
    };

    let result = match cli.command {
        Command::Start { shards, snapshot_dir } => {
            if let Some(n) = shards {
                if !n.is_power_of_two() {
                    eprintln!("config error: --shards must be a power of two");
                    return ExitCode::from(EXIT_CONFIG_ERROR);
                }
                config.shard_count = n;
            }
            if let Some(dir) = snapshot_dir {
                config.snapshot_dir = dir;
            }
            run_start(config)
        }
        Command::Replay { shard, from, snapshot_dir } => {
            if let Some(dir) = snapshot_dir {
                config.snapshot_dir = dir;
            }
            run_replay(&config, shard, from)
        }
        Command::Inspect {
            target: InspectTarget::Position { book, security, date, shard, snapshot_dir },
        } => {
            if let Some(dir) = snapshot_dir {
                config.snapshot_dir = dir;
            }
            run_inspect_position(&config, shard, &book, &security, date)
        }
    };

    match result {
        Ok(()) => ExitCode::from(EXIT_OK),
        Err(e) => {
            warn!(error = %e, "command failed");
            match e.downcast_ref::<std::io::Error>() {
                Some(_) => ExitCode::from(EXIT_IO_FATAL),
                None => ExitCode::from(EXIT_INVARIANT_VIOLATION),
            }
        }
    }
}

/// Boots the full dispatcher + per-shard actor set and blocks on Ctrl-C.
/// Ingest adapters and the RPC edge that feed this pipeline are external
/// collaborators; this command only owns the shard loop itself.
fn run_start(config: EngineConfig) -> Result<()> {
    let runtime = tokio::runtime::Runtime::new().context("failed to start tokio runtime")?;
    runtime.block_on(async move {
        if let Err(e) = metrics::install_recorder() {
            warn!(error = %e, "prometheus recorder not installed, continuing without metrics export");
        }
        info!(shards = config.shard_count, "engine starting");

        let config = Arc::new(config);
        let (dispatcher, bulk_rxs, priority_rxs) =
            ShardDispatcher::new(config.shard_count, config.shard_queue_capacity);

        let mut handles = Vec::with_capacity(config.shard_count);
        for (id, (bulk_rx, priority_rx)) in bulk_rxs.into_iter().zip(priority_rxs).enumerate() {
            let actor = ShardActor::new(id, config.clone());
            let (publisher, _rx) = Publisher::new(PublisherConfig {
                batch_size: config.publisher_batch_size,
                flush_interval: config.publisher_flush_interval,
            });
            handles.push(tokio::spawn(actor.run(bulk_rx, priority_rx, publisher)));
        }

        // Kept alive for the process lifetime so ingest adapters wired in by
        // the operator's deployment have somewhere to send into; this
        // binary's job ends at "shard loops are running".
        let dispatcher = dispatcher;

        tokio::signal::ctrl_c().await.context("failed to listen for ctrl-c")?;
        info!("shutdown signal received, draining shards");
        drop(dispatcher);
        for handle in handles {
            let _ = handle.await;
        }
        Ok(())
    })
}

fn run_replay(config: &EngineConfig, shard: usize, from: u64) -> Result<()> {
    let store = SnapshotStore::new(&config.snapshot_dir);
    let manifest = store
        .latest_manifest(shard)
        .context("failed to scan snapshot directory")?
        .filter(|m| m.sequence <= from)
        .with_context(|| format!("no snapshot at or before sequence {from} for shard {shard}"))?;

    let snapshot = store
        .load(shard, manifest.sequence)
        .with_context(|| format!("failed to load snapshot {} for shard {shard}", manifest.sequence))?;

    println!(
        "shard {shard}: snapshot at sequence {} ({} events since prior), state_hash={:#x}",
        manifest.sequence, manifest.event_count, manifest.state_hash
    );
    println!("  positions:           {}", snapshot.positions.len());
    println!("  inventory entries:   {}", snapshot.inventory.len());
    println!("  client limits:       {}", snapshot.client_limits.len());
    println!("  au limits:           {}", snapshot.au_limits.len());
    println!("  locate reservations: {}", snapshot.locate_reservations.len());
    println!(
        "replay target sequence {from} requested; caller is responsible for re-applying the \
         journal from sequence {} through {from}",
        manifest.sequence
    );
    Ok(())
}

fn run_inspect_position(
    config: &EngineConfig,
    shard: usize,
    book: &str,
    security: &str,
    date: chrono::NaiveDate,
) -> Result<()> {
    let store = SnapshotStore::new(&config.snapshot_dir);
    let manifest = store
        .latest_manifest(shard)
        .context("failed to scan snapshot directory")?
        .with_context(|| format!("no snapshot available for shard {shard}"))?;
    let snapshot = store
        .load(shard, manifest.sequence)
        .with_context(|| format!("failed to load snapshot {} for shard {shard}", manifest.sequence))?;

    let book_id = BookId::from(book);
    let security_id = SecurityId::from(security);
    let found = snapshot.positions.iter().find(|p| {
        p.key.book_id == book_id && p.key.security_id == security_id && p.key.business_date == date
    });

    match found {
        Some(p) => {
            println!("position {book}/{security}/{date} (as of snapshot seq {}):", manifest.sequence);
            println!("  contractual_qty: {}", p.contractual_qty);
            println!("  settled_qty:     {}", p.settled_qty);
            println!("  current_net:     {}", p.current_net_position());
            println!("  sd_deliver:      {:?}", p.sd_deliver);
            println!("  sd_receipt:      {:?}", p.sd_receipt);
            println!("  beyond_deliver:  {}", p.beyond_ladder_deliver);
            println!("  beyond_receipt:  {}", p.beyond_ladder_receipt);
            println!("  status:          {:?}", p.status);
            println!("  version:         {}", p.version);
            Ok(())
        }
        None => anyhow::bail!("no position found for {book}/{security}/{date} in shard {shard}"),
    }
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ims_engine=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
