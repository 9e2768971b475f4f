//! Nimbus CLI
//!
//! Data and maintenance commands for a Nimbus deployment: put/get/delete
//! against the replicated store, the latency ranking pass, and the
//! garbage collector's targeted and batch modes.

use anyhow::{Context, Result, bail};
use bytes::Bytes;
use clap::{Parser, Subcommand};
use nimbus_common::{BackendId, ClientId, Config, Error};
use nimbus_meta::{LocalMetadataService, MetadataService};
use nimbus_replication::{GarbageCollector, GcReport, ReplicationEngine};
use nimbus_store::BackendPool;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "nimbus")]
#[command(about = "Nimbus replicated key/value store")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/nimbus/nimbus.toml")]
    config: String,

    /// Skip the latency ranking pass and keep configuration order
    #[arg(long)]
    no_rank: bool,

    /// Log level
    #[arg(long, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Store a value under a key
    Put {
        /// Logical key
        key: String,
        /// Value bytes (UTF-8); use --file for binary data
        value: Option<String>,
        /// Read the value from a file instead
        #[arg(short, long, conflicts_with = "value")]
        file: Option<PathBuf>,
    },
    /// Fetch the current value of a key
    Get {
        /// Logical key
        key: String,
        /// Write the value to a file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Remove the published version of a key
    Delete {
        /// Logical key
        key: String,
    },
    /// List all published keys
    List,
    /// Benchmark the backends and print the resulting ranking
    Rank,
    /// Collect stale and orphaned versions of one key
    Gc {
        /// Logical key
        key: String,
    },
    /// Collect all marked versions, then sweep unreferenced blobs
    BatchGc,
    /// Delete every blob on one backend (destructive)
    EmptyContainer {
        /// Backend id from the configuration
        backend: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| args.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cfg: Config = config::Config::builder()
        .add_source(config::File::with_name(&args.config))
        .build()
        .with_context(|| format!("cannot read configuration '{}'", args.config))?
        .try_deserialize()
        .context("invalid configuration")?;

    if cfg.backends.is_empty() {
        bail!("no backends configured");
    }

    let pool = Arc::new(
        BackendPool::from_config(&cfg)
            .await
            .context("cannot initialize backends")?,
    );
    let meta: Arc<dyn MetadataService> = Arc::new(
        LocalMetadataService::open(&cfg.metadata.path)
            .with_context(|| format!("cannot open metadata store {:?}", cfg.metadata.path))?,
    );

    // The ranking pass decides which backends a write prefers; commands
    // that only follow existing records can skip it.
    let needs_ranking = matches!(args.command, Commands::Put { .. } | Commands::Rank);
    if needs_ranking && !args.no_rank {
        info!("benchmarking backends...");
        pool.rank(cfg.ranking.sample_size).await;
    }

    let client_id = match &cfg.client_id {
        Some(id) => ClientId::new(id.clone()).context("invalid client_id in configuration")?,
        None => ClientId::generate(),
    };
    let engine = ReplicationEngine::new(
        Arc::clone(&pool),
        Arc::clone(&meta),
        client_id,
        cfg.replication.clone(),
    );
    let gc = GarbageCollector::new(Arc::clone(&pool), Arc::clone(&meta));

    match args.command {
        Commands::Put { key, value, file } => {
            let data = match (value, file) {
                (Some(value), None) => Bytes::from(value.into_bytes()),
                (None, Some(path)) => Bytes::from(
                    std::fs::read(&path)
                        .with_context(|| format!("cannot read {}", path.display()))?,
                ),
                _ => bail!("provide a value argument or --file"),
            };
            let version = engine.put(&key, data).await?;
            println!("published '{key}' at version {version}");
        }
        Commands::Get { key, output } => match engine.get(&key).await {
            Ok(Some(data)) => {
                if let Some(path) = output {
                    std::fs::write(&path, &data)
                        .with_context(|| format!("cannot write {}", path.display()))?;
                    println!("wrote {} bytes to {}", data.len(), path.display());
                } else {
                    println!("{}", String::from_utf8_lossy(&data));
                }
            }
            Ok(None) => {
                eprintln!("'{key}' not found");
                std::process::exit(1);
            }
            Err(e @ Error::ReadUnavailable { .. }) => {
                bail!("{e} (data may be lost or backends are down)")
            }
            Err(e) => return Err(e.into()),
        },
        Commands::Delete { key } => {
            if engine.delete(&key).await? {
                println!("deleted '{key}' (run gc to reclaim backend copies)");
            } else {
                println!("'{key}' had no published version");
            }
        }
        Commands::List => {
            let mut keys = engine.list().await?;
            keys.sort();
            for key in keys {
                println!("{key}");
            }
        }
        Commands::Rank => {
            println!("{:<16} {:>8} {:>12} {:>12} {:>6}", "backend", "enabled", "write", "read", "cost");
            for p in pool.ranking() {
                println!(
                    "{:<16} {:>8} {:>12} {:>12} {:>6}",
                    p.id.to_string(),
                    p.enabled,
                    format!("{:?}", p.write_latency),
                    format!("{:?}", p.read_latency),
                    p.cost
                );
            }
        }
        Commands::Gc { key } => {
            let report = gc.gc(&key).await?;
            print_report(&report);
        }
        Commands::BatchGc => {
            let report = gc.batch_gc().await?;
            print_report(&report);
        }
        Commands::EmptyContainer { backend } => {
            let id = BackendId::new(backend);
            let Some(store) = pool.store(&id) else {
                bail!("unknown backend '{id}'");
            };
            let deleted = pool.empty_container(store.as_ref()).await?;
            println!("deleted {deleted} blobs from {id}");
        }
    }

    Ok(())
}

fn print_report(report: &GcReport) {
    println!(
        "{} blobs deleted, {} markers removed, {} unreferenced swept, {} failures",
        report.blobs_deleted,
        report.markers_removed,
        report.unreferenced_deleted,
        report.failures
    );
}
