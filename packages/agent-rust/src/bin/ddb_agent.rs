//! Deduplication media agent binary.
//!
//! The catalog and chunk bytes live in memory for the life of the process.
//! `--index-backend redb` persists partition indexes only; on restart they
//! describe archive files the fresh catalog no longer knows.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use ddb_agent::catalog::InMemoryCatalog;
use ddb_agent::chunk_store::MemoryChunkStore;
use ddb_agent::config::{AgentConfig, ConfigHandle};
use ddb_agent::index::{IndexFactory, MemoryIndexFactory};
use ddb_agent::{MaintenanceScheduler, MediaAgent, ShutdownController};
use ddb_core::SystemClock;
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum IndexBackend {
    Memory,
    Redb,
}

/// Runs one media agent: its partition indexes and the maintenance scheduler.
#[derive(Parser, Debug)]
#[command(name = "ddb-agent")]
#[command(version, about, long_about = None)]
struct Args {
    /// JSON configuration file
    #[arg(short, long, env = "DDB_CONFIG")]
    config: Option<PathBuf>,

    /// Media agent name, overriding the configuration file
    #[arg(long, env = "DDB_MEDIA_AGENT")]
    media_agent: Option<String>,

    /// Operator override in `KEY=VALUE` form; may be repeated
    #[arg(long = "set", value_name = "KEY=VALUE")]
    overrides: Vec<String>,

    /// Name of the store to create at startup
    #[arg(long, default_value = "ddb")]
    store_name: String,

    /// Partition path of the startup store; may be repeated
    #[arg(long = "partition", value_name = "PATH")]
    partitions: Vec<String>,

    /// Directory holding one subdirectory per partition, used when no
    /// `--partition` is given
    #[arg(long, env = "DDB_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Partitions to lay out under `--data-dir`
    #[arg(long, default_value_t = 1)]
    partition_count: usize,

    /// Partition index storage; the catalog is always in memory
    #[arg(long, value_enum, default_value_t = IndexBackend::Memory)]
    index_backend: IndexBackend,

    #[arg(long, value_enum, env = "DDB_LOG_FORMAT", default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Serve Prometheus metrics on this address
    #[arg(long, env = "DDB_METRICS_ADDR")]
    metrics_addr: Option<SocketAddr>,

    /// Seconds to wait for a running maintenance tick on shutdown
    #[arg(long, default_value_t = 60)]
    drain_timeout_secs: u64,
}

fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info".into());
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
    }
}

fn partition_paths(args: &Args) -> Vec<String> {
    if !args.partitions.is_empty() {
        return args.partitions.clone();
    }
    let Some(root) = &args.data_dir else {
        return Vec::new();
    };
    (0..args.partition_count)
        .map(|i| {
            root.join(&args.store_name)
                .join(format!("p{i}"))
                .display()
                .to_string()
        })
        .collect()
}

#[cfg(feature = "redb")]
fn index_factory(backend: IndexBackend, paths: &[String]) -> Result<Arc<dyn IndexFactory>> {
    match backend {
        IndexBackend::Memory => Ok(Arc::new(MemoryIndexFactory::new())),
        IndexBackend::Redb => {
            for path in paths {
                std::fs::create_dir_all(path)
                    .with_context(|| format!("creating partition directory {path}"))?;
            }
            Ok(Arc::new(ddb_agent::index::RedbIndexFactory::new()))
        }
    }
}

#[cfg(not(feature = "redb"))]
fn index_factory(backend: IndexBackend, _paths: &[String]) -> Result<Arc<dyn IndexFactory>> {
    match backend {
        IndexBackend::Memory => Ok(Arc::new(MemoryIndexFactory::new())),
        IndexBackend::Redb => anyhow::bail!("built without the redb feature"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.log_format);
    tracing::info!("ddb-agent v{}", env!("CARGO_PKG_VERSION"));

    let mut base = match &args.config {
        Some(path) => AgentConfig::from_file(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => AgentConfig::default(),
    };
    if let Some(name) = &args.media_agent {
        base.media_agent.clone_from(name);
    }
    let config = Arc::new(ConfigHandle::new(base));
    for entry in &args.overrides {
        let (key, value) = entry
            .split_once('=')
            .with_context(|| format!("override {entry:?} is not KEY=VALUE"))?;
        config
            .apply_override(key.trim(), value)
            .with_context(|| format!("applying override {key}"))?;
    }

    if let Some(addr) = args.metrics_addr {
        PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .context("installing Prometheus exporter")?;
        tracing::info!(%addr, "Prometheus metrics listening");
    }

    let partitions = partition_paths(&args);
    if args.index_backend == IndexBackend::Redb {
        tracing::warn!("redb index backend selected with an in-memory catalog");
    }
    let factory = index_factory(args.index_backend, &partitions)?;
    let agent = Arc::new(MediaAgent::new(
        Arc::clone(&config),
        Arc::new(InMemoryCatalog::new()),
        Arc::new(MemoryChunkStore::new()),
        factory,
        Arc::new(SystemClock),
    ));

    if !partitions.is_empty() {
        let store = agent
            .create_store(&args.store_name, &partitions)
            .await
            .context("creating startup store")?;
        tracing::info!(store_id = %store.id, name = %store.name, "startup store ready");
    }

    let scheduler = Arc::new(MaintenanceScheduler::new(
        Arc::clone(&agent),
        Arc::new(ShutdownController::new()),
    ));
    scheduler.start();

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    tracing::info!("shutdown requested");
    if !scheduler
        .shutdown(Duration::from_secs(args.drain_timeout_secs))
        .await
    {
        tracing::warn!("maintenance tick was aborted during shutdown");
    }
    Ok(())
}
