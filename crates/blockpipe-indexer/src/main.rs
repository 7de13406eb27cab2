//! blockpipe indexer
//!
//! Fetches block ranges from a JSON-RPC node through the batch caller and
//! exports blocks and transactions into Postgres.
//!
//! # Usage
//!
//! ```bash
//! # index blocks 18000000..=18000999
//! blockpipe-indexer --config indexer.toml run --from 18000000 --to 18000999
//!
//! # re-submit partitions recorded in the failure log
//! blockpipe-indexer --config indexer.toml replay ./data/failed.jsonl
//! ```
//!
//! Without a database URL records are written to an in-memory store, which
//! is useful as a dry run against a node.
//!
//! `/ready` on the metrics address returns 503 while the RPC circuit breaker
//! is open.

mod config;
mod driver;
mod mapping;

use anyhow::{Context, Result};
use blockpipe_client::{BatchCaller, CircuitState, JsonRpcUpstream};
use blockpipe_core::{PerformanceRecorder, RecordKind};
use blockpipe_export::{
    ExportPipeline, FailureLog, MemoryStore, PipelineReport, PostgresStore, RecordStore,
};
use blockpipe_observability::{create_metrics_router, ReadinessCheck};
use clap::{Parser, Subcommand};
use config::IndexerConfig;
use driver::RangeDriver;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "blockpipe-indexer")]
#[command(about = "Index blockchain data into Postgres", long_about = None)]
#[command(version)]
struct Cli {
    /// TOML configuration file
    #[arg(short, long, env = "BLOCKPIPE_CONFIG")]
    config: Option<PathBuf>,

    /// JSON-RPC endpoint (overrides the config file)
    #[arg(long, env = "BLOCKPIPE_RPC_URL")]
    rpc_url: Option<String>,

    /// Postgres URL (overrides the config file)
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,

    /// Metrics listen address (overrides the config file)
    #[arg(long)]
    metrics_addr: Option<SocketAddr>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Index an inclusive block range
    Run {
        #[arg(long)]
        from: u64,
        #[arg(long)]
        to: u64,
    },
    /// Re-submit the records of a failure log
    Replay {
        /// JSON-lines failure log
        path: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let mut config = IndexerConfig::load(cli.config.as_deref())?;
    if let Some(url) = cli.rpc_url {
        config.rpc_url = url;
    }
    if let Some(url) = cli.database_url {
        config.database_url = Some(url);
    }
    if let Some(addr) = cli.metrics_addr {
        config.metrics_addr = Some(addr);
    }
    config.validate()?;

    blockpipe_observability::init_metrics();

    let recorder = config.recorder();
    let store = open_store(&config).await?;

    match cli.command {
        Commands::Run { from, to } => run(config, store, recorder, from, to).await,
        Commands::Replay { path } => replay(config, store, recorder, path).await,
    }
}

async fn spawn_metrics_server(
    addr: Option<SocketAddr>,
    readiness: Option<ReadinessCheck>,
) -> Result<()> {
    let Some(addr) = addr else {
        return Ok(());
    };
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding metrics server to {}", addr))?;
    info!("Metrics server listening on {}", addr);

    let router = create_metrics_router(readiness);
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router).await {
            error!("Metrics server error: {}", e);
        }
    });
    Ok(())
}

async fn open_store(config: &IndexerConfig) -> Result<Arc<dyn RecordStore>> {
    match &config.database_url {
        Some(url) => {
            let tables: HashMap<RecordKind, _> = config
                .tables
                .iter()
                .map(|(kind, spec)| (RecordKind::from(kind.as_str()), spec.clone()))
                .collect();
            let store = PostgresStore::connect(url, config.max_connections, tables)
                .await
                .context("connecting to Postgres")?;
            info!(tables = config.tables.len(), "Connected to Postgres");
            Ok(Arc::new(store))
        }
        None => {
            warn!("No database_url configured; records go to an in-memory store");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}

async fn run(
    config: IndexerConfig,
    store: Arc<dyn RecordStore>,
    recorder: Arc<PerformanceRecorder>,
    from: u64,
    to: u64,
) -> Result<()> {
    let upstream = Arc::new(JsonRpcUpstream::new(
        config.rpc_url.clone(),
        config.caller.request_timeout(),
    )?);
    let caller = Arc::new(BatchCaller::with_recorder(
        upstream,
        config.caller.clone(),
        recorder.clone(),
    )?);

    let breaker_view = caller.clone();
    let readiness: ReadinessCheck =
        Arc::new(move || breaker_view.breaker().state() != CircuitState::Open);
    spawn_metrics_server(config.metrics_addr, Some(readiness)).await?;

    let pipeline = ExportPipeline::spawn(config.export.clone(), store, recorder).await?;
    let driver = RangeDriver::new(
        caller.clone(),
        pipeline.handle(),
        config.blocks_per_range,
        config.include_transactions,
    );

    info!(rpc_url = %config.rpc_url, from, to, "Indexing block range");
    let result = tokio::select! {
        result = driver.run(from, to) => Some(result),
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal, draining export pipeline...");
            None
        }
    };

    let report = pipeline.shutdown().await?;
    caller.log_snapshot();
    log_report(&report);

    match result {
        Some(Ok(summary)) if !summary.is_complete() => {
            warn!(
                missing = ?summary.missing,
                failed = ?summary.failed,
                "Some blocks were not indexed"
            );
            Ok(())
        }
        Some(Ok(_)) | None => Ok(()),
        Some(Err(e)) => Err(e),
    }
}

async fn replay(
    config: IndexerConfig,
    store: Arc<dyn RecordStore>,
    recorder: Arc<PerformanceRecorder>,
    path: PathBuf,
) -> Result<()> {
    if config.export.failure_log_path.as_deref() == Some(path.as_path()) {
        anyhow::bail!(
            "cannot replay {} into a pipeline that logs failures to the same file",
            path.display()
        );
    }

    let entries = FailureLog::read_all(&path)
        .await
        .with_context(|| format!("reading failure log {}", path.display()))?;
    info!(entries = entries.len(), path = %path.display(), "Replaying failure log");
    spawn_metrics_server(config.metrics_addr, None).await?;

    let pipeline = ExportPipeline::spawn(config.export.clone(), store, recorder).await?;
    let handle = pipeline.handle();
    for entry in entries {
        handle.submit_many(entry.records).await?;
    }
    let report = pipeline.shutdown().await?;
    log_report(&report);
    Ok(())
}

fn log_report(report: &PipelineReport) {
    let stats = &report.stats;
    info!(
        submitted = stats.submitted_records,
        committed_rows = stats.committed_rows,
        flushes = stats.flushes,
        partial_flushes = stats.partial_flushes,
        requeued = stats.requeued_records,
        dead_lettered = stats.dead_lettered_records,
        mean_flush_ms = report.flush_stats.mean_flush_time().as_millis() as u64,
        "Export pipeline stopped"
    );
    if !report.dead_letters.is_empty() {
        warn!(
            partitions = report.dead_letters.len(),
            "Dead-lettered partitions were kept in memory only and are lost on exit"
        );
        for entry in &report.dead_letters {
            warn!(
                batch = entry.batch_id,
                kind = %entry.kind,
                records = entry.records.len(),
                error = %entry.error,
                "Unwritten partition"
            );
        }
    }
}
