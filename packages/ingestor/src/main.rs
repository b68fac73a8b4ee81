//! ChainGraph Ingestor
//!
//! Consumes JSON transactions from a Redis list, decodes and classifies them
//! in batches, and publishes graph updates to a Redis channel for the graph
//! writer.
//!
//! # Usage
//!
//! ```bash
//! # Defaults, overridden by ./ingestor.toml and INGESTOR__* variables
//! chaingraph-ingestor
//!
//! # Explicit config file and network tag
//! chaingraph-ingestor --config /etc/chaingraph/ingestor.toml --network arbitrum
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use chaingraph_ingestor::bytecode::{expand_path, find_ipc_socket, BytecodeInspector, IpcBytecodeInspector};
use chaingraph_ingestor::config::{AppConfig, BytecodeConfig};
use chaingraph_ingestor::contract::{ContractClassifier, RescoreStrategy};
use chaingraph_ingestor::node::NodeClassifier;
use chaingraph_ingestor::pipeline::{BatchProcessor, IngestionPipeline, PipelineConfig};
use chaingraph_ingestor::publisher::RedisGraphPublisher;
use chaingraph_ingestor::queue::RedisTransactionQueue;
use chaingraph_ingestor::registry::RegistryStore;

#[derive(Parser, Debug)]
#[command(name = "chaingraph-ingestor", version, about = "Blockchain relationship graph ingestor")]
struct Cli {
    /// TOML config file (defaults to ./ingestor.toml when present)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the configured network tag
    #[arg(long)]
    network: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("chaingraph_ingestor=info".parse()?),
        )
        .with_target(true)
        .init();

    let mut config = AppConfig::load(cli.config.as_deref()).context("loading configuration")?;
    if let Some(network) = cli.network {
        config.network = network;
    }
    info!("Starting ChainGraph ingestor for {}", config.network);

    let registry = Arc::new(RegistryStore::with_defaults());
    if let Some(seed) = &config.registry.seed_path {
        let version = registry
            .load_seed(seed)
            .with_context(|| format!("loading registry seed {}", seed.display()))?;
        info!("Applied registry seed {} (version {})", seed.display(), version);
    }

    let mut node_classifier = NodeClassifier::new(Arc::clone(&registry), config.network.clone());
    if let Some(inspector) = connect_inspector(&config.bytecode).await {
        node_classifier = node_classifier.with_inspector(inspector);
    }
    let contract_classifier = ContractClassifier::with_strategy(
        Arc::clone(&registry),
        RescoreStrategy::every(config.classifier.rescore_interval),
    );

    let client = redis::Client::open(config.redis.url.as_str()).context("invalid Redis URL")?;
    let connection = client
        .get_multiplexed_async_connection()
        .await
        .context("connecting to Redis")?;
    info!("Connected to Redis at {}", config.redis.url);

    let publisher = RedisGraphPublisher::new(connection.clone(), config.redis.graph_channel.clone());
    let queue = RedisTransactionQueue::new(
        connection,
        config.redis.transaction_queue.clone(),
        config.redis.pop_timeout_secs,
    );

    let processor = Arc::new(
        BatchProcessor::new(
            node_classifier,
            contract_classifier,
            Arc::new(publisher),
            config.network.clone(),
        )
        .with_contract_cache_capacity(config.pipeline.contract_cache_capacity),
    );
    let pipeline = IngestionPipeline::new(PipelineConfig::from(&config.pipeline), processor);

    let cancel = CancellationToken::new();
    let (tx_sender, tx_receiver) = mpsc::channel(config.pipeline.channel_capacity.max(1));
    let consumer = tokio::spawn(queue.run(tx_sender, cancel.clone()));

    let shutdown = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received Ctrl+C, shutting down");
                shutdown.cancel();
            }
            Err(e) => error!("Unable to listen for Ctrl+C: {}", e),
        }
    });

    // A failed consumer drops its sender, which ends the pipeline run
    let stats = pipeline.run(tx_receiver, cancel.clone()).await;
    cancel.cancel();
    info!("Final stats: {}", serde_json::to_string(&stats)?);

    match consumer.await {
        Ok(Ok(forwarded)) => {
            info!("Queue consumer forwarded {} transactions", forwarded);
            Ok(())
        }
        Ok(Err(e)) => {
            error!("Queue consumer failed: {}", e);
            Err(anyhow!(e).context("consuming the transaction queue"))
        }
        Err(e) => Err(anyhow!(e).context("queue consumer task panicked")),
    }
}

/// Open the IPC bytecode inspector when enabled
///
/// Inspection is best effort: without a reachable socket the classifier runs
/// on registry and behavior evidence alone.
async fn connect_inspector(settings: &BytecodeConfig) -> Option<Arc<dyn BytecodeInspector>> {
    if !settings.enabled {
        info!("Bytecode inspection disabled");
        return None;
    }

    let path = match settings.ipc_path.as_deref().map(expand_path).or_else(find_ipc_socket) {
        Some(path) => path,
        None => {
            warn!("No IPC socket found; contract detection limited to the registry");
            return None;
        }
    };

    match IpcBytecodeInspector::connect(settings.ipc_config(path.clone())).await {
        Ok(inspector) => {
            info!("Bytecode inspection via {}", path);
            Some(Arc::new(inspector))
        }
        Err(e) => {
            warn!("Bytecode inspection unavailable at {}: {}", path, e);
            None
        }
    }
}
