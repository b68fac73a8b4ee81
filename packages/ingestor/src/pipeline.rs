//! Ingestion Pipeline
//!
//! Accumulates incoming transactions into batches, flushing when a batch is
//! full or the flush interval elapses, and hands each batch to a fixed pool
//! of workers. A worker runs decode, classify and persist for one batch; a
//! panic inside a batch is contained to that batch.
//!
//! On cancellation the partial batch (plus anything already buffered in the
//! source channel) is flushed, then workers drain and exit.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::PipelineSettings;
use crate::contract::{ContractClassification, ContractClassifier};
use crate::decoder::decode_interactions;
use crate::interaction::{InteractionRecord, InteractionType};
use crate::node::{AddressStats, NodeClassifier};
use crate::repository::{GraphRepository, RelationshipKey, RelationshipRecord, TxDetail, WalletRecord};
use crate::signatures::{lookup_hex, ETH_TRANSFER_SIGNATURE};
use crate::transaction::{canonical_address, is_zero_address, wei_to_native, Transaction};

/// Relationship label of a plain value transfer
pub const ETH_TRANSFER_RELATIONSHIP: &str = "ETH_TRANSFER";

/// Relationship label of any call with call data
pub const CONTRACT_INTERACTION_RELATIONSHIP: &str = "CONTRACT_INTERACTION";

/// Native value (in whole tokens) at which a transaction counts as large
pub const LARGE_TRANSFER_NATIVE: f64 = 100.0;

/// Contract classifications kept in memory between batches
pub const DEFAULT_CONTRACT_CACHE_CAPACITY: usize = 50_000;

/// Shortest flush interval the batching loop accepts
pub const MIN_FLUSH_INTERVAL: Duration = Duration::from_millis(1);

/// Batching and worker settings
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    pub batch_size: usize,
    pub flush_interval: Duration,
    pub workers: usize,
    /// Batches buffered between the accumulator and the workers
    pub channel_capacity: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            flush_interval: Duration::from_secs(5),
            workers: 4,
            channel_capacity: 1024,
        }
    }
}

impl From<&PipelineSettings> for PipelineConfig {
    fn from(settings: &PipelineSettings) -> Self {
        Self {
            batch_size: settings.batch_size.max(1),
            flush_interval: settings.flush_interval().max(MIN_FLUSH_INTERVAL),
            workers: settings.workers.max(1),
            channel_capacity: settings.channel_capacity.max(1),
        }
    }
}

/// Outcome of one batch
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchReport {
    pub transactions: usize,
    pub decode_failures: usize,
    pub interactions: usize,
    pub relationships: usize,
    pub wallets: usize,
    pub contracts: usize,
    pub nodes: usize,
    pub repository_errors: usize,
    pub elapsed_ms: u64,
}

/// Totals over the life of a pipeline run
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineStats {
    pub batches: u64,
    pub failed_batches: u64,
    pub transactions: u64,
    pub decode_failures: u64,
    pub interactions: u64,
    pub relationships: u64,
    pub nodes_classified: u64,
    pub repository_errors: u64,
}

impl PipelineStats {
    pub fn record(&mut self, report: &BatchReport) {
        self.batches += 1;
        self.transactions += report.transactions as u64;
        self.decode_failures += report.decode_failures as u64;
        self.interactions += report.interactions as u64;
        self.relationships += report.relationships as u64;
        self.nodes_classified += report.nodes as u64;
        self.repository_errors += report.repository_errors as u64;
    }

    pub fn merge(&mut self, other: &PipelineStats) {
        self.batches += other.batches;
        self.failed_batches += other.failed_batches;
        self.transactions += other.transactions;
        self.decode_failures += other.decode_failures;
        self.interactions += other.interactions;
        self.relationships += other.relationships;
        self.nodes_classified += other.nodes_classified;
        self.repository_errors += other.repository_errors;
    }
}

/// Behavior tag derived from an interaction type
pub fn interaction_tag(interaction_type: InteractionType) -> Option<&'static str> {
    match interaction_type {
        InteractionType::Swap => Some("dex_trader"),
        InteractionType::AddLiquidity | InteractionType::RemoveLiquidity => Some("liquidity_provider"),
        InteractionType::Deposit | InteractionType::Withdraw => Some("defi_user"),
        InteractionType::Multicall => Some("multicall_user"),
        InteractionType::Approve
        | InteractionType::IncreaseAllowance
        | InteractionType::DecreaseAllowance => Some("token_approver"),
        InteractionType::Transfer
        | InteractionType::TransferFrom
        | InteractionType::EthTransfer
        | InteractionType::UnknownContractCall => None,
    }
}

#[derive(Debug, Default)]
struct AddressActivity {
    transaction_count: u64,
    total_volume: f64,
    incoming: BTreeSet<String>,
    outgoing: BTreeSet<String>,
    tags: BTreeSet<String>,
    first_seen: u64,
    last_seen: u64,
}

impl AddressActivity {
    fn stats(&self) -> AddressStats {
        AddressStats {
            transaction_count: self.transaction_count,
            total_volume: self.total_volume,
            incoming_connections: self.incoming.len() as u64,
            outgoing_connections: self.outgoing.len() as u64,
        }
    }

    fn seen(&mut self, timestamp: u64) {
        if self.transaction_count == 0 || timestamp < self.first_seen {
            self.first_seen = timestamp;
        }
        self.last_seen = self.last_seen.max(timestamp);
        self.transaction_count += 1;
    }
}

/// Everything one batch contributes to the graph
#[derive(Debug, Default)]
struct BatchGraph {
    activity: BTreeMap<String, AddressActivity>,
    primary: BTreeMap<RelationshipKey, RelationshipRecord>,
    interactions: BTreeMap<RelationshipKey, RelationshipRecord>,
    /// Records paired with the sender of their transaction
    contract_records: Vec<(InteractionRecord, String)>,
    interaction_count: usize,
}

fn is_graph_address(address: &str) -> bool {
    !address.is_empty() && !is_zero_address(address)
}

fn add_edge(
    edges: &mut BTreeMap<RelationshipKey, RelationshipRecord>,
    from: &str,
    to: &str,
    relationship_type: &str,
    network: &str,
    detail: TxDetail,
) {
    let record = RelationshipRecord::new(from, to, relationship_type, network);
    let entry = edges.entry(record.key()).or_insert(record);
    if let Err(e) = entry.add_detail(detail) {
        warn!("Dropping relationship detail {} -> {}: {}", from, to, e);
    }
}

impl BatchGraph {
    fn add_transaction(&mut self, tx: &Transaction, records: &[InteractionRecord]) {
        let from = canonical_address(&tx.from);
        let to = canonical_address(&tx.to);
        let value = tx.parsed_value().unwrap_or_default();
        let native = wei_to_native(value);
        self.interaction_count += records.len();

        let mut participants: BTreeSet<String> = BTreeSet::new();
        participants.insert(from.clone());

        if !tx.is_contract_creation() {
            participants.insert(to.clone());
            let (relationship_type, method_signature) = if tx.has_empty_calldata() {
                (ETH_TRANSFER_RELATIONSHIP, None)
            } else {
                (
                    CONTRACT_INTERACTION_RELATIONSHIP,
                    records.first().map(|r| r.method_signature.clone()),
                )
            };
            add_edge(
                &mut self.primary,
                &from,
                &to,
                relationship_type,
                &tx.network,
                TxDetail {
                    tx_hash: tx.hash.clone(),
                    value: value.to_string(),
                    block_number: tx.block_number,
                    timestamp: tx.timestamp,
                    method_signature,
                    interaction_type: None,
                },
            );
            self.connect(&from, &to);
        }

        for record in records {
            if record.interaction_type == InteractionType::EthTransfer {
                continue;
            }
            if let Some(tag) = interaction_tag(record.interaction_type) {
                self.tag(&from, tag);
            }
            if let Some(protocol) = lookup_hex(&record.method_signature).and_then(|m| m.protocol()) {
                self.tag(&from, &format!("protocol:{protocol}"));
            }

            if is_graph_address(&record.from) && is_graph_address(&record.to) {
                participants.insert(record.from.clone());
                participants.insert(record.to.clone());
                add_edge(
                    &mut self.interactions,
                    &record.from,
                    &record.to,
                    record.relationship_type(),
                    &record.network,
                    TxDetail {
                        tx_hash: record.tx_hash.clone(),
                        value: record.value.clone(),
                        block_number: record.block_number,
                        timestamp: record.timestamp,
                        method_signature: Some(record.method_signature.clone()),
                        interaction_type: Some(record.interaction_type),
                    },
                );
                self.connect(&record.from, &record.to);
            }

            if is_graph_address(&record.contract_address) && record.method_signature != ETH_TRANSFER_SIGNATURE {
                self.contract_records.push((record.clone(), from.clone()));
            }
        }

        if native >= LARGE_TRANSFER_NATIVE {
            self.tag(&from, "large_transfer");
        }

        for address in participants.into_iter().filter(|a| is_graph_address(a)) {
            let activity = self.activity.entry(address.clone()).or_default();
            activity.seen(tx.timestamp);
            if address == from || address == to {
                activity.total_volume += native;
            }
        }
    }

    fn connect(&mut self, from: &str, to: &str) {
        if from == to || !is_graph_address(from) || !is_graph_address(to) {
            return;
        }
        self.activity
            .entry(from.to_string())
            .or_default()
            .outgoing
            .insert(to.to_string());
        self.activity
            .entry(to.to_string())
            .or_default()
            .incoming
            .insert(from.to_string());
    }

    fn tag(&mut self, address: &str, tag: &str) {
        if is_graph_address(address) {
            self.activity
                .entry(address.to_string())
                .or_default()
                .tags
                .insert(tag.to_string());
        }
    }
}

#[derive(Debug)]
struct CachedContract {
    classification: ContractClassification,
    last_used: u64,
}

/// Contract classifications carried across batches, least recently used evicted first
#[derive(Debug)]
struct ContractCache {
    entries: HashMap<String, CachedContract>,
    capacity: usize,
    clock: u64,
}

impl ContractCache {
    fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            capacity: capacity.max(1),
            clock: 0,
        }
    }

    fn get(&self, address: &str) -> Option<&ContractClassification> {
        self.entries.get(address).map(|e| &e.classification)
    }

    fn insert_if_absent(&mut self, classification: ContractClassification) {
        self.clock += 1;
        let last_used = self.clock;
        self.entries
            .entry(classification.address.clone())
            .or_insert(CachedContract {
                classification,
                last_used,
            });
    }

    fn touch(&mut self, address: &str) -> &mut ContractClassification {
        self.clock += 1;
        let entry = self
            .entries
            .entry(address.to_string())
            .or_insert_with(|| CachedContract {
                classification: ContractClassification::new(address),
                last_used: 0,
            });
        entry.last_used = self.clock;
        &mut entry.classification
    }

    /// Drop the least recently used entries above capacity
    fn evict(&mut self) -> usize {
        let excess = self.entries.len().saturating_sub(self.capacity);
        if excess == 0 {
            return 0;
        }
        let mut by_age: Vec<(u64, String)> = self
            .entries
            .iter()
            .map(|(address, entry)| (entry.last_used, address.clone()))
            .collect();
        by_age.sort_unstable();
        for (_, address) in by_age.into_iter().take(excess) {
            self.entries.remove(&address);
        }
        excess
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Runs one batch end-to-end
pub struct BatchProcessor {
    node_classifier: NodeClassifier,
    contract_classifier: ContractClassifier,
    repository: Arc<dyn GraphRepository>,
    contracts: Mutex<ContractCache>,
    network: String,
}

impl BatchProcessor {
    pub fn new(
        node_classifier: NodeClassifier,
        contract_classifier: ContractClassifier,
        repository: Arc<dyn GraphRepository>,
        network: impl Into<String>,
    ) -> Self {
        Self {
            node_classifier,
            contract_classifier,
            repository,
            contracts: Mutex::new(ContractCache::new(DEFAULT_CONTRACT_CACHE_CAPACITY)),
            network: network.into(),
        }
    }

    /// Bound the number of contract classifications held in memory
    pub fn with_contract_cache_capacity(mut self, capacity: usize) -> Self {
        self.contracts.get_mut().capacity = capacity.max(1);
        self
    }

    /// Cached classification of a contract seen by earlier batches
    pub async fn contract(&self, address: &str) -> Option<ContractClassification> {
        self.contracts.lock().await.get(&canonical_address(address)).cloned()
    }

    pub async fn cached_contracts(&self) -> usize {
        self.contracts.lock().await.len()
    }

    pub async fn process_batch(&self, batch: Vec<Transaction>) -> BatchReport {
        let started = Instant::now();
        let mut report = BatchReport {
            transactions: batch.len(),
            ..Default::default()
        };
        let mut graph = BatchGraph::default();

        for mut tx in batch {
            if tx.network.is_empty() {
                tx.network = self.network.clone();
            }
            match decode_interactions(&tx) {
                Ok(records) => graph.add_transaction(&tx, &records),
                Err(e) => {
                    warn!("Skipping transaction {}: {}", tx.hash, e);
                    report.decode_failures += 1;
                }
            }
        }
        report.interactions = graph.interaction_count;

        let wallets: Vec<WalletRecord> = graph
            .activity
            .iter()
            .map(|(address, activity)| WalletRecord {
                address: address.clone(),
                network: self.network.clone(),
                first_seen: activity.first_seen,
                last_seen: activity.last_seen,
            })
            .collect();
        match self.repository.upsert_wallets(&wallets).await {
            Ok(()) => report.wallets = wallets.len(),
            Err(e) => {
                error!("Wallet upsert failed: {}", e);
                report.repository_errors += 1;
            }
        }

        // Primary edges first so an interaction-level failure never loses them
        for (label, edges) in [("primary", &graph.primary), ("interaction", &graph.interactions)] {
            let edges: Vec<RelationshipRecord> = edges.values().cloned().collect();
            match self.repository.upsert_relationships(&edges).await {
                Ok(()) => report.relationships += edges.len(),
                Err(e) => {
                    error!("Upsert of {} {} relationships failed: {}", edges.len(), label, e);
                    report.repository_errors += 1;
                }
            }
        }

        self.persist_contracts(&graph.contract_records, &mut report).await;

        for (address, activity) in &graph.activity {
            let stats = activity.stats();
            let tags: Vec<String> = activity.tags.iter().cloned().collect();
            let classification = self
                .node_classifier
                .classify_node(address, Some(&stats), &tags)
                .await;
            match self.repository.upsert_node_classification(&classification).await {
                Ok(()) => report.nodes += 1,
                Err(e) => {
                    error!("Node classification upsert for {} failed: {}", address, e);
                    report.repository_errors += 1;
                }
            }
        }

        report.elapsed_ms = started.elapsed().as_millis() as u64;
        report
    }

    /// Fold records into the contract cache and upsert the touched entries
    ///
    /// A contract missing from the cache is restored from the repository when
    /// it can be read back. A contract seen for the first time is scored
    /// immediately; afterwards the rescore strategy decides when rules are
    /// re-evaluated. Snapshots are taken under the cache lock and upserted
    /// after it is released.
    async fn persist_contracts(&self, records: &[(InteractionRecord, String)], report: &mut BatchReport) {
        let touched: BTreeSet<&str> = records
            .iter()
            .map(|(record, _)| record.contract_address.as_str())
            .collect();
        if touched.is_empty() {
            return;
        }

        let missing: Vec<&str> = {
            let cache = self.contracts.lock().await;
            touched
                .iter()
                .copied()
                .filter(|address| cache.get(address).is_none())
                .collect()
        };
        let mut restored = Vec::new();
        for address in missing {
            match self.repository.load_contract(address).await {
                Ok(Some(classification)) => restored.push(classification),
                Ok(None) => {}
                Err(e) => warn!("Loading contract {} failed, starting fresh: {}", address, e),
            }
        }

        let snapshots: Vec<ContractClassification> = {
            let mut cache = self.contracts.lock().await;
            for classification in restored {
                cache.insert_if_absent(classification);
            }
            for (record, caller) in records {
                let classification = cache.touch(&record.contract_address);
                let first_sighting = classification.total_interactions == 0;
                let rescored = self
                    .contract_classifier
                    .record_interaction(classification, record, caller);
                if first_sighting && !rescored {
                    self.contract_classifier.rescore(classification);
                }
            }
            let snapshots = touched
                .iter()
                .filter_map(|address| cache.get(address).cloned())
                .collect();
            let evicted = cache.evict();
            if evicted > 0 {
                debug!("Evicted {} idle contract classifications", evicted);
            }
            snapshots
        };

        for contract in &snapshots {
            match self.repository.upsert_contract(contract).await {
                Ok(()) => report.contracts += 1,
                Err(e) => {
                    error!("Contract upsert for {} failed: {}", contract.address, e);
                    report.repository_errors += 1;
                }
            }
        }
    }
}

/// Batching front-end over a pool of batch workers
pub struct IngestionPipeline {
    config: PipelineConfig,
    processor: Arc<BatchProcessor>,
}

impl IngestionPipeline {
    pub fn new(config: PipelineConfig, processor: Arc<BatchProcessor>) -> Self {
        Self { config, processor }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn processor(&self) -> &Arc<BatchProcessor> {
        &self.processor
    }

    /// Consume `source` until it closes or `cancel` fires
    pub async fn run(
        &self,
        mut source: mpsc::Receiver<Transaction>,
        cancel: CancellationToken,
    ) -> PipelineStats {
        let batch_size = self.config.batch_size.max(1);
        let flush_interval = self.config.flush_interval.max(MIN_FLUSH_INTERVAL);
        let (batch_tx, batch_rx) = mpsc::channel::<Vec<Transaction>>(self.config.channel_capacity.max(1));
        let batch_rx = Arc::new(Mutex::new(batch_rx));

        let workers: Vec<JoinHandle<PipelineStats>> = (0..self.config.workers.max(1))
            .map(|id| spawn_worker(id, Arc::clone(&self.processor), Arc::clone(&batch_rx)))
            .collect();
        info!(
            "Pipeline started: batch size {}, flush every {:?}, {} workers",
            batch_size,
            flush_interval,
            workers.len()
        );

        let mut pending: Vec<Transaction> = Vec::with_capacity(batch_size);
        let mut ticker = interval_at(tokio::time::Instant::now() + flush_interval, flush_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!("Shutdown requested, flushing {} pending transactions", pending.len());
                    break;
                }
                received = source.recv() => match received {
                    Some(tx) => {
                        pending.push(tx);
                        if pending.len() >= batch_size {
                            dispatch(&batch_tx, &mut pending, batch_size).await;
                            ticker.reset();
                        }
                    }
                    None => {
                        info!("Transaction source closed");
                        break;
                    }
                },
                _ = ticker.tick() => {
                    if !pending.is_empty() {
                        debug!("Flush interval elapsed with {} pending transactions", pending.len());
                        dispatch(&batch_tx, &mut pending, batch_size).await;
                    }
                }
            }
        }

        while let Ok(tx) = source.try_recv() {
            pending.push(tx);
            if pending.len() >= batch_size {
                dispatch(&batch_tx, &mut pending, batch_size).await;
            }
        }
        if !pending.is_empty() {
            dispatch(&batch_tx, &mut pending, batch_size).await;
        }
        drop(batch_tx);

        let mut stats = PipelineStats::default();
        for worker in workers {
            match worker.await {
                Ok(worker_stats) => stats.merge(&worker_stats),
                Err(e) => error!("Worker task failed: {}", e),
            }
        }
        info!(
            "Pipeline stopped: {} batches ({} failed), {} transactions, {} relationships, {} nodes",
            stats.batches,
            stats.failed_batches,
            stats.transactions,
            stats.relationships,
            stats.nodes_classified
        );
        stats
    }
}

async fn dispatch(sender: &mpsc::Sender<Vec<Transaction>>, pending: &mut Vec<Transaction>, batch_size: usize) {
    let batch = std::mem::replace(pending, Vec::with_capacity(batch_size));
    let size = batch.len();
    if sender.send(batch).await.is_err() {
        error!("All workers stopped; dropping batch of {} transactions", size);
    }
}

fn spawn_worker(
    id: usize,
    processor: Arc<BatchProcessor>,
    batches: Arc<Mutex<mpsc::Receiver<Vec<Transaction>>>>,
) -> JoinHandle<PipelineStats> {
    tokio::spawn(async move {
        let mut stats = PipelineStats::default();
        loop {
            let next = batches.lock().await.recv().await;
            let Some(batch) = next else { break };
            let size = batch.len();

            let processor = Arc::clone(&processor);
            match tokio::spawn(async move { processor.process_batch(batch).await }).await {
                Ok(report) => {
                    info!(
                        "Worker {} processed {} transactions: {} interactions, {} relationships, {} nodes in {}ms",
                        id,
                        report.transactions,
                        report.interactions,
                        report.relationships,
                        report.nodes,
                        report.elapsed_ms
                    );
                    stats.record(&report);
                }
                Err(e) => {
                    error!("Worker {} failed a batch of {} transactions: {}", id, size, e);
                    stats.failed_batches += 1;
                }
            }
        }
        debug!("Worker {} drained", id);
        stats
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract::{ContractType, RescoreStrategy};
    use crate::decoder::{encode_address_word, encode_uint_word};
    use crate::node::NodeType;
    use crate::node::NodeClassification;
    use crate::registry::RegistryStore;
    use crate::repository::{MemoryRepository, RepositoryError};
    use alloy::primitives::{address, U256};
    use async_trait::async_trait;
    use tokio::sync::{Notify, Semaphore};

    const SENDER: &str = "0xf39fd6e51aad88f6f4ce6ab8827279cfffb92266";
    const RECIPIENT: &str = "0x70997970c51812dc3a010c7d01b50e0d17dc79c8";
    const TOKEN: &str = "0x1f9840a85d5af5bf1d1762f925bdaddc4201f984";
    const ROUTER: &str = "0x7a250d5630b4cf539739df2c5dacb4c659f2488d";

    fn tx(hash: &str, to: &str, value: &str, data: &str) -> Transaction {
        Transaction {
            hash: hash.to_string(),
            from: SENDER.to_string(),
            to: to.to_string(),
            value: value.to_string(),
            data: data.to_string(),
            block_number: 100,
            timestamp: 1_700_000_000,
            network: String::new(),
            success: true,
        }
    }

    fn transfer_data(amount: u64) -> String {
        format!(
            "0xa9059cbb{}{}",
            encode_address_word(address!("70997970C51812dc3A010C7d01b50e0d17dc79C8")),
            encode_uint_word(U256::from(amount))
        )
    }

    fn processor(repository: Arc<MemoryRepository>, strategy: RescoreStrategy) -> BatchProcessor {
        let registry = Arc::new(RegistryStore::with_defaults());
        BatchProcessor::new(
            NodeClassifier::new(Arc::clone(&registry), "ethereum"),
            ContractClassifier::with_strategy(registry, strategy),
            repository,
            "ethereum",
        )
    }

    // ==================== batch processing tests ====================

    #[tokio::test]
    async fn test_eth_transfer_creates_primary_relationship() {
        let repo = Arc::new(MemoryRepository::new());
        let report = processor(Arc::clone(&repo), RescoreStrategy::default())
            .process_batch(vec![tx("0x01", RECIPIENT, "2000000000000000000", "0x")])
            .await;

        assert_eq!(report.transactions, 1);
        assert_eq!(report.interactions, 1);
        assert_eq!(report.relationships, 1);
        assert_eq!(report.repository_errors, 0);

        let r = repo.relationship(SENDER, RECIPIENT, "ETH_TRANSFER").await.unwrap();
        assert_eq!(r.total_value, "2000000000000000000");
        assert_eq!(r.network, "ethereum");
        assert_eq!(repo.wallet_count().await, 2);
        assert_eq!(repo.node_count().await, 2);
    }

    #[tokio::test]
    async fn test_erc20_transfer_creates_primary_and_interaction_edges() {
        let repo = Arc::new(MemoryRepository::new());
        processor(Arc::clone(&repo), RescoreStrategy::default())
            .process_batch(vec![tx("0x02", TOKEN, "0", &transfer_data(500))])
            .await;

        let primary = repo.relationship(SENDER, TOKEN, "CONTRACT_INTERACTION").await.unwrap();
        assert_eq!(primary.tx_details[0].method_signature.as_deref(), Some("a9059cbb"));

        let transfer = repo.relationship(SENDER, RECIPIENT, "ERC20_TRANSFER").await.unwrap();
        assert_eq!(transfer.total_value, "500");
        assert_eq!(
            transfer.tx_details[0].interaction_type,
            Some(InteractionType::Transfer)
        );

        let contract = repo.contract(TOKEN).await.unwrap();
        assert_eq!(contract.total_interactions, 1);
        assert_eq!(contract.primary_type, ContractType::Erc20Token);
    }

    #[tokio::test]
    async fn test_invalid_value_is_skipped_without_failing_batch() {
        let repo = Arc::new(MemoryRepository::new());
        let report = processor(Arc::clone(&repo), RescoreStrategy::default())
            .process_batch(vec![
                tx("0x03", RECIPIENT, "lots", "0x"),
                tx("0x04", RECIPIENT, "7", "0x"),
            ])
            .await;

        assert_eq!(report.decode_failures, 1);
        let r = repo.relationship(SENDER, RECIPIENT, "ETH_TRANSFER").await.unwrap();
        assert_eq!(r.transaction_count, 1);
        assert_eq!(r.total_value, "7");
    }

    #[tokio::test]
    async fn test_contract_creation_records_only_sender() {
        let repo = Arc::new(MemoryRepository::new());
        let report = processor(Arc::clone(&repo), RescoreStrategy::default())
            .process_batch(vec![tx("0x05", "", "0", "0x6080604052")])
            .await;

        assert_eq!(report.relationships, 0);
        assert_eq!(repo.wallet_count().await, 1);
        assert!(repo.wallet(SENDER).await.is_some());
    }

    #[tokio::test]
    async fn test_swap_tags_feed_node_classifier() {
        let repo = Arc::new(MemoryRepository::new());
        processor(Arc::clone(&repo), RescoreStrategy::default())
            .process_batch(vec![tx("0x06", ROUTER, "0", "0x38ed1739")])
            .await;

        let router = repo.node(ROUTER).await.unwrap();
        assert_eq!(router.primary_type, NodeType::DexContract);
        let sender = repo.node(SENDER).await.unwrap();
        assert_eq!(sender.associated_protocols, vec!["uniswap".to_string()]);
    }

    #[tokio::test]
    async fn test_swap_edge_points_from_router_to_itself() {
        let repo = Arc::new(MemoryRepository::new());
        let processor = processor(Arc::clone(&repo), RescoreStrategy::default());
        processor
            .process_batch(vec![
                tx("0x07", ROUTER, "0", "0x38ed1739"),
                tx("0x08", ROUTER, "0", "0x7ff36ab5"),
            ])
            .await;

        let swaps = repo.relationship(ROUTER, ROUTER, "DEX_SWAP").await.unwrap();
        assert_eq!(swaps.transaction_count, 2);
        assert!(repo.relationship(SENDER, ROUTER, "DEX_SWAP").await.is_none());
        assert!(repo.relationship(SENDER, ROUTER, "CONTRACT_INTERACTION").await.is_some());

        // The transaction sender is still the contract's user
        let contract = processor.contract(ROUTER).await.unwrap();
        assert_eq!(contract.unique_users, 1);
        assert_eq!(contract.total_interactions, 2);
    }

    #[tokio::test]
    async fn test_contract_cache_rescoring_cadence() {
        let repo = Arc::new(MemoryRepository::new());
        let processor = processor(Arc::clone(&repo), RescoreStrategy::every(3));

        // First sighting scores as an ERC20 contract
        processor
            .process_batch(vec![tx("0x10", TOKEN, "0", &transfer_data(1))])
            .await;
        assert_eq!(processor.contract(TOKEN).await.unwrap().primary_type, ContractType::Erc20Token);

        // Approvals alone do not trigger re-scoring until the third interaction
        let approve = transfer_data(1).replacen("a9059cbb", "095ea7b3", 1);
        processor.process_batch(vec![tx("0x11", TOKEN, "0", &approve)]).await;
        let cached = processor.contract(TOKEN).await.unwrap();
        assert_eq!(cached.total_interactions, 2);
        assert_eq!(cached.method_signatures.get("095ea7b3"), Some(&1));
        assert!((cached.confidence - 0.75).abs() < 1e-9);

        processor.process_batch(vec![tx("0x12", TOKEN, "0", &approve)]).await;
        let rescored = processor.contract(TOKEN).await.unwrap();
        assert_eq!(rescored.total_interactions, 3);
        assert!(rescored.confidence > cached.confidence);
        assert_eq!(repo.contract(TOKEN).await.unwrap().total_interactions, 3);
    }

    #[tokio::test]
    async fn test_contract_cache_evicts_and_restores_from_repository() {
        let repo = Arc::new(MemoryRepository::new());
        let processor =
            processor(Arc::clone(&repo), RescoreStrategy::default()).with_contract_cache_capacity(1);

        processor.process_batch(vec![tx("0x50", TOKEN, "0", &transfer_data(1))]).await;
        processor.process_batch(vec![tx("0x51", ROUTER, "0", "0x38ed1739")]).await;
        assert_eq!(processor.cached_contracts().await, 1);
        assert!(processor.contract(TOKEN).await.is_none());

        // History survives eviction through the repository
        processor.process_batch(vec![tx("0x52", TOKEN, "0", &transfer_data(1))]).await;
        let token = processor.contract(TOKEN).await.unwrap();
        assert_eq!(token.total_interactions, 2);
        assert_eq!(repo.contract(TOKEN).await.unwrap().total_interactions, 2);
        assert_eq!(processor.cached_contracts().await, 1);
    }

    /// Repository whose contract upserts wait for a release permit
    struct GatedRepository {
        inner: MemoryRepository,
        entered: Notify,
        release: Semaphore,
    }

    #[async_trait]
    impl GraphRepository for GatedRepository {
        async fn upsert_wallets(&self, wallets: &[WalletRecord]) -> Result<(), RepositoryError> {
            self.inner.upsert_wallets(wallets).await
        }

        async fn upsert_relationships(
            &self,
            relationships: &[RelationshipRecord],
        ) -> Result<(), RepositoryError> {
            self.inner.upsert_relationships(relationships).await
        }

        async fn upsert_contract(&self, contract: &ContractClassification) -> Result<(), RepositoryError> {
            self.entered.notify_one();
            let _permit = self
                .release
                .acquire()
                .await
                .map_err(|e| RepositoryError::Unavailable(e.to_string()))?;
            self.inner.upsert_contract(contract).await
        }

        async fn upsert_node_classification(
            &self,
            classification: &NodeClassification,
        ) -> Result<(), RepositoryError> {
            self.inner.upsert_node_classification(classification).await
        }
    }

    #[tokio::test]
    async fn test_contract_cache_is_free_while_upserts_are_in_flight() {
        let repo = Arc::new(GatedRepository {
            inner: MemoryRepository::new(),
            entered: Notify::new(),
            release: Semaphore::new(0),
        });
        let registry = Arc::new(RegistryStore::with_defaults());
        let processor = Arc::new(BatchProcessor::new(
            NodeClassifier::new(Arc::clone(&registry), "ethereum"),
            ContractClassifier::new(registry),
            repo.clone(),
            "ethereum",
        ));

        let batch = {
            let processor = Arc::clone(&processor);
            tokio::spawn(async move {
                processor
                    .process_batch(vec![tx("0x60", TOKEN, "0", &transfer_data(1))])
                    .await
            })
        };
        repo.entered.notified().await;

        let cached = tokio::time::timeout(Duration::from_millis(500), processor.contract(TOKEN))
            .await
            .expect("cache lock held across a repository write");
        assert_eq!(cached.unwrap().total_interactions, 1);

        repo.release.add_permits(1);
        let report = batch.await.unwrap();
        assert_eq!(report.contracts, 1);
        assert_eq!(report.repository_errors, 0);
    }

    #[tokio::test]
    async fn test_large_transfer_tag() {
        let mut graph = BatchGraph::default();
        let t = tx("0x20", RECIPIENT, "150000000000000000000", "0x");
        let records = decode_interactions(&t).unwrap();
        graph.add_transaction(&t, &records);

        let sender = &graph.activity[SENDER];
        assert!(sender.tags.contains("large_transfer"));
        assert!((sender.total_volume - 150.0).abs() < 1e-6);
        assert_eq!(sender.stats().outgoing_connections, 1);
        assert_eq!(graph.activity[RECIPIENT].stats().incoming_connections, 1);
    }

    #[test]
    fn test_interaction_tags() {
        assert_eq!(interaction_tag(InteractionType::Swap), Some("dex_trader"));
        assert_eq!(interaction_tag(InteractionType::AddLiquidity), Some("liquidity_provider"));
        assert_eq!(interaction_tag(InteractionType::Approve), Some("token_approver"));
        assert_eq!(interaction_tag(InteractionType::Transfer), None);
    }

    // ==================== pipeline loop tests ====================

    fn pipeline(repo: Arc<MemoryRepository>, config: PipelineConfig) -> IngestionPipeline {
        IngestionPipeline::new(config, Arc::new(processor(repo, RescoreStrategy::default())))
    }

    #[tokio::test]
    async fn test_pipeline_flushes_full_batches_and_remainder_on_close() {
        let repo = Arc::new(MemoryRepository::new());
        let config = PipelineConfig {
            batch_size: 2,
            flush_interval: Duration::from_secs(60),
            workers: 2,
            channel_capacity: 4,
        };
        let (sender, receiver) = mpsc::channel(16);
        for i in 0..5 {
            sender.send(tx(&format!("0x{i:02x}"), RECIPIENT, "1", "0x")).await.unwrap();
        }
        drop(sender);

        let stats = pipeline(Arc::clone(&repo), config)
            .run(receiver, CancellationToken::new())
            .await;

        assert_eq!(stats.batches, 3);
        assert_eq!(stats.transactions, 5);
        assert_eq!(stats.failed_batches, 0);
        let r = repo.relationship(SENDER, RECIPIENT, "ETH_TRANSFER").await.unwrap();
        assert_eq!(r.transaction_count, 5);
        assert_eq!(r.total_value, "5");
    }

    #[tokio::test]
    async fn test_pipeline_flushes_on_interval() {
        let repo = Arc::new(MemoryRepository::new());
        let config = PipelineConfig {
            batch_size: 100,
            flush_interval: Duration::from_millis(20),
            workers: 1,
            channel_capacity: 4,
        };
        let (sender, receiver) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let pipeline = pipeline(Arc::clone(&repo), config);

        let run = {
            let cancel = cancel.clone();
            tokio::spawn(async move { pipeline.run(receiver, cancel).await })
        };
        sender.send(tx("0x30", RECIPIENT, "1", "0x")).await.unwrap();

        let mut flushed = false;
        for _ in 0..100 {
            if repo.relationship(SENDER, RECIPIENT, "ETH_TRANSFER").await.is_some() {
                flushed = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(flushed, "interval flush did not happen");

        cancel.cancel();
        let stats = run.await.unwrap();
        assert_eq!(stats.transactions, 1);
    }

    #[tokio::test]
    async fn test_cancellation_flushes_partial_batch() {
        let repo = Arc::new(MemoryRepository::new());
        let config = PipelineConfig {
            batch_size: 100,
            flush_interval: Duration::from_secs(60),
            workers: 3,
            channel_capacity: 4,
        };
        let (sender, receiver) = mpsc::channel(16);
        for i in 0..3 {
            sender.send(tx(&format!("0x4{i}"), RECIPIENT, "1", "0x")).await.unwrap();
        }
        let cancel = CancellationToken::new();
        cancel.cancel();

        let stats = pipeline(Arc::clone(&repo), config).run(receiver, cancel).await;
        assert_eq!(stats.transactions, 3);
        assert_eq!(stats.batches, 1);
        drop(sender);
    }

    #[tokio::test]
    async fn test_zero_flush_interval_does_not_panic() {
        let repo = Arc::new(MemoryRepository::new());
        let config = PipelineConfig {
            batch_size: 10,
            flush_interval: Duration::ZERO,
            workers: 1,
            channel_capacity: 4,
        };
        let (sender, receiver) = mpsc::channel(4);
        sender.send(tx("0x70", RECIPIENT, "1", "0x")).await.unwrap();
        drop(sender);

        let stats = pipeline(Arc::clone(&repo), config)
            .run(receiver, CancellationToken::new())
            .await;
        assert_eq!(stats.transactions, 1);
    }

    #[test]
    fn test_stats_merge() {
        let mut stats = PipelineStats::default();
        stats.record(&BatchReport {
            transactions: 4,
            relationships: 3,
            ..Default::default()
        });
        let other = PipelineStats {
            failed_batches: 1,
            ..Default::default()
        };
        stats.merge(&other);
        assert_eq!(stats.batches, 1);
        assert_eq!(stats.failed_batches, 1);
        assert_eq!(stats.transactions, 4);
    }

    #[test]
    fn test_config_from_settings_clamps_zero() {
        let mut settings = PipelineSettings {
            batch_size: 0,
            flush_interval_ms: 250,
            workers: 0,
            channel_capacity: 8,
            contract_cache_capacity: 16,
        };
        let config = PipelineConfig::from(&settings);
        assert_eq!(config.batch_size, 1);
        assert_eq!(config.workers, 1);
        assert_eq!(config.flush_interval, Duration::from_millis(250));

        settings.flush_interval_ms = 0;
        assert_eq!(PipelineConfig::from(&settings).flush_interval, MIN_FLUSH_INTERVAL);
    }
}
