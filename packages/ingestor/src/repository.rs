//! Graph Repository
//!
//! The persistence seam of the pipeline. Relationship records are merged by
//! (from, to, relationship type): totals accumulate and per-transaction
//! details are appended, never overwritten.

use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, HashMap, HashSet};

use alloy::primitives::U256;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::debug;

use crate::contract::ContractClassification;
use crate::interaction::InteractionType;
use crate::node::NodeClassification;
use crate::publisher::PublishError;
use crate::transaction::{canonical_address, parse_value};

/// Errors reported by a repository implementation
#[derive(Error, Debug)]
pub enum RepositoryError {
    #[error("Invalid record: {0}")]
    InvalidRecord(String),

    #[error("Repository unavailable: {0}")]
    Unavailable(String),

    #[error(transparent)]
    Publish(#[from] PublishError),
}

/// Wallet node upsert
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WalletRecord {
    pub address: String,
    pub network: String,
    /// Block timestamps in seconds
    pub first_seen: u64,
    pub last_seen: u64,
}

impl WalletRecord {
    pub fn new(address: &str, network: &str, seen: u64) -> Self {
        Self {
            address: canonical_address(address),
            network: network.to_string(),
            first_seen: seen,
            last_seen: seen,
        }
    }

    /// Widen the seen window with another record for the same wallet
    pub fn merge(&mut self, other: &WalletRecord) {
        self.first_seen = self.first_seen.min(other.first_seen);
        self.last_seen = self.last_seen.max(other.last_seen);
    }
}

/// Per-transaction audit entry on a relationship
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TxDetail {
    pub tx_hash: String,
    /// Decimal amount moved by this transaction
    pub value: String,
    pub block_number: u64,
    pub timestamp: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method_signature: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interaction_type: Option<InteractionType>,
}

/// Aggregated edge between two addresses
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelationshipRecord {
    pub from: String,
    pub to: String,
    pub relationship_type: String,
    pub network: String,
    /// Decimal sum of all detail values
    pub total_value: String,
    pub transaction_count: u64,
    pub tx_details: Vec<TxDetail>,
    /// Hashes of `tx_details`, rebuilt on demand after deserialization
    #[serde(skip)]
    seen_hashes: HashSet<String>,
}

impl PartialEq for RelationshipRecord {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
            && self.network == other.network
            && self.total_value == other.total_value
            && self.transaction_count == other.transaction_count
            && self.tx_details == other.tx_details
    }
}

/// Merge key of a relationship
pub type RelationshipKey = (String, String, String);

impl RelationshipRecord {
    pub fn new(from: &str, to: &str, relationship_type: &str, network: &str) -> Self {
        Self {
            from: canonical_address(from),
            to: canonical_address(to),
            relationship_type: relationship_type.to_string(),
            network: network.to_string(),
            total_value: "0".to_string(),
            transaction_count: 0,
            tx_details: Vec::new(),
            seen_hashes: HashSet::new(),
        }
    }

    pub fn key(&self) -> RelationshipKey {
        (self.from.clone(), self.to.clone(), self.relationship_type.clone())
    }

    /// Append a transaction detail, adding its value to the total
    ///
    /// A detail whose transaction hash is already recorded is ignored, which
    /// keeps replays of the same batch idempotent. Returns whether it was added.
    pub fn add_detail(&mut self, detail: TxDetail) -> Result<bool, RepositoryError> {
        if self.seen_hashes.len() != self.tx_details.len() {
            self.seen_hashes = self.tx_details.iter().map(|d| d.tx_hash.clone()).collect();
        }
        if self.seen_hashes.contains(&detail.tx_hash) {
            return Ok(false);
        }
        let total = parse_value(&self.total_value)
            .map_err(|e| RepositoryError::InvalidRecord(e.to_string()))?;
        let amount = parse_value(&detail.value)
            .map_err(|e| RepositoryError::InvalidRecord(e.to_string()))?;

        self.total_value = total.saturating_add(amount).to_string();
        self.transaction_count += 1;
        self.seen_hashes.insert(detail.tx_hash.clone());
        self.tx_details.push(detail);
        Ok(true)
    }

    /// Fold another record with the same key into this one
    pub fn merge(&mut self, other: RelationshipRecord) -> Result<(), RepositoryError> {
        if self.key() != other.key() {
            return Err(RepositoryError::InvalidRecord(format!(
                "cannot merge {:?} into {:?}",
                other.key(),
                self.key()
            )));
        }
        for detail in other.tx_details {
            self.add_detail(detail)?;
        }
        Ok(())
    }

    pub fn total(&self) -> U256 {
        parse_value(&self.total_value).unwrap_or_default()
    }
}

/// Sink for graph writes produced by the pipeline
#[async_trait]
pub trait GraphRepository: Send + Sync {
    async fn upsert_wallets(&self, wallets: &[WalletRecord]) -> Result<(), RepositoryError>;

    async fn upsert_relationships(
        &self,
        relationships: &[RelationshipRecord],
    ) -> Result<(), RepositoryError>;

    async fn upsert_contract(&self, contract: &ContractClassification) -> Result<(), RepositoryError>;

    async fn upsert_node_classification(
        &self,
        classification: &NodeClassification,
    ) -> Result<(), RepositoryError>;

    /// Stored classification of a contract, for stores that can read one back
    async fn load_contract(
        &self,
        _address: &str,
    ) -> Result<Option<ContractClassification>, RepositoryError> {
        Ok(None)
    }
}

#[derive(Debug, Default)]
struct GraphState {
    wallets: HashMap<String, WalletRecord>,
    relationships: BTreeMap<RelationshipKey, RelationshipRecord>,
    contracts: HashMap<String, ContractClassification>,
    nodes: HashMap<String, NodeClassification>,
    /// Superseded classifications per address, oldest first
    history: HashMap<String, Vec<NodeClassification>>,
}

/// In-process repository with the same merge semantics as the graph store
#[derive(Debug, Default)]
pub struct MemoryRepository {
    state: RwLock<GraphState>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn wallet(&self, address: &str) -> Option<WalletRecord> {
        self.state.read().await.wallets.get(&canonical_address(address)).cloned()
    }

    pub async fn wallet_count(&self) -> usize {
        self.state.read().await.wallets.len()
    }

    pub async fn relationship(
        &self,
        from: &str,
        to: &str,
        relationship_type: &str,
    ) -> Option<RelationshipRecord> {
        let key = (
            canonical_address(from),
            canonical_address(to),
            relationship_type.to_string(),
        );
        self.state.read().await.relationships.get(&key).cloned()
    }

    /// All relationships ordered by key
    pub async fn relationships(&self) -> Vec<RelationshipRecord> {
        self.state.read().await.relationships.values().cloned().collect()
    }

    pub async fn contract(&self, address: &str) -> Option<ContractClassification> {
        self.state.read().await.contracts.get(&canonical_address(address)).cloned()
    }

    pub async fn node(&self, address: &str) -> Option<NodeClassification> {
        self.state.read().await.nodes.get(&canonical_address(address)).cloned()
    }

    pub async fn node_count(&self) -> usize {
        self.state.read().await.nodes.len()
    }

    /// Superseded classifications of an address, oldest first
    pub async fn history(&self, address: &str) -> Vec<NodeClassification> {
        self.state
            .read()
            .await
            .history
            .get(&canonical_address(address))
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl GraphRepository for MemoryRepository {
    async fn upsert_wallets(&self, wallets: &[WalletRecord]) -> Result<(), RepositoryError> {
        let mut state = self.state.write().await;
        for wallet in wallets {
            state
                .wallets
                .entry(wallet.address.clone())
                .and_modify(|existing| existing.merge(wallet))
                .or_insert_with(|| wallet.clone());
        }
        Ok(())
    }

    async fn upsert_relationships(
        &self,
        relationships: &[RelationshipRecord],
    ) -> Result<(), RepositoryError> {
        let mut state = self.state.write().await;
        for relationship in relationships {
            match state.relationships.entry(relationship.key()) {
                Entry::Occupied(mut existing) => existing.get_mut().merge(relationship.clone())?,
                Entry::Vacant(slot) => {
                    slot.insert(relationship.clone());
                }
            }
        }
        debug!("Merged {} relationships", relationships.len());
        Ok(())
    }

    /// Snapshots carrying fewer interactions than the stored one are ignored
    async fn upsert_contract(&self, contract: &ContractClassification) -> Result<(), RepositoryError> {
        let mut state = self.state.write().await;
        if let Some(stored) = state.contracts.get(&contract.address) {
            if stored.total_interactions > contract.total_interactions {
                debug!(
                    "Ignoring stale snapshot of {} ({} < {} interactions)",
                    contract.address, contract.total_interactions, stored.total_interactions
                );
                return Ok(());
            }
        }
        state.contracts.insert(contract.address.clone(), contract.clone());
        Ok(())
    }

    async fn upsert_node_classification(
        &self,
        classification: &NodeClassification,
    ) -> Result<(), RepositoryError> {
        let mut state = self.state.write().await;
        let mut next = classification.clone();
        if let Some(previous) = state.nodes.remove(&next.address) {
            next.supersede(&previous);
            state
                .history
                .entry(next.address.clone())
                .or_default()
                .push(previous);
        }
        state.nodes.insert(next.address.clone(), next);
        Ok(())
    }

    async fn load_contract(
        &self,
        address: &str,
    ) -> Result<Option<ContractClassification>, RepositoryError> {
        Ok(self.contract(address).await)
    }
}
