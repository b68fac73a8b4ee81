//! Redis Graph Publisher
//!
//! Repository implementation that publishes graph updates to a Redis pub/sub
//! channel as tagged JSON, for the graph writer service to apply with its
//! merge semantics.

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::contract::ContractClassification;
use crate::node::NodeClassification;
use crate::repository::{GraphRepository, RelationshipRecord, RepositoryError, WalletRecord};
use crate::transaction::current_timestamp_millis;

/// Default Redis channel for graph updates
pub const DEFAULT_CHANNEL: &str = "chaingraph_updates";

/// Errors that can occur during publishing
#[derive(Error, Debug)]
pub enum PublishError {
    #[error("Redis connection error: {0}")]
    Connection(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// One graph write
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum GraphUpdate {
    Wallets(Vec<WalletRecord>),
    Relationships(Vec<RelationshipRecord>),
    Contract(ContractClassification),
    NodeClassification(NodeClassification),
}

/// Envelope published on the channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphMessage {
    pub update: GraphUpdate,
    /// Unix timestamp in milliseconds when the message was produced
    pub published_at: u64,
}

impl GraphMessage {
    pub fn new(update: GraphUpdate) -> Self {
        Self {
            update,
            published_at: current_timestamp_millis(),
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

/// Redis publisher for graph updates
///
/// The multiplexed connection is cloned per publish so concurrent workers
/// share one socket.
#[derive(Clone)]
pub struct RedisGraphPublisher {
    connection: MultiplexedConnection,
    channel: String,
}

impl RedisGraphPublisher {
    pub fn new(connection: MultiplexedConnection, channel: impl Into<String>) -> Self {
        Self {
            connection,
            channel: channel.into(),
        }
    }

    pub fn with_default_channel(connection: MultiplexedConnection) -> Self {
        Self::new(connection, DEFAULT_CHANNEL)
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Publish one update
    ///
    /// # Returns
    /// The number of subscribers that received the message
    pub async fn publish(&self, update: GraphUpdate) -> Result<i64, PublishError> {
        let json = GraphMessage::new(update).to_json()?;
        let mut connection = self.connection.clone();
        let subscribers: i64 = connection.publish(&self.channel, &json).await?;
        debug!("Published {} bytes to {} ({} subscribers)", json.len(), self.channel, subscribers);
        Ok(subscribers)
    }
}

#[async_trait]
impl GraphRepository for RedisGraphPublisher {
    async fn upsert_wallets(&self, wallets: &[WalletRecord]) -> Result<(), RepositoryError> {
        if !wallets.is_empty() {
            self.publish(GraphUpdate::Wallets(wallets.to_vec())).await?;
        }
        Ok(())
    }

    async fn upsert_relationships(
        &self,
        relationships: &[RelationshipRecord],
    ) -> Result<(), RepositoryError> {
        if !relationships.is_empty() {
            self.publish(GraphUpdate::Relationships(relationships.to_vec())).await?;
        }
        Ok(())
    }

    async fn upsert_contract(&self, contract: &ContractClassification) -> Result<(), RepositoryError> {
        self.publish(GraphUpdate::Contract(contract.clone())).await?;
        Ok(())
    }

    async fn upsert_node_classification(
        &self,
        classification: &NodeClassification,
    ) -> Result<(), RepositoryError> {
        self.publish(GraphUpdate::NodeClassification(classification.clone())).await?;
        Ok(())
    }
}
