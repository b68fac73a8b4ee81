//! ChainGraph Ingestor Library
//!
//! This crate provides components for ingesting blockchain transactions,
//! decoding contract interactions, classifying contracts and addresses, and
//! publishing the resulting relationship graph to Redis.

pub mod bytecode;
pub mod config;
pub mod contract;
pub mod decoder;
pub mod interaction;
pub mod node;
pub mod pipeline;
pub mod publisher;
pub mod queue;
pub mod registry;
pub mod repository;
pub mod risk;
pub mod signatures;
pub mod transaction;

// Re-export commonly used types
pub use bytecode::{BytecodeInspector, InMemoryBytecodeInspector, IpcBytecodeInspector};
pub use crate::config::AppConfig;
pub use contract::{ContractClassification, ContractClassifier, ContractType, RescoreStrategy};
pub use decoder::{decode_interactions, DecodeError};
pub use interaction::{InteractionRecord, InteractionType};
pub use node::{AddressStats, NodeClassification, NodeClassifier, NodeType, RiskLevel};
pub use pipeline::{BatchProcessor, IngestionPipeline, PipelineConfig, PipelineStats};
pub use publisher::{GraphMessage, GraphUpdate, RedisGraphPublisher};
pub use queue::{RedisTransactionQueue, RetryPolicy, TransactionSource};
pub use registry::RegistryStore;
pub use repository::{GraphRepository, MemoryRepository, RelationshipRecord, WalletRecord};
pub use risk::{assess_risk, RiskAssessment};
pub use signatures::{get_method_name, MethodSignature};
pub use transaction::Transaction;
