//! Registry Store
//!
//! Lookup tables consulted by the classifiers: blacklist, sanctions, known
//! contracts, exchange address patterns and both rule sets.
//!
//! Readers take an `Arc` snapshot that never changes underneath them. Writers
//! copy the current snapshot, apply one mutation and swap it in, bumping the
//! version. Updates are rare compared to classification reads.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, RwLock};

use alloy::primitives::{address, Address};
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::contract::{default_contract_rules, ContractClassificationRule};
use crate::node::{default_classification_rules, ClassificationRule, NodeType};
use crate::transaction::{canonical_address, format_address};

/// Uniswap V2 Router 02
pub const UNISWAP_V2_ROUTER: Address = address!("7a250d5630B4cF539739dF2C5dAcb4c659F2488D");

/// Uniswap V3 SwapRouter
pub const UNISWAP_V3_ROUTER: Address = address!("E592427A0AEce92De3Edee1F18E0157C05861564");

/// Wrapped Ether
pub const WETH: Address = address!("C02aaA39b223FE8D0A0e5C4F27eAD9083C756Cc2");

/// USD Coin
pub const USDC: Address = address!("A0b86991c6218b36c1d19D4a2e9Eb0cE3606eB48");

/// Aave V2 lending pool
pub const AAVE_V2_POOL: Address = address!("7d2768dE32b0b80b7a3454c06BdAc94A69DDc7A9");

/// Tornado Cash router
pub const TORNADO_ROUTER: Address = address!("722122dF12D4e14e13Ac3b6895a86e84145b6967");

/// Errors that can occur while mutating or seeding the registry
#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("Invalid pattern for exchange {exchange}: {source}")]
    InvalidPattern {
        exchange: String,
        #[source]
        source: regex::Error,
    },

    #[error("Failed to read registry seed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse registry seed: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Compiled address patterns of one exchange
#[derive(Debug, Clone)]
pub struct ExchangePatterns {
    pub exchange: String,
    pub patterns: Vec<Regex>,
}

/// Immutable view of every registry table
#[derive(Debug, Clone, Default)]
pub struct RegistrySnapshot {
    version: u64,
    blacklist: HashMap<String, String>,
    sanctions: HashMap<String, String>,
    known_contracts: HashMap<String, NodeType>,
    /// Insertion order decides which exchange matches first
    exchange_patterns: Vec<ExchangePatterns>,
    rules: Vec<ClassificationRule>,
    contract_rules: Vec<ContractClassificationRule>,
}

impl RegistrySnapshot {
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Blacklist reason for a canonical address
    pub fn blacklist_reason(&self, address: &str) -> Option<&str> {
        self.blacklist.get(address).map(String::as_str)
    }

    /// Sanction detail for a canonical address
    pub fn sanction_detail(&self, address: &str) -> Option<&str> {
        self.sanctions.get(address).map(String::as_str)
    }

    pub fn known_contract(&self, address: &str) -> Option<NodeType> {
        self.known_contracts.get(address).copied()
    }

    /// Name of the first exchange with a pattern matching the address
    pub fn match_exchange(&self, address: &str) -> Option<&str> {
        self.exchange_patterns
            .iter()
            .find(|entry| entry.patterns.iter().any(|p| p.is_match(address)))
            .map(|entry| entry.exchange.as_str())
    }

    pub fn classification_rules(&self) -> &[ClassificationRule] {
        &self.rules
    }

    pub fn contract_rules(&self) -> &[ContractClassificationRule] {
        &self.contract_rules
    }

    pub fn blacklist_len(&self) -> usize {
        self.blacklist.len()
    }

    pub fn sanctions_len(&self) -> usize {
        self.sanctions.len()
    }

    pub fn known_contracts_len(&self) -> usize {
        self.known_contracts.len()
    }
}

/// Registry contents loadable from JSON
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RegistrySeed {
    /// address -> reason
    pub blacklist: HashMap<String, String>,
    /// address -> sanction detail
    pub sanctions: HashMap<String, String>,
    pub known_contracts: HashMap<String, NodeType>,
    /// exchange name -> address regexes
    pub exchange_patterns: HashMap<String, Vec<String>>,
    pub rules: Vec<ClassificationRule>,
    pub contract_rules: Vec<ContractClassificationRule>,
}

/// Versioned copy-on-write registry shared by the classifiers
#[derive(Debug, Default)]
pub struct RegistryStore {
    current: RwLock<Arc<RegistrySnapshot>>,
}

impl RegistryStore {
    /// Empty registry with no rules
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in contracts, exchange wallets and rule sets
    pub fn with_defaults() -> Self {
        let mut snapshot = RegistrySnapshot {
            rules: default_classification_rules(),
            contract_rules: default_contract_rules(),
            ..Default::default()
        };

        for (contract, node_type) in [
            (UNISWAP_V2_ROUTER, NodeType::DexContract),
            (UNISWAP_V3_ROUTER, NodeType::DexContract),
            (WETH, NodeType::TokenContract),
            (USDC, NodeType::TokenContract),
            (AAVE_V2_POOL, NodeType::DefiContract),
        ] {
            snapshot.known_contracts.insert(format_address(contract), node_type);
        }
        snapshot.sanctions.insert(
            format_address(TORNADO_ROUTER),
            "OFAC SDN: Tornado Cash router".to_string(),
        );

        for (exchange, patterns) in default_exchange_patterns() {
            // Built-in patterns are anchored literals and always compile
            if let Ok(compiled) = compile_patterns(exchange, patterns) {
                snapshot.exchange_patterns.push(ExchangePatterns {
                    exchange: exchange.to_string(),
                    patterns: compiled,
                });
            }
        }

        Self {
            current: RwLock::new(Arc::new(snapshot)),
        }
    }

    /// Current immutable snapshot
    pub fn snapshot(&self) -> Arc<RegistrySnapshot> {
        match self.current.read() {
            Ok(guard) => Arc::clone(&*guard),
            Err(poisoned) => Arc::clone(&*poisoned.into_inner()),
        }
    }

    pub fn version(&self) -> u64 {
        self.snapshot().version
    }

    /// Copy the snapshot, apply `mutate`, and publish the result
    fn update(&self, mutate: impl FnOnce(&mut RegistrySnapshot)) -> u64 {
        let mut guard = match self.current.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut next = RegistrySnapshot::clone(&**guard);
        mutate(&mut next);
        next.version += 1;
        let version = next.version;
        *guard = Arc::new(next);
        version
    }

    pub fn add_blacklisted(&self, address: &str, reason: &str) -> u64 {
        let key = canonical_address(address);
        debug!("Blacklisting {}", key);
        self.update(|s| {
            s.blacklist.insert(key, reason.to_string());
        })
    }

    pub fn remove_blacklisted(&self, address: &str) -> u64 {
        let key = canonical_address(address);
        self.update(|s| {
            s.blacklist.remove(&key);
        })
    }

    pub fn add_sanctioned(&self, address: &str, detail: &str) -> u64 {
        let key = canonical_address(address);
        debug!("Adding sanctioned address {}", key);
        self.update(|s| {
            s.sanctions.insert(key, detail.to_string());
        })
    }

    pub fn add_known_contract(&self, address: &str, node_type: NodeType) -> u64 {
        let key = canonical_address(address);
        self.update(|s| {
            s.known_contracts.insert(key, node_type);
        })
    }

    /// Append address patterns for an exchange
    ///
    /// All patterns are compiled before anything is published, so one
    /// invalid pattern leaves the registry unchanged.
    pub fn add_exchange_patterns<S: AsRef<str>>(
        &self,
        exchange: &str,
        patterns: &[S],
    ) -> Result<u64, RegistryError> {
        let compiled = compile_patterns(exchange, patterns)?;
        Ok(self.update(|s| {
            match s.exchange_patterns.iter_mut().find(|e| e.exchange == exchange) {
                Some(entry) => entry.patterns.extend(compiled),
                None => s.exchange_patterns.push(ExchangePatterns {
                    exchange: exchange.to_string(),
                    patterns: compiled,
                }),
            }
        }))
    }

    pub fn register_rule(&self, rule: ClassificationRule) -> u64 {
        info!("Registering classification rule {}", rule.name);
        self.update(|s| s.rules.push(rule))
    }

    pub fn register_contract_rule(&self, rule: ContractClassificationRule) -> u64 {
        info!("Registering contract rule for {:?}", rule.contract_type);
        self.update(|s| s.contract_rules.push(rule))
    }

    /// Merge a seed into the registry
    ///
    /// Patterns are validated first; on error nothing from the seed is applied.
    pub fn apply_seed(&self, seed: RegistrySeed) -> Result<u64, RegistryError> {
        let mut exchanges: Vec<(&String, &Vec<String>)> = seed.exchange_patterns.iter().collect();
        exchanges.sort_by(|a, b| a.0.cmp(b.0));

        let mut compiled = Vec::with_capacity(exchanges.len());
        for (exchange, patterns) in exchanges {
            compiled.push((exchange.clone(), compile_patterns(exchange, patterns)?));
        }

        let version = self.update(|s| {
            for (address, reason) in seed.blacklist {
                s.blacklist.insert(canonical_address(&address), reason);
            }
            for (address, detail) in seed.sanctions {
                s.sanctions.insert(canonical_address(&address), detail);
            }
            for (address, node_type) in seed.known_contracts {
                s.known_contracts.insert(canonical_address(&address), node_type);
            }
            for (exchange, patterns) in compiled {
                match s.exchange_patterns.iter_mut().find(|e| e.exchange == exchange) {
                    Some(entry) => entry.patterns.extend(patterns),
                    None => s.exchange_patterns.push(ExchangePatterns { exchange, patterns }),
                }
            }
            s.rules.extend(seed.rules);
            s.contract_rules.extend(seed.contract_rules);
        });

        let snapshot = self.snapshot();
        info!(
            "Registry seeded (version {}): {} blacklisted, {} sanctioned, {} known contracts",
            version,
            snapshot.blacklist_len(),
            snapshot.sanctions_len(),
            snapshot.known_contracts_len()
        );
        Ok(version)
    }

    /// Read a JSON seed file and merge it
    pub fn load_seed(&self, path: impl AsRef<Path>) -> Result<u64, RegistryError> {
        let raw = std::fs::read_to_string(path)?;
        let seed: RegistrySeed = serde_json::from_str(&raw)?;
        self.apply_seed(seed)
    }
}

fn compile_patterns<S: AsRef<str>>(exchange: &str, patterns: &[S]) -> Result<Vec<Regex>, RegistryError> {
    patterns
        .iter()
        .map(|p| {
            Regex::new(p.as_ref()).map_err(|source| RegistryError::InvalidPattern {
                exchange: exchange.to_string(),
                source,
            })
        })
        .collect()
}

fn default_exchange_patterns() -> [(&'static str, &'static [&'static str]); 3] {
    [
        (
            "binance",
            &[
                "^0x28c6c06298d514db089934071355e5743bf21d60$",
                "^0x3f5ce5fbfe3e9af3971dd833d26ba9b5c936f0be$",
                "^0xdfd5293d8e347dfe59e90efd55b2956a1343963d$",
            ],
        ),
        (
            "coinbase",
            &[
                "^0x71660c4005ba85c37ccec55d0c4493e66fe775d3$",
                "^0xa9d1e08c7793af67e9d92fe308d5697fb81d3e43$",
            ],
        ),
        ("kraken", &["^0x2910543af39aba0cd09dbb2d50200b3e800a63d2$"]),
    ]
}
