//! Node Classifier
//!
//! Assigns a type, risk level and confidence to an address by walking an
//! ordered decision pipeline:
//!
//! 1. blacklist, 2. sanctions (both final, CRITICAL),
//! 3. contract/EOA determination via the injected bytecode inspector,
//! 4. known-contract registry (final), 5. unknown-contract heuristic (final),
//! 6. exchange address patterns, 7. behavioral heuristics,
//! 8. classification rules, 9. default fallback.
//!
//! Risk only ever escalates as stages contribute.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::bytecode::BytecodeInspector;
use crate::registry::{RegistrySnapshot, RegistryStore};
use crate::transaction::{canonical_address, current_timestamp_millis, parse_address};

/// Transactions above which an address looks automated
pub const MEV_TRANSACTION_THRESHOLD: u64 = 10_000;

/// Average transaction value (native units) above which an address is a whale
pub const WHALE_AVERAGE_VALUE: f64 = 100.0;

/// Minimum connections in each direction for the hot-wallet heuristic
pub const HOT_WALLET_MIN_CONNECTIONS: u64 = 100;

/// Minimum transaction count for the hot-wallet heuristic
pub const HOT_WALLET_MIN_TRANSACTIONS: u64 = 1_000;

/// Minimum ratio between the smaller and larger connection count
pub const HOT_WALLET_SYMMETRY: f64 = 0.5;

/// Behavior tag keywords that mark mixer/privacy usage
pub const MIXER_KEYWORDS: &[&str] = &["mixer", "tornado", "privacy", "coinjoin"];

/// Prefix of behavior tags naming a protocol the address used
pub const PROTOCOL_TAG_PREFIX: &str = "protocol:";

const KNOWN_CONFIDENCE: f64 = 0.9;
const UNKNOWN_CONTRACT_CONFIDENCE: f64 = 0.6;
const EXCHANGE_PATTERN_CONFIDENCE: f64 = 0.8;
const HOT_WALLET_CONFIDENCE: f64 = 0.7;
const MIXER_CONFIDENCE: f64 = 0.75;
const MEV_CONFIDENCE_BOOST: f64 = 0.1;
const EOA_DEFAULT_CONFIDENCE: f64 = 0.4;
const UNRESOLVED_DEFAULT_CONFIDENCE: f64 = 0.3;
const CONTRACT_DEFAULT_CONFIDENCE: f64 = 0.35;
const RULE_SECONDARY_THRESHOLD: f64 = 0.6;

const RULE_REQUIRED_WEIGHT: f64 = 0.5;
const RULE_OPTIONAL_WEIGHT: f64 = 0.3;
const RULE_CRITERIA_WEIGHT: f64 = 0.2;

/// Address kinds the node classifier can assign
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeType {
    Eoa,
    ExchangeWallet,
    ExchangeHotWallet,
    Whale,
    MevBot,
    MixerWallet,
    ScamWallet,
    BlacklistedWallet,
    Sanctioned,
    TokenContract,
    DexContract,
    DefiContract,
    NftContract,
    BridgeContract,
    MultisigWallet,
    Unknown,
}

impl NodeType {
    /// Risk level an address of this type starts at
    pub fn default_risk(&self) -> RiskLevel {
        match self {
            NodeType::Eoa
            | NodeType::ExchangeWallet
            | NodeType::ExchangeHotWallet
            | NodeType::TokenContract
            | NodeType::DexContract
            | NodeType::DefiContract
            | NodeType::NftContract
            | NodeType::MultisigWallet => RiskLevel::Low,
            NodeType::Whale | NodeType::MevBot | NodeType::BridgeContract => RiskLevel::Medium,
            NodeType::MixerWallet | NodeType::ScamWallet => RiskLevel::High,
            NodeType::BlacklistedWallet | NodeType::Sanctioned => RiskLevel::Critical,
            NodeType::Unknown => RiskLevel::Unknown,
        }
    }

    pub fn is_contract(&self) -> bool {
        matches!(
            self,
            NodeType::TokenContract
                | NodeType::DexContract
                | NodeType::DefiContract
                | NodeType::NftContract
                | NodeType::BridgeContract
                | NodeType::MultisigWallet
        )
    }
}

/// Risk tiers; ordering is escalation order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RiskLevel {
    Unknown,
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    /// Higher of the two levels
    pub fn escalate(self, other: RiskLevel) -> RiskLevel {
        self.max(other)
    }
}

/// How a classification decision was reached
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DetectionMethod {
    Blacklist,
    Sanctions,
    Manual,
    Pattern,
    Heuristic,
    Behavioral,
    RuleEngine,
}

/// Usage statistics for an address over some window
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddressStats {
    pub transaction_count: u64,
    /// Total volume in native-token units
    pub total_volume: f64,
    pub incoming_connections: u64,
    pub outgoing_connections: u64,
}

impl AddressStats {
    pub fn average_value(&self) -> f64 {
        if self.transaction_count == 0 {
            0.0
        } else {
            self.total_volume / self.transaction_count as f64
        }
    }

    fn has_symmetric_connections(&self) -> bool {
        let low = self.incoming_connections.min(self.outgoing_connections);
        let high = self.incoming_connections.max(self.outgoing_connections);
        low >= HOT_WALLET_MIN_CONNECTIONS && low as f64 / high as f64 >= HOT_WALLET_SYMMETRY
    }
}

/// Behavioral rule evaluated by the rule-engine stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassificationRule {
    pub name: String,
    pub target_type: NodeType,
    /// All must match a behavior tag, otherwise the rule scores zero
    #[serde(default)]
    pub required_patterns: Vec<String>,
    #[serde(default)]
    pub optional_patterns: Vec<String>,
    /// Any match zeroes the score
    #[serde(default)]
    pub excluded_patterns: Vec<String>,
    pub min_confidence: f64,
    pub weight: f64,
    #[serde(default)]
    pub min_transaction_count: Option<u64>,
    #[serde(default)]
    pub min_volume: Option<f64>,
    /// Window, in seconds, the statistics for this rule are expected to cover
    #[serde(default)]
    pub timeframe_secs: Option<u64>,
}

impl ClassificationRule {
    /// Score in [0, 1] for the supplied tags and statistics
    pub fn score(&self, tags: &[String], stats: Option<&AddressStats>) -> f64 {
        let matches = |pattern: &String| tag_matches(tags, pattern);

        if self.excluded_patterns.iter().any(matches) {
            return 0.0;
        }
        if !self.required_patterns.iter().all(matches) {
            return 0.0;
        }

        let optional = if self.optional_patterns.is_empty() {
            0.0
        } else {
            self.optional_patterns.iter().filter(|p| matches(p)).count() as f64
                / self.optional_patterns.len() as f64
        };

        let mut criteria_set = 0usize;
        let mut criteria_met = 0usize;
        if let Some(min_count) = self.min_transaction_count {
            criteria_set += 1;
            if stats.is_some_and(|s| s.transaction_count >= min_count) {
                criteria_met += 1;
            }
        }
        if let Some(min_volume) = self.min_volume {
            criteria_set += 1;
            if stats.is_some_and(|s| s.total_volume >= min_volume) {
                criteria_met += 1;
            }
        }
        let criteria = if criteria_set == 0 {
            0.0
        } else {
            criteria_met as f64 / criteria_set as f64
        };

        let score = RULE_REQUIRED_WEIGHT
            + RULE_OPTIONAL_WEIGHT * optional
            + RULE_CRITERIA_WEIGHT * criteria;
        (score * self.weight).min(1.0)
    }
}

fn tag_matches(tags: &[String], pattern: &str) -> bool {
    let pattern = pattern.to_ascii_lowercase();
    tags.iter()
        .any(|tag| tag.to_ascii_lowercase().contains(&pattern))
}

fn rule(name: &str, target_type: NodeType, required: &[&str], optional: &[&str]) -> ClassificationRule {
    ClassificationRule {
        name: name.to_string(),
        target_type,
        required_patterns: required.iter().map(|p| p.to_string()).collect(),
        optional_patterns: optional.iter().map(|p| p.to_string()).collect(),
        excluded_patterns: Vec::new(),
        min_confidence: 0.5,
        weight: 1.0,
        min_transaction_count: None,
        min_volume: None,
        timeframe_secs: None,
    }
}

/// Built-in classification rules
pub fn default_classification_rules() -> Vec<ClassificationRule> {
    vec![
        ClassificationRule {
            min_transaction_count: Some(100),
            timeframe_secs: Some(86_400),
            ..rule(
                "mev_searcher",
                NodeType::MevBot,
                &["dex_trader", "multicall_user"],
                &["arbitrage", "sandwich", "flashloan", "frontrun"],
            )
        },
        ClassificationRule {
            min_volume: Some(1_000.0),
            ..rule("whale_activity", NodeType::Whale, &["large_transfer"], &["cold_storage", "otc"])
        },
        ClassificationRule {
            excluded_patterns: vec!["mixer".to_string()],
            min_transaction_count: Some(HOT_WALLET_MIN_TRANSACTIONS),
            ..rule(
                "exchange_sweeper",
                NodeType::ExchangeHotWallet,
                &["deposit_sweep"],
                &["withdrawal_batch", "exchange"],
            )
        },
        ClassificationRule {
            weight: 1.2,
            ..rule("phishing_reports", NodeType::ScamWallet, &["phishing"], &["drainer", "scam", "approval_exploit"])
        },
    ]
}

/// Final classification of one address
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeClassification {
    /// Lower-cased canonical key
    pub address: String,
    pub primary_type: NodeType,
    pub secondary_types: Vec<NodeType>,
    pub risk_level: RiskLevel,
    pub confidence: f64,
    /// In the order the methods contributed
    pub detection_methods: Vec<DetectionMethod>,
    pub tags: Vec<String>,
    pub associated_exchanges: Vec<String>,
    pub associated_protocols: Vec<String>,
    pub suspicious_activities: Vec<String>,
    pub blacklist_reasons: Vec<String>,
    pub sanction_reasons: Vec<String>,
    pub classification_count: u64,
    /// Milliseconds since the epoch
    pub last_classified: u64,
    pub network: String,
}

impl NodeClassification {
    fn new(address: String, network: &str) -> Self {
        Self {
            address,
            primary_type: NodeType::Unknown,
            secondary_types: Vec::new(),
            risk_level: RiskLevel::Unknown,
            confidence: 0.0,
            detection_methods: Vec::new(),
            tags: Vec::new(),
            associated_exchanges: Vec::new(),
            associated_protocols: Vec::new(),
            suspicious_activities: Vec::new(),
            blacklist_reasons: Vec::new(),
            sanction_reasons: Vec::new(),
            classification_count: 1,
            last_classified: current_timestamp_millis(),
            network: network.to_string(),
        }
    }

    /// Carry the re-classification count forward from an earlier result
    pub fn supersede(&mut self, previous: &NodeClassification) {
        self.classification_count = previous.classification_count + 1;
    }

    fn set_primary(&mut self, node_type: NodeType, confidence: f64, method: DetectionMethod) {
        self.primary_type = node_type;
        self.confidence = confidence;
        self.risk_level = self.risk_level.escalate(node_type.default_risk());
        self.add_method(method);
    }

    fn add_method(&mut self, method: DetectionMethod) {
        if !self.detection_methods.contains(&method) {
            self.detection_methods.push(method);
        }
    }

    /// Secondary types escalate risk the same way a primary type does
    fn add_secondary(&mut self, node_type: NodeType) {
        if node_type != self.primary_type && !self.secondary_types.contains(&node_type) {
            self.secondary_types.push(node_type);
            self.risk_level = self.risk_level.escalate(node_type.default_risk());
        }
    }

    fn add_tag(&mut self, tag: &str) {
        if !self.tags.iter().any(|t| t == tag) {
            self.tags.push(tag.to_string());
        }
    }
}

/// Outcome of the contract/EOA stage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContractStatus {
    Contract,
    Eoa,
    /// No inspector, an unparseable address, or a failed lookup
    Unresolved,
}

/// Ordered-stage node classifier
pub struct NodeClassifier {
    registry: Arc<RegistryStore>,
    inspector: Option<Arc<dyn BytecodeInspector>>,
    network: String,
}

impl NodeClassifier {
    /// Create a classifier without bytecode inspection
    ///
    /// The contract/EOA stage then always reports [`ContractStatus::Unresolved`].
    pub fn new(registry: Arc<RegistryStore>, network: impl Into<String>) -> Self {
        Self {
            registry,
            inspector: None,
            network: network.into(),
        }
    }

    pub fn with_inspector(mut self, inspector: Arc<dyn BytecodeInspector>) -> Self {
        self.inspector = Some(inspector);
        self
    }

    pub fn has_inspector(&self) -> bool {
        self.inspector.is_some()
    }

    /// Classify one address
    pub async fn classify_node(
        &self,
        address: &str,
        stats: Option<&AddressStats>,
        behavior_tags: &[String],
    ) -> NodeClassification {
        let address = canonical_address(address);
        let snapshot = self.registry.snapshot();
        let mut c = NodeClassification::new(address.clone(), &self.network);

        if let Some(reason) = snapshot.blacklist_reason(&address) {
            c.blacklist_reasons.push(reason.to_string());
            c.add_tag("blacklisted");
            c.set_primary(NodeType::BlacklistedWallet, 1.0, DetectionMethod::Blacklist);
            c.risk_level = RiskLevel::Critical;
            return c;
        }

        if let Some(detail) = snapshot.sanction_detail(&address) {
            c.sanction_reasons.push(detail.to_string());
            c.add_tag("sanctioned");
            c.set_primary(NodeType::Sanctioned, 1.0, DetectionMethod::Sanctions);
            c.risk_level = RiskLevel::Critical;
            return c;
        }

        let status = self.contract_status(&address).await;

        if let Some(known) = snapshot.known_contract(&address) {
            c.add_tag("known");
            c.set_primary(known, KNOWN_CONFIDENCE, DetectionMethod::Manual);
            return c;
        }

        if status == ContractStatus::Contract {
            c.add_tag("contract");
            c.add_tag("bytecode_detected");
            c.set_primary(
                NodeType::TokenContract,
                UNKNOWN_CONTRACT_CONFIDENCE,
                DetectionMethod::Heuristic,
            );
            return c;
        }

        let mut resolved = false;
        if let Some(exchange) = snapshot.match_exchange(&address) {
            c.associated_exchanges.push(exchange.to_string());
            c.add_tag("exchange");
            c.set_primary(
                NodeType::ExchangeWallet,
                EXCHANGE_PATTERN_CONFIDENCE,
                DetectionMethod::Pattern,
            );
            resolved = true;
        }

        let boost = self.apply_behavior(&mut c, &mut resolved, stats, behavior_tags);
        self.apply_rules(&snapshot, &mut c, &mut resolved, stats, behavior_tags);

        if !resolved {
            let (node_type, confidence) = match status {
                ContractStatus::Eoa => (NodeType::Eoa, EOA_DEFAULT_CONFIDENCE),
                ContractStatus::Unresolved => (NodeType::Eoa, UNRESOLVED_DEFAULT_CONFIDENCE),
                ContractStatus::Contract => (NodeType::TokenContract, CONTRACT_DEFAULT_CONFIDENCE),
            };
            c.set_primary(node_type, confidence, DetectionMethod::Heuristic);
            c.secondary_types.retain(|t| *t != node_type);
        }

        c.confidence = (c.confidence + boost).min(1.0);
        debug!(
            "Classified {} as {:?} ({:?}, {:.2})",
            c.address, c.primary_type, c.risk_level, c.confidence
        );
        c
    }

    /// Re-classify an address, carrying the classification count forward
    pub async fn reclassify(
        &self,
        previous: &NodeClassification,
        stats: Option<&AddressStats>,
        behavior_tags: &[String],
    ) -> NodeClassification {
        let mut next = self.classify_node(&previous.address, stats, behavior_tags).await;
        next.supersede(previous);
        next
    }

    /// Contract/EOA determination; failures degrade to `Unresolved`
    pub async fn contract_status(&self, address: &str) -> ContractStatus {
        let Some(inspector) = &self.inspector else {
            return ContractStatus::Unresolved;
        };
        let Some(parsed) = parse_address(address) else {
            warn!("Cannot inspect bytecode of malformed address {}", address);
            return ContractStatus::Unresolved;
        };

        match inspector.is_contract(parsed).await {
            Ok(true) => ContractStatus::Contract,
            Ok(false) => ContractStatus::Eoa,
            Err(e) => {
                warn!("Bytecode lookup failed for {}: {}", address, e);
                ContractStatus::Unresolved
            }
        }
    }

    /// Behavioral heuristics; returns the confidence boost to apply at the end
    fn apply_behavior(
        &self,
        c: &mut NodeClassification,
        resolved: &mut bool,
        stats: Option<&AddressStats>,
        tags: &[String],
    ) -> f64 {
        let mut boost = 0.0;

        for tag in tags {
            if let Some(protocol) = tag.strip_prefix(PROTOCOL_TAG_PREFIX) {
                if !c.associated_protocols.iter().any(|p| p == protocol) {
                    c.associated_protocols.push(protocol.to_string());
                }
            }
        }

        if let Some(stats) = stats {
            if stats.transaction_count > MEV_TRANSACTION_THRESHOLD {
                c.add_secondary(NodeType::MevBot);
                c.add_tag("high_frequency");
                c.add_method(DetectionMethod::Behavioral);
                boost += MEV_CONFIDENCE_BOOST;
            }

            if stats.average_value() > WHALE_AVERAGE_VALUE {
                c.add_secondary(NodeType::Whale);
                c.add_tag("high_value");
                c.add_method(DetectionMethod::Behavioral);
            }

            if !*resolved
                && stats.transaction_count > HOT_WALLET_MIN_TRANSACTIONS
                && stats.has_symmetric_connections()
            {
                c.set_primary(
                    NodeType::ExchangeHotWallet,
                    HOT_WALLET_CONFIDENCE,
                    DetectionMethod::Behavioral,
                );
                *resolved = true;
            }
        }

        let mixer_tag = tags.iter().find(|tag| {
            let lower = tag.to_ascii_lowercase();
            MIXER_KEYWORDS.iter().any(|k| lower.contains(k))
        });
        if let Some(tag) = mixer_tag {
            c.suspicious_activities
                .push(format!("behavior tag '{tag}' indicates mixer usage"));
            c.add_tag("mixer");
            c.set_primary(NodeType::MixerWallet, MIXER_CONFIDENCE, DetectionMethod::Behavioral);
            c.risk_level = c.risk_level.escalate(RiskLevel::High);
            c.secondary_types.retain(|t| *t != NodeType::MixerWallet);
            *resolved = true;
        }

        boost
    }

    fn apply_rules(
        &self,
        snapshot: &RegistrySnapshot,
        c: &mut NodeClassification,
        resolved: &mut bool,
        stats: Option<&AddressStats>,
        tags: &[String],
    ) {
        for rule in snapshot.classification_rules() {
            let score = rule.score(tags, stats);
            if score <= 0.0 || score < rule.min_confidence {
                continue;
            }

            if !*resolved {
                c.set_primary(rule.target_type, score, DetectionMethod::RuleEngine);
                *resolved = true;
            } else if score > RULE_SECONDARY_THRESHOLD {
                c.add_secondary(rule.target_type);
                c.add_method(DetectionMethod::RuleEngine);
            } else {
                continue;
            }
            c.add_tag(&format!("rule:{}", rule.name));
        }
    }
}
