//! Contract Classifier
//!
//! Scores a contract's accumulated interaction history against the registered
//! contract-type rules. Histograms update on every interaction; the full
//! rule evaluation runs only when the re-scoring strategy says it is due.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::interaction::{InteractionRecord, InteractionType};
use crate::registry::RegistryStore;
use crate::signatures::{lookup_hex, MethodSignature};
use crate::transaction::canonical_address;

/// Default number of accumulated interactions between full re-scorings
pub const DEFAULT_RESCORE_INTERVAL: u64 = 100;

/// Raw score above which a type is kept as secondary even without clearing its rule
pub const SECONDARY_SCORE_THRESHOLD: f64 = 0.5;

const REQUIRED_WEIGHT: f64 = 0.6;
const OPTIONAL_WEIGHT: f64 = 0.2;
const EXCLUSION_WEIGHT: f64 = 0.1;
const PATTERN_WEIGHT: f64 = 0.1;

/// Contract kinds the classifier can assign
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ContractType {
    Erc20Token,
    Erc721Nft,
    Erc1155MultiToken,
    WrappedNative,
    DexRouter,
    LendingPool,
    YieldVault,
    Staking,
    Multicall,
    Multisig,
    Unknown,
}

impl ContractType {
    /// Broad category, used as a tag
    pub fn category(&self) -> &'static str {
        match self {
            ContractType::Erc20Token | ContractType::WrappedNative => "token",
            ContractType::Erc721Nft | ContractType::Erc1155MultiToken => "nft",
            ContractType::DexRouter
            | ContractType::LendingPool
            | ContractType::YieldVault
            | ContractType::Staking => "defi",
            ContractType::Multicall | ContractType::Multisig => "infrastructure",
            ContractType::Unknown => "unknown",
        }
    }

    pub fn is_defi(&self) -> bool {
        self.category() == "defi"
    }

    /// Interaction an unfamiliar call to this kind of contract most likely is
    pub fn probable_interaction(&self) -> Option<InteractionType> {
        match self {
            ContractType::DexRouter => Some(InteractionType::Swap),
            ContractType::WrappedNative
            | ContractType::LendingPool
            | ContractType::YieldVault
            | ContractType::Staking => Some(InteractionType::Deposit),
            ContractType::Multicall => Some(InteractionType::Multicall),
            ContractType::Erc20Token
            | ContractType::Erc721Nft
            | ContractType::Erc1155MultiToken
            | ContractType::Multisig
            | ContractType::Unknown => None,
        }
    }
}

/// Contract type a single method is evidence of
fn contract_type_for(method: MethodSignature) -> ContractType {
    use MethodSignature::*;
    match method {
        Transfer | TransferFrom | Approve | IncreaseAllowance | DecreaseAllowance | Mint
        | Burn | BalanceOf | TotalSupply | Allowance => ContractType::Erc20Token,
        SwapExactTokensForTokens | SwapTokensForExactTokens | SwapExactEthForTokens
        | SwapExactTokensForEth | SwapEthForExactTokens | SwapTokensForExactEth
        | SwapExactTokensForTokensSupportingFee | AddLiquidity | AddLiquidityEth
        | RemoveLiquidity | RemoveLiquidityEth | ExactInputSingle | ExactInput
        | ExactOutputSingle | ExactOutput | UniversalRouterExecute | MulticallWithDeadline => {
            ContractType::DexRouter
        }
        Multicall | Aggregate => ContractType::Multicall,
        Deposit | Withdraw => ContractType::WrappedNative,
        DepositAmount | VaultDeposit | VaultWithdraw => ContractType::YieldVault,
        LendingDeposit | LendingWithdraw | LendingBorrow | LendingRepay => {
            ContractType::LendingPool
        }
        Stake | GetReward => ContractType::Staking,
        SafeTransferFrom | SafeTransferFromWithData | SetApprovalForAll | OwnerOf => {
            ContractType::Erc721Nft
        }
        MultiTokenSafeTransferFrom | MultiTokenSafeBatchTransferFrom => {
            ContractType::Erc1155MultiToken
        }
        ExecTransaction => ContractType::Multisig,
    }
}

/// O(1) contract-type lookup for a single method signature
pub fn classify_from_method_signature(signature: &str) -> ContractType {
    lookup_hex(signature)
        .map(contract_type_for)
        .unwrap_or(ContractType::Unknown)
}

/// Rule scoring a contract's method and interaction histograms
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContractClassificationRule {
    pub contract_type: ContractType,
    /// Selectors as 8 hex chars
    #[serde(default)]
    pub required_methods: Vec<String>,
    #[serde(default)]
    pub optional_methods: Vec<String>,
    #[serde(default)]
    pub excluded_methods: Vec<String>,
    #[serde(default)]
    pub interaction_patterns: Vec<InteractionType>,
    pub min_confidence: f64,
    pub weight: f64,
}

impl ContractClassificationRule {
    fn new(contract_type: ContractType, min_confidence: f64, weight: f64) -> Self {
        Self {
            contract_type,
            required_methods: Vec::new(),
            optional_methods: Vec::new(),
            excluded_methods: Vec::new(),
            interaction_patterns: Vec::new(),
            min_confidence,
            weight,
        }
    }

    fn required(mut self, methods: &[MethodSignature]) -> Self {
        self.required_methods = methods.iter().map(|m| m.hex()).collect();
        self
    }

    fn optional(mut self, methods: &[MethodSignature]) -> Self {
        self.optional_methods = methods.iter().map(|m| m.hex()).collect();
        self
    }

    fn excluded(mut self, methods: &[MethodSignature]) -> Self {
        self.excluded_methods = methods.iter().map(|m| m.hex()).collect();
        self
    }

    fn patterns(mut self, patterns: &[InteractionType]) -> Self {
        self.interaction_patterns = patterns.to_vec();
        self
    }

    /// Raw score in [0, 1] for the given histograms
    ///
    /// Required methods only count when every one of them was seen; the other
    /// components still apply when they were not. Empty required, optional and
    /// pattern lists contribute zero; an empty excluded list always earns the
    /// exclusion credit.
    pub fn score(
        &self,
        methods: &BTreeMap<String, u64>,
        interactions: &BTreeMap<InteractionType, u64>,
    ) -> f64 {
        let required_fraction = seen_fraction(&self.required_methods, methods);
        let required = if required_fraction >= 1.0 { 1.0 } else { 0.0 };
        let optional = seen_fraction(&self.optional_methods, methods);
        let no_excluded = if self
            .excluded_methods
            .iter()
            .any(|sig| methods.contains_key(sig))
        {
            0.0
        } else {
            1.0
        };
        let patterns = fraction(
            self.interaction_patterns.iter().filter(|p| interactions.contains_key(*p)).count(),
            self.interaction_patterns.len(),
        );

        let score = REQUIRED_WEIGHT * required
            + OPTIONAL_WEIGHT * optional
            + EXCLUSION_WEIGHT * no_excluded
            + PATTERN_WEIGHT * patterns;
        score.min(1.0)
    }
}

fn seen_fraction(signatures: &[String], methods: &BTreeMap<String, u64>) -> f64 {
    let matched = signatures
        .iter()
        .filter(|sig| methods.contains_key(sig.as_str()))
        .count();
    fraction(matched, signatures.len())
}

fn fraction(matched: usize, total: usize) -> f64 {
    if total == 0 {
        0.0
    } else {
        matched as f64 / total as f64
    }
}

/// Built-in contract classification rules
pub fn default_contract_rules() -> Vec<ContractClassificationRule> {
    use MethodSignature::*;
    let mut rules = vec![
        ContractClassificationRule::new(ContractType::Erc20Token, 0.5, 1.0)
            .required(&[Transfer])
            .optional(&[TransferFrom, Approve, IncreaseAllowance, DecreaseAllowance, Mint, Burn])
            .excluded(&[SafeTransferFrom, MultiTokenSafeTransferFrom])
            .patterns(&[InteractionType::Transfer, InteractionType::Approve]),
        ContractClassificationRule::new(ContractType::Erc721Nft, 0.5, 1.0)
            .required(&[SetApprovalForAll])
            .optional(&[SafeTransferFrom, SafeTransferFromWithData, TransferFrom, Approve, OwnerOf])
            .excluded(&[Transfer, MultiTokenSafeTransferFrom])
            .patterns(&[InteractionType::TransferFrom, InteractionType::Approve]),
        ContractClassificationRule::new(ContractType::Erc1155MultiToken, 0.5, 1.0)
            .required(&[MultiTokenSafeTransferFrom])
            .optional(&[MultiTokenSafeBatchTransferFrom, SetApprovalForAll])
            .excluded(&[Transfer]),
        ContractClassificationRule::new(ContractType::WrappedNative, 0.6, 1.1)
            .required(&[Deposit, Withdraw])
            .optional(&[Transfer, Approve, TransferFrom])
            .patterns(&[InteractionType::Deposit, InteractionType::Withdraw]),
        ContractClassificationRule::new(ContractType::LendingPool, 0.5, 1.0)
            .required(&[LendingDeposit])
            .optional(&[LendingWithdraw, LendingBorrow, LendingRepay])
            .patterns(&[InteractionType::Deposit, InteractionType::Withdraw]),
        ContractClassificationRule::new(ContractType::YieldVault, 0.5, 1.0)
            .required(&[VaultDeposit])
            .optional(&[VaultWithdraw, DepositAmount])
            .patterns(&[InteractionType::Deposit, InteractionType::Withdraw]),
        ContractClassificationRule::new(ContractType::Staking, 0.5, 1.0)
            .required(&[Stake])
            .optional(&[GetReward, Withdraw])
            .patterns(&[InteractionType::Deposit]),
        ContractClassificationRule::new(ContractType::Multicall, 0.5, 1.0)
            .required(&[Aggregate])
            .optional(&[Multicall])
            .patterns(&[InteractionType::Multicall]),
        ContractClassificationRule::new(ContractType::Multisig, 0.5, 1.0)
            .required(&[ExecTransaction]),
    ];
    rules.extend(router_rules());
    rules
}

/// One router rule per swap entry point, so any single entry identifies the router
fn router_rules() -> Vec<ContractClassificationRule> {
    use MethodSignature::*;
    const V2_SWAPS: [MethodSignature; 7] = [
        SwapExactTokensForTokens,
        SwapTokensForExactTokens,
        SwapExactEthForTokens,
        SwapExactTokensForEth,
        SwapEthForExactTokens,
        SwapTokensForExactEth,
        SwapExactTokensForTokensSupportingFee,
    ];
    const V2_LIQUIDITY: [MethodSignature; 4] =
        [AddLiquidity, AddLiquidityEth, RemoveLiquidity, RemoveLiquidityEth];
    const V3_SWAPS: [MethodSignature; 4] =
        [ExactInputSingle, ExactInput, ExactOutputSingle, ExactOutput];

    let v2 = V2_SWAPS.iter().map(|&entry| {
        let optional: Vec<MethodSignature> = V2_SWAPS
            .iter()
            .chain(V2_LIQUIDITY.iter())
            .copied()
            .filter(|&m| m != entry)
            .collect();
        ContractClassificationRule::new(ContractType::DexRouter, 0.3, 1.0)
            .required(&[entry])
            .optional(&optional)
            .excluded(&[Transfer])
            .patterns(&[
                InteractionType::Swap,
                InteractionType::AddLiquidity,
                InteractionType::RemoveLiquidity,
            ])
    });
    let v3 = V3_SWAPS.iter().map(|&entry| {
        let optional: Vec<MethodSignature> = V3_SWAPS
            .iter()
            .chain([Multicall, MulticallWithDeadline].iter())
            .copied()
            .filter(|&m| m != entry)
            .collect();
        ContractClassificationRule::new(ContractType::DexRouter, 0.3, 1.0)
            .required(&[entry])
            .optional(&optional)
            .excluded(&[Transfer])
            .patterns(&[InteractionType::Swap])
    });
    let universal = ContractClassificationRule::new(ContractType::DexRouter, 0.3, 1.0)
        .required(&[UniversalRouterExecute])
        .optional(&[Multicall, MulticallWithDeadline])
        .excluded(&[Transfer])
        .patterns(&[InteractionType::Swap]);

    v2.chain(v3).chain(std::iter::once(universal)).collect()
}

/// Re-scoring cadence: full rule evaluation every `interval` interactions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RescoreStrategy {
    pub interval: u64,
}

impl Default for RescoreStrategy {
    fn default() -> Self {
        Self {
            interval: DEFAULT_RESCORE_INTERVAL,
        }
    }
}

impl RescoreStrategy {
    pub fn every(interval: u64) -> Self {
        Self { interval }
    }

    /// Whether a full re-scoring is due after `total` accumulated interactions
    pub fn is_due(&self, total: u64) -> bool {
        self.interval > 0 && total > 0 && total % self.interval == 0
    }
}

/// Accumulated classification of one contract
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContractClassification {
    pub address: String,
    pub primary_type: ContractType,
    /// Ordered by descending score
    pub secondary_types: Vec<ContractType>,
    pub confidence: f64,
    pub detected_protocols: Vec<String>,
    pub method_signatures: BTreeMap<String, u64>,
    pub interaction_types: BTreeMap<InteractionType, u64>,
    pub total_interactions: u64,
    pub unique_users: u64,
    pub first_seen: u64,
    pub last_seen: u64,
    pub tags: Vec<String>,
    #[serde(skip)]
    callers: HashSet<String>,
}

impl ContractClassification {
    /// Empty classification for a contract not yet seen
    pub fn new(address: &str) -> Self {
        Self {
            address: canonical_address(address),
            primary_type: ContractType::Unknown,
            secondary_types: Vec::new(),
            confidence: 0.0,
            detected_protocols: Vec::new(),
            method_signatures: BTreeMap::new(),
            interaction_types: BTreeMap::new(),
            total_interactions: 0,
            unique_users: 0,
            first_seen: 0,
            last_seen: 0,
            tags: Vec::new(),
            callers: HashSet::new(),
        }
    }

    /// Fold one interaction into the histograms and counters
    ///
    /// `caller` is the account that sent the transaction, when known.
    fn absorb(&mut self, interaction: &InteractionRecord, caller: Option<&str>) {
        *self
            .method_signatures
            .entry(interaction.method_signature.clone())
            .or_insert(0) += 1;
        *self
            .interaction_types
            .entry(interaction.interaction_type)
            .or_insert(0) += 1;
        self.total_interactions += 1;

        if self.first_seen == 0 || interaction.timestamp < self.first_seen {
            self.first_seen = interaction.timestamp;
        }
        self.last_seen = self.last_seen.max(interaction.timestamp);

        if let Some(caller) = caller.filter(|c| !c.is_empty()) {
            if self.callers.insert(canonical_address(caller)) {
                self.unique_users = self.callers.len() as u64;
            }
        }
    }
}

/// Contract classifier over the registry's contract rules
pub struct ContractClassifier {
    registry: Arc<RegistryStore>,
    strategy: RescoreStrategy,
}

impl ContractClassifier {
    pub fn new(registry: Arc<RegistryStore>) -> Self {
        Self::with_strategy(registry, RescoreStrategy::default())
    }

    pub fn with_strategy(registry: Arc<RegistryStore>, strategy: RescoreStrategy) -> Self {
        Self { registry, strategy }
    }

    pub fn strategy(&self) -> RescoreStrategy {
        self.strategy
    }

    /// See [`classify_from_method_signature`]
    pub fn classify_from_method_signature(signature: &str) -> ContractType {
        classify_from_method_signature(signature)
    }

    /// Build a classification from a full interaction history and score it
    ///
    /// Callers are taken from each record's `from`, except for records that
    /// point from the contract to itself.
    pub fn classify_contract(
        &self,
        address: &str,
        interactions: &[InteractionRecord],
    ) -> ContractClassification {
        let mut classification = ContractClassification::new(address);
        for interaction in interactions {
            let caller = (interaction.from != interaction.contract_address)
                .then_some(interaction.from.as_str());
            classification.absorb(interaction, caller);
        }
        self.rescore(&mut classification);
        classification
    }

    /// Incrementally fold a new interaction into an existing classification
    ///
    /// `caller` is the sender of the originating transaction. Returns `true`
    /// when this interaction triggered a full re-scoring.
    pub fn record_interaction(
        &self,
        classification: &mut ContractClassification,
        interaction: &InteractionRecord,
        caller: &str,
    ) -> bool {
        classification.absorb(interaction, Some(caller));
        if self.strategy.is_due(classification.total_interactions) {
            self.rescore(classification);
            true
        } else {
            false
        }
    }

    /// Re-evaluate primary/secondary types, protocols and tags
    pub fn rescore(&self, classification: &mut ContractClassification) {
        let snapshot = self.registry.snapshot();

        // Best raw and effective score per type across all rules
        let mut raw_scores: BTreeMap<ContractType, f64> = BTreeMap::new();
        let mut qualifying: BTreeMap<ContractType, f64> = BTreeMap::new();
        for rule in snapshot.contract_rules() {
            let score = rule.score(&classification.method_signatures, &classification.interaction_types);
            let raw = raw_scores.entry(rule.contract_type).or_insert(0.0);
            *raw = raw.max(score);

            if score >= rule.min_confidence {
                let effective = score * rule.weight;
                let best = qualifying.entry(rule.contract_type).or_insert(0.0);
                *best = best.max(effective);
            }
        }

        let mut ranked: Vec<(ContractType, f64)> = qualifying.into_iter().collect();
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));

        let (primary_type, confidence) = ranked
            .first()
            .copied()
            .unwrap_or((ContractType::Unknown, 0.0));

        let mut secondary: Vec<(ContractType, f64)> = ranked.iter().skip(1).copied().collect();
        for (contract_type, raw) in &raw_scores {
            let listed = *contract_type == primary_type
                || secondary.iter().any(|(t, _)| t == contract_type);
            if !listed && *raw > SECONDARY_SCORE_THRESHOLD {
                secondary.push((*contract_type, *raw));
            }
        }
        secondary.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));

        classification.primary_type = primary_type;
        classification.secondary_types = secondary.into_iter().map(|(t, _)| t).collect();
        classification.confidence = confidence.min(1.0);
        classification.detected_protocols = detect_protocols(&classification.method_signatures);
        classification.tags = derive_tags(classification);

        debug!(
            "Rescored contract {} as {:?} ({:.2}) after {} interactions",
            classification.address,
            classification.primary_type,
            classification.confidence,
            classification.total_interactions
        );
    }
}

/// Protocols evidenced by the observed method signatures
fn detect_protocols(methods: &BTreeMap<String, u64>) -> Vec<String> {
    methods
        .keys()
        .filter_map(|sig| lookup_hex(sig).and_then(|m| m.protocol()))
        .collect::<BTreeSet<_>>()
        .into_iter()
        .map(str::to_string)
        .collect()
}

fn derive_tags(classification: &ContractClassification) -> Vec<String> {
    let mut tags = Vec::new();

    let volume = match classification.total_interactions {
        n if n > 10_000 => "high-volume",
        n if n > 1_000 => "medium-volume",
        _ => "low-volume",
    };
    tags.push(volume.to_string());

    if classification.unique_users > 1_000 {
        tags.push("popular".to_string());
    }

    let primary = classification.primary_type;
    if primary.is_defi() {
        tags.push("defi".to_string());
    } else {
        tags.push(primary.category().to_string());
    }

    tags
}
