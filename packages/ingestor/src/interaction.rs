//! Interaction Records
//!
//! Semantic events reconstructed from transaction call data, and the stable
//! mapping from interaction type to the relationship label written to the graph.

use serde::{Deserialize, Serialize};

/// The decoder's semantic classification of a contract call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InteractionType {
    Transfer,
    TransferFrom,
    Approve,
    IncreaseAllowance,
    DecreaseAllowance,
    Swap,
    AddLiquidity,
    RemoveLiquidity,
    Deposit,
    Withdraw,
    Multicall,
    EthTransfer,
    UnknownContractCall,
}

impl InteractionType {
    /// Relationship label consumed by downstream graph queries
    pub fn relationship_type(&self) -> &'static str {
        match self {
            InteractionType::Transfer | InteractionType::TransferFrom => "ERC20_TRANSFER",
            InteractionType::Approve
            | InteractionType::IncreaseAllowance
            | InteractionType::DecreaseAllowance => "ERC20_APPROVAL",
            InteractionType::Swap => "DEX_SWAP",
            InteractionType::Deposit | InteractionType::Withdraw => "DEFI_OPERATION",
            InteractionType::Multicall => "MULTICALL_OPERATION",
            InteractionType::EthTransfer => "ETH_TRANSFER",
            InteractionType::AddLiquidity
            | InteractionType::RemoveLiquidity
            | InteractionType::UnknownContractCall => "CONTRACT_INTERACTION",
        }
    }

    /// Wire name of the interaction type
    pub fn as_str(&self) -> &'static str {
        match self {
            InteractionType::Transfer => "TRANSFER",
            InteractionType::TransferFrom => "TRANSFER_FROM",
            InteractionType::Approve => "APPROVE",
            InteractionType::IncreaseAllowance => "INCREASE_ALLOWANCE",
            InteractionType::DecreaseAllowance => "DECREASE_ALLOWANCE",
            InteractionType::Swap => "SWAP",
            InteractionType::AddLiquidity => "ADD_LIQUIDITY",
            InteractionType::RemoveLiquidity => "REMOVE_LIQUIDITY",
            InteractionType::Deposit => "DEPOSIT",
            InteractionType::Withdraw => "WITHDRAW",
            InteractionType::Multicall => "MULTICALL",
            InteractionType::EthTransfer => "ETH_TRANSFER",
            InteractionType::UnknownContractCall => "UNKNOWN_CONTRACT_CALL",
        }
    }

    /// Whether the selector alone identifies the call, with no parameters decoded
    ///
    /// Records of these types point from the contract to itself.
    pub fn is_signature_only(&self) -> bool {
        matches!(
            self,
            InteractionType::Swap
                | InteractionType::AddLiquidity
                | InteractionType::RemoveLiquidity
                | InteractionType::Deposit
                | InteractionType::Withdraw
                | InteractionType::Multicall
        )
    }

    /// Whether this interaction moves or authorizes ERC20 tokens
    pub fn is_erc20(&self) -> bool {
        matches!(
            self,
            InteractionType::Transfer
                | InteractionType::TransferFrom
                | InteractionType::Approve
                | InteractionType::IncreaseAllowance
                | InteractionType::DecreaseAllowance
        )
    }
}

impl std::fmt::Display for InteractionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One decoded interaction; never mutated after creation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InteractionRecord {
    /// Contract the transaction was sent to
    pub contract_address: String,
    pub from: String,
    pub to: String,
    /// Amount as decimal string (wei or token base units)
    pub value: String,
    pub tx_hash: String,
    pub block_number: u64,
    pub timestamp: u64,
    pub network: String,
    pub interaction_type: InteractionType,
    /// 4-byte selector as hex, or the ETH_TRANSFER sentinel
    pub method_signature: String,
    pub success: bool,
}

impl InteractionRecord {
    /// Relationship label for this record
    pub fn relationship_type(&self) -> &'static str {
        self.interaction_type.relationship_type()
    }
}
