//! Method Signature Table
//!
//! Maps 4-byte method selectors to named ERC20/DeFi operations.
//! This table mirrors the ABI encoding convention of the chain; changing a
//! selector here changes what the decoder and classifiers see.

use std::collections::HashMap;
use std::sync::LazyLock;

use crate::interaction::InteractionType;
use crate::transaction::strip_hex_prefix;

/// Sentinel method signature recorded for plain value transfers
pub const ETH_TRANSFER_SIGNATURE: &str = "ETH_TRANSFER";

/// Known contract methods, keyed by their 4-byte selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MethodSignature {
    // ERC20
    Transfer,
    TransferFrom,
    Approve,
    IncreaseAllowance,
    DecreaseAllowance,
    Mint,
    Burn,
    BalanceOf,
    TotalSupply,
    Allowance,
    // Uniswap V2 style routers
    SwapExactTokensForTokens,
    SwapTokensForExactTokens,
    SwapExactEthForTokens,
    SwapExactTokensForEth,
    SwapEthForExactTokens,
    SwapTokensForExactEth,
    SwapExactTokensForTokensSupportingFee,
    AddLiquidity,
    AddLiquidityEth,
    RemoveLiquidity,
    RemoveLiquidityEth,
    // Uniswap V3 style routers
    ExactInputSingle,
    ExactInput,
    ExactOutputSingle,
    ExactOutput,
    UniversalRouterExecute,
    // Batching
    Multicall,
    MulticallWithDeadline,
    Aggregate,
    // Wrapped native / vaults / lending / staking
    Deposit,
    Withdraw,
    DepositAmount,
    LendingDeposit,
    LendingWithdraw,
    LendingBorrow,
    LendingRepay,
    VaultDeposit,
    VaultWithdraw,
    Stake,
    GetReward,
    // NFTs
    SafeTransferFrom,
    SafeTransferFromWithData,
    SetApprovalForAll,
    OwnerOf,
    MultiTokenSafeTransferFrom,
    MultiTokenSafeBatchTransferFrom,
    // Multisig
    ExecTransaction,
}

impl MethodSignature {
    pub const ALL: &'static [MethodSignature] = &[
        MethodSignature::Transfer,
        MethodSignature::TransferFrom,
        MethodSignature::Approve,
        MethodSignature::IncreaseAllowance,
        MethodSignature::DecreaseAllowance,
        MethodSignature::Mint,
        MethodSignature::Burn,
        MethodSignature::BalanceOf,
        MethodSignature::TotalSupply,
        MethodSignature::Allowance,
        MethodSignature::SwapExactTokensForTokens,
        MethodSignature::SwapTokensForExactTokens,
        MethodSignature::SwapExactEthForTokens,
        MethodSignature::SwapExactTokensForEth,
        MethodSignature::SwapEthForExactTokens,
        MethodSignature::SwapTokensForExactEth,
        MethodSignature::SwapExactTokensForTokensSupportingFee,
        MethodSignature::AddLiquidity,
        MethodSignature::AddLiquidityEth,
        MethodSignature::RemoveLiquidity,
        MethodSignature::RemoveLiquidityEth,
        MethodSignature::ExactInputSingle,
        MethodSignature::ExactInput,
        MethodSignature::ExactOutputSingle,
        MethodSignature::ExactOutput,
        MethodSignature::UniversalRouterExecute,
        MethodSignature::Multicall,
        MethodSignature::MulticallWithDeadline,
        MethodSignature::Aggregate,
        MethodSignature::Deposit,
        MethodSignature::Withdraw,
        MethodSignature::DepositAmount,
        MethodSignature::LendingDeposit,
        MethodSignature::LendingWithdraw,
        MethodSignature::LendingBorrow,
        MethodSignature::LendingRepay,
        MethodSignature::VaultDeposit,
        MethodSignature::VaultWithdraw,
        MethodSignature::Stake,
        MethodSignature::GetReward,
        MethodSignature::SafeTransferFrom,
        MethodSignature::SafeTransferFromWithData,
        MethodSignature::SetApprovalForAll,
        MethodSignature::OwnerOf,
        MethodSignature::MultiTokenSafeTransferFrom,
        MethodSignature::MultiTokenSafeBatchTransferFrom,
        MethodSignature::ExecTransaction,
    ];

    /// Returns the 4-byte method selector
    pub fn selector(&self) -> [u8; 4] {
        match self {
            MethodSignature::Transfer => [0xa9, 0x05, 0x9c, 0xbb],
            MethodSignature::TransferFrom => [0x23, 0xb8, 0x72, 0xdd],
            MethodSignature::Approve => [0x09, 0x5e, 0xa7, 0xb3],
            MethodSignature::IncreaseAllowance => [0x39, 0x50, 0x93, 0x51],
            MethodSignature::DecreaseAllowance => [0xa4, 0x57, 0xc2, 0xd7],
            MethodSignature::Mint => [0x40, 0xc1, 0x0f, 0x19],
            MethodSignature::Burn => [0x42, 0x96, 0x6c, 0x68],
            MethodSignature::BalanceOf => [0x70, 0xa0, 0x82, 0x31],
            MethodSignature::TotalSupply => [0x18, 0x16, 0x0d, 0xdd],
            MethodSignature::Allowance => [0xdd, 0x62, 0xed, 0x3e],
            MethodSignature::SwapExactTokensForTokens => [0x38, 0xed, 0x17, 0x39],
            MethodSignature::SwapTokensForExactTokens => [0x88, 0x03, 0xdb, 0xee],
            MethodSignature::SwapExactEthForTokens => [0x7f, 0xf3, 0x6a, 0xb5],
            MethodSignature::SwapExactTokensForEth => [0x18, 0xcb, 0xaf, 0xe5],
            MethodSignature::SwapEthForExactTokens => [0xfb, 0x3b, 0xdb, 0x41],
            MethodSignature::SwapTokensForExactEth => [0x4a, 0x25, 0xd9, 0x4a],
            MethodSignature::SwapExactTokensForTokensSupportingFee => [0x5c, 0x11, 0xd7, 0x95],
            MethodSignature::AddLiquidity => [0xe8, 0xe3, 0x37, 0x00],
            MethodSignature::AddLiquidityEth => [0xf3, 0x05, 0xd7, 0x19],
            MethodSignature::RemoveLiquidity => [0xba, 0xa2, 0xab, 0xde],
            MethodSignature::RemoveLiquidityEth => [0x02, 0x75, 0x1c, 0xec],
            MethodSignature::ExactInputSingle => [0x41, 0x4b, 0xf3, 0x89],
            MethodSignature::ExactInput => [0xc0, 0x4b, 0x8d, 0x59],
            MethodSignature::ExactOutputSingle => [0xdb, 0x3e, 0x21, 0x98],
            MethodSignature::ExactOutput => [0xf2, 0x8c, 0x04, 0x98],
            MethodSignature::UniversalRouterExecute => [0x35, 0x93, 0x56, 0x4c],
            MethodSignature::Multicall => [0xac, 0x96, 0x50, 0xd8],
            MethodSignature::MulticallWithDeadline => [0x5a, 0xe4, 0x01, 0xdc],
            MethodSignature::Aggregate => [0x25, 0x2d, 0xba, 0x42],
            MethodSignature::Deposit => [0xd0, 0xe3, 0x0d, 0xb0],
            MethodSignature::Withdraw => [0x2e, 0x1a, 0x7d, 0x4d],
            MethodSignature::DepositAmount => [0xb6, 0xb5, 0x5f, 0x25],
            MethodSignature::LendingDeposit => [0xe8, 0xed, 0xa9, 0xdf],
            MethodSignature::LendingWithdraw => [0x69, 0x32, 0x8d, 0xec],
            MethodSignature::LendingBorrow => [0xa4, 0x15, 0xbc, 0xad],
            MethodSignature::LendingRepay => [0x57, 0x3a, 0xde, 0x81],
            MethodSignature::VaultDeposit => [0x6e, 0x55, 0x3f, 0x65],
            MethodSignature::VaultWithdraw => [0xb4, 0x60, 0xaf, 0x94],
            MethodSignature::Stake => [0xa6, 0x94, 0xfc, 0x3a],
            MethodSignature::GetReward => [0x3d, 0x18, 0xb9, 0x12],
            MethodSignature::SafeTransferFrom => [0x42, 0x84, 0x2e, 0x0e],
            MethodSignature::SafeTransferFromWithData => [0xb8, 0x8d, 0x4f, 0xde],
            MethodSignature::SetApprovalForAll => [0xa2, 0x2c, 0xb4, 0x65],
            MethodSignature::OwnerOf => [0x63, 0x52, 0x21, 0x1e],
            MethodSignature::MultiTokenSafeTransferFrom => [0xf2, 0x42, 0x43, 0x2a],
            MethodSignature::MultiTokenSafeBatchTransferFrom => [0x2e, 0xb2, 0xc2, 0xd6],
            MethodSignature::ExecTransaction => [0x6a, 0x76, 0x12, 0x02],
        }
    }

    /// Returns the human-readable method name
    pub fn name(&self) -> &'static str {
        match self {
            MethodSignature::Transfer => "transfer",
            MethodSignature::TransferFrom => "transferFrom",
            MethodSignature::Approve => "approve",
            MethodSignature::IncreaseAllowance => "increaseAllowance",
            MethodSignature::DecreaseAllowance => "decreaseAllowance",
            MethodSignature::Mint => "mint",
            MethodSignature::Burn => "burn",
            MethodSignature::BalanceOf => "balanceOf",
            MethodSignature::TotalSupply => "totalSupply",
            MethodSignature::Allowance => "allowance",
            MethodSignature::SwapExactTokensForTokens => "swapExactTokensForTokens",
            MethodSignature::SwapTokensForExactTokens => "swapTokensForExactTokens",
            MethodSignature::SwapExactEthForTokens => "swapExactETHForTokens",
            MethodSignature::SwapExactTokensForEth => "swapExactTokensForETH",
            MethodSignature::SwapEthForExactTokens => "swapETHForExactTokens",
            MethodSignature::SwapTokensForExactEth => "swapTokensForExactETH",
            MethodSignature::SwapExactTokensForTokensSupportingFee => {
                "swapExactTokensForTokensSupportingFeeOnTransferTokens"
            }
            MethodSignature::AddLiquidity => "addLiquidity",
            MethodSignature::AddLiquidityEth => "addLiquidityETH",
            MethodSignature::RemoveLiquidity => "removeLiquidity",
            MethodSignature::RemoveLiquidityEth => "removeLiquidityETH",
            MethodSignature::ExactInputSingle => "exactInputSingle",
            MethodSignature::ExactInput => "exactInput",
            MethodSignature::ExactOutputSingle => "exactOutputSingle",
            MethodSignature::ExactOutput => "exactOutput",
            MethodSignature::UniversalRouterExecute => "execute",
            MethodSignature::Multicall => "multicall",
            MethodSignature::MulticallWithDeadline => "multicall",
            MethodSignature::Aggregate => "aggregate",
            MethodSignature::Deposit => "deposit",
            MethodSignature::Withdraw => "withdraw",
            MethodSignature::DepositAmount => "deposit",
            MethodSignature::LendingDeposit => "deposit",
            MethodSignature::LendingWithdraw => "withdraw",
            MethodSignature::LendingBorrow => "borrow",
            MethodSignature::LendingRepay => "repay",
            MethodSignature::VaultDeposit => "deposit",
            MethodSignature::VaultWithdraw => "withdraw",
            MethodSignature::Stake => "stake",
            MethodSignature::GetReward => "getReward",
            MethodSignature::SafeTransferFrom => "safeTransferFrom",
            MethodSignature::SafeTransferFromWithData => "safeTransferFrom",
            MethodSignature::SetApprovalForAll => "setApprovalForAll",
            MethodSignature::OwnerOf => "ownerOf",
            MethodSignature::MultiTokenSafeTransferFrom => "safeTransferFrom",
            MethodSignature::MultiTokenSafeBatchTransferFrom => "safeBatchTransferFrom",
            MethodSignature::ExecTransaction => "execTransaction",
        }
    }

    /// Returns the selector as 8 lower-case hex characters, without prefix
    pub fn hex(&self) -> String {
        hex::encode(self.selector())
    }

    /// Interaction type the decoder dispatches this method to, if any
    ///
    /// Methods without a dispatch entry are still known to the contract
    /// classifier and reach the decoder's inference fallback.
    pub fn interaction_type(&self) -> Option<InteractionType> {
        use MethodSignature::*;
        match self {
            Transfer => Some(InteractionType::Transfer),
            TransferFrom => Some(InteractionType::TransferFrom),
            Approve => Some(InteractionType::Approve),
            IncreaseAllowance => Some(InteractionType::IncreaseAllowance),
            DecreaseAllowance => Some(InteractionType::DecreaseAllowance),
            SwapExactTokensForTokens | SwapTokensForExactTokens | SwapExactEthForTokens
            | SwapExactTokensForEth | SwapEthForExactTokens | SwapTokensForExactEth
            | ExactInputSingle | ExactInput | ExactOutputSingle | ExactOutput => {
                Some(InteractionType::Swap)
            }
            AddLiquidity | AddLiquidityEth => Some(InteractionType::AddLiquidity),
            RemoveLiquidity | RemoveLiquidityEth => Some(InteractionType::RemoveLiquidity),
            Deposit | DepositAmount | LendingDeposit | VaultDeposit => {
                Some(InteractionType::Deposit)
            }
            Withdraw | LendingWithdraw | VaultWithdraw => Some(InteractionType::Withdraw),
            Multicall | MulticallWithDeadline | Aggregate => Some(InteractionType::Multicall),
            Mint | Burn | BalanceOf | TotalSupply | Allowance
            | SwapExactTokensForTokensSupportingFee | UniversalRouterExecute | LendingBorrow
            | LendingRepay | Stake | GetReward | SafeTransferFrom | SafeTransferFromWithData
            | SetApprovalForAll | OwnerOf | MultiTokenSafeTransferFrom
            | MultiTokenSafeBatchTransferFrom | ExecTransaction => None,
        }
    }

    /// Protocol a call to this method is evidence of, if any
    pub fn protocol(&self) -> Option<&'static str> {
        use MethodSignature::*;
        match self {
            SwapExactTokensForTokens | SwapTokensForExactTokens | SwapExactEthForTokens
            | SwapExactTokensForEth | SwapEthForExactTokens | SwapTokensForExactEth
            | SwapExactTokensForTokensSupportingFee | AddLiquidity | AddLiquidityEth
            | RemoveLiquidity | RemoveLiquidityEth | ExactInputSingle | ExactInput
            | ExactOutputSingle | ExactOutput | UniversalRouterExecute
            | MulticallWithDeadline => Some("uniswap"),
            Deposit | Withdraw => Some("weth"),
            LendingDeposit | LendingWithdraw | LendingBorrow | LendingRepay => Some("aave"),
            VaultDeposit | VaultWithdraw => Some("erc4626"),
            Stake | GetReward => Some("staking-rewards"),
            Aggregate => Some("multicall"),
            ExecTransaction => Some("gnosis-safe"),
            Transfer | TransferFrom | Approve | IncreaseAllowance | DecreaseAllowance | Mint
            | Burn | BalanceOf | TotalSupply | Allowance | Multicall | DepositAmount
            | SafeTransferFrom | SafeTransferFromWithData | SetApprovalForAll | OwnerOf
            | MultiTokenSafeTransferFrom | MultiTokenSafeBatchTransferFrom => None,
        }
    }
}

/// Static lookup table for method selectors
static METHODS: LazyLock<HashMap<[u8; 4], MethodSignature>> = LazyLock::new(|| {
    MethodSignature::ALL
        .iter()
        .map(|method| (method.selector(), *method))
        .collect()
});

/// Get the method for a given selector, if it is known
pub fn lookup(selector: &[u8; 4]) -> Option<MethodSignature> {
    METHODS.get(selector).copied()
}

/// Get the method for a hex selector string (with or without 0x prefix)
pub fn lookup_hex(signature: &str) -> Option<MethodSignature> {
    parse_selector(signature).and_then(|selector| lookup(&selector))
}

/// Get the human-readable method name for a given selector
pub fn get_method_name(selector: &[u8; 4]) -> Option<&'static str> {
    lookup(selector).map(|m| m.name())
}

/// Parse exactly 8 hex characters (after an optional prefix) into a selector
pub fn parse_selector(signature: &str) -> Option<[u8; 4]> {
    let hex_str = strip_hex_prefix(signature.trim());
    if hex_str.len() != 8 {
        return None;
    }
    let mut selector = [0u8; 4];
    hex::decode_to_slice(hex_str, &mut selector).ok()?;
    Some(selector)
}
