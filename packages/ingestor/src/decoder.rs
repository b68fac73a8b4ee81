//! Interaction Decoder
//!
//! Reconstructs semantic interactions (transfers, approvals, swaps, liquidity
//! and vault operations, multicalls) from raw call data using selector dispatch
//! and fixed-offset ABI word extraction.
//!
//! Malformed call data for a recognized selector is never fatal: the decoder
//! logs and falls back to selector inference, then to an unknown-call record.

use alloy::primitives::{Address, U256};
use thiserror::Error;
use tracing::{debug, warn};

use crate::contract::classify_from_method_signature;
use crate::interaction::{InteractionRecord, InteractionType};
use crate::signatures::{lookup, parse_selector, ETH_TRANSFER_SIGNATURE};
use crate::transaction::{canonical_address, format_address, strip_hex_prefix, Transaction};

/// Hex characters in a method selector
pub const SELECTOR_HEX_LEN: usize = 8;

/// Hex characters in one 32-byte ABI word
pub const WORD_HEX_LEN: usize = 64;

/// Errors that can occur during interaction decoding
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DecodeError {
    #[error("Invalid hex in call data: {0}")]
    InvalidHex(String),

    #[error("Call data too short: need {expected} argument hex chars, got {actual}")]
    InsufficientData { expected: usize, actual: usize },

    #[error("Invalid value: {0}")]
    InvalidValue(String),
}

/// Decode a transaction into zero or more interaction records
///
/// # Returns
/// - no records for zero-value transfers without call data and for contract creations
/// - one `EthTransfer` record for value transfers without call data
/// - one record per call otherwise (decoded, inferred, or unknown)
///
/// Only an unparseable transaction value is reported as an error.
pub fn decode_interactions(tx: &Transaction) -> Result<Vec<InteractionRecord>, DecodeError> {
    let tx_value = tx.parsed_value()?;

    if tx.has_empty_calldata() {
        if tx_value.is_zero() {
            return Ok(Vec::new());
        }
        return Ok(vec![record(
            tx,
            InteractionType::EthTransfer,
            ETH_TRANSFER_SIGNATURE.to_string(),
            canonical_address(&tx.to),
            tx_value,
        )]);
    }

    if tx.is_contract_creation() {
        debug!("Skipping contract creation {}", tx.hash);
        return Ok(Vec::new());
    }

    let data = strip_hex_prefix(tx.data.trim()).to_ascii_lowercase();
    let Some(signature) = data.get(..SELECTOR_HEX_LEN) else {
        debug!("Call data shorter than a selector in {}", tx.hash);
        return Ok(vec![fallback_record(tx, &data, tx_value)]);
    };
    let args = data.get(SELECTOR_HEX_LEN..).unwrap_or_default();

    let dispatch = parse_selector(signature)
        .and_then(|selector| lookup(&selector))
        .and_then(|method| method.interaction_type());

    let interaction = match dispatch {
        Some(interaction_type) => {
            match decode_known(tx, interaction_type, signature, args, tx_value) {
                Ok(decoded) => decoded,
                Err(e) => {
                    warn!(
                        "Failed to decode {} call in {}: {}; falling back",
                        interaction_type, tx.hash, e
                    );
                    fallback_record(tx, signature, tx_value)
                }
            }
        }
        None => fallback_record(tx, signature, tx_value),
    };

    Ok(vec![interaction])
}

/// Decode the parameters of a dispatched selector
fn decode_known(
    tx: &Transaction,
    interaction_type: InteractionType,
    signature: &str,
    args: &str,
    tx_value: U256,
) -> Result<InteractionRecord, DecodeError> {
    match interaction_type {
        InteractionType::Transfer => {
            let recipient = read_address(args, 0)?;
            let amount = read_uint(args, 1)?;
            Ok(record(tx, interaction_type, signature.to_string(), format_address(recipient), amount))
        }
        InteractionType::TransferFrom => {
            let from = read_address(args, 0)?;
            let to = read_address(args, 1)?;
            let amount = read_uint(args, 2)?;
            let mut decoded =
                record(tx, interaction_type, signature.to_string(), format_address(to), amount);
            decoded.from = format_address(from);
            Ok(decoded)
        }
        InteractionType::Approve
        | InteractionType::IncreaseAllowance
        | InteractionType::DecreaseAllowance => {
            let spender = read_address(args, 0)?;
            let amount = read_uint(args, 1)?;
            Ok(record(tx, interaction_type, signature.to_string(), format_address(spender), amount))
        }
        // The selector alone determines the relationship type for these calls;
        // the record points from the contract to itself
        InteractionType::Swap
        | InteractionType::AddLiquidity
        | InteractionType::RemoveLiquidity
        | InteractionType::Deposit
        | InteractionType::Withdraw
        | InteractionType::Multicall
        | InteractionType::EthTransfer
        | InteractionType::UnknownContractCall => Ok(record(
            tx,
            interaction_type,
            signature.to_string(),
            canonical_address(&tx.to),
            tx_value,
        )),
    }
}

/// Record for a call the decoder cannot dispatch
///
/// The selector is matched against the contract classifier's table to infer
/// a probable interaction; otherwise the raw selector is preserved.
fn fallback_record(tx: &Transaction, signature: &str, tx_value: U256) -> InteractionRecord {
    let interaction_type = classify_from_method_signature(signature)
        .probable_interaction()
        .unwrap_or(InteractionType::UnknownContractCall);

    record(
        tx,
        interaction_type,
        signature.to_string(),
        canonical_address(&tx.to),
        tx_value,
    )
}

fn record(
    tx: &Transaction,
    interaction_type: InteractionType,
    method_signature: String,
    to: String,
    value: U256,
) -> InteractionRecord {
    let contract_address = canonical_address(&tx.to);
    let (from, to) = if interaction_type.is_signature_only() {
        (contract_address.clone(), contract_address.clone())
    } else {
        (canonical_address(&tx.from), to)
    };
    InteractionRecord {
        contract_address,
        from,
        to,
        value: value.to_string(),
        tx_hash: tx.hash.clone(),
        block_number: tx.block_number,
        timestamp: tx.timestamp,
        network: tx.network.clone(),
        interaction_type,
        method_signature,
        success: tx.success,
    }
}

/// Read the 32-byte ABI word at `index` from argument hex
pub fn read_word(args: &str, index: usize) -> Result<[u8; 32], DecodeError> {
    let start = index * WORD_HEX_LEN;
    let end = start + WORD_HEX_LEN;
    let slot = args.get(start..end).ok_or(DecodeError::InsufficientData {
        expected: end,
        actual: args.len(),
    })?;

    let mut word = [0u8; 32];
    hex::decode_to_slice(slot, &mut word).map_err(|e| DecodeError::InvalidHex(e.to_string()))?;
    Ok(word)
}

/// Read a right-aligned 20-byte address from the ABI word at `index`
pub fn read_address(args: &str, index: usize) -> Result<Address, DecodeError> {
    let word = read_word(args, index)?;
    Ok(Address::from_slice(&word[12..]))
}

/// Read a big-endian uint256 from the ABI word at `index`
pub fn read_uint(args: &str, index: usize) -> Result<U256, DecodeError> {
    Ok(U256::from_be_bytes(read_word(args, index)?))
}

/// Encode an address as a left-padded ABI word
pub fn encode_address_word(address: Address) -> String {
    format!("{:0>64}", hex::encode(address))
}

/// Encode a uint256 as a big-endian ABI word
pub fn encode_uint_word(value: U256) -> String {
    hex::encode(value.to_be_bytes::<32>())
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::address;

    const SENDER: &str = "0xf39fd6e51aad88f6f4ce6ab8827279cfffb92266";
    const TOKEN: &str = "0xa0b86991c6218b36c1d19d4a2e9eb0ce3606eb48";
    const ROUTER: &str = "0x7a250d5630b4cf539739df2c5dacb4c659f2488d";
    const ONE_ETH_WORD: &str = "0000000000000000000000000000000000000000000000000de0b6b3a7640000";

    fn tx(to: &str, value: &str, data: &str) -> Transaction {
        Transaction {
            hash: "0x1234".to_string(),
            from: SENDER.to_string(),
            to: to.to_string(),
            value: value.to_string(),
            data: data.to_string(),
            block_number: 19_000_000,
            timestamp: 1_700_000_000,
            network: "ethereum".to_string(),
            success: true,
        }
    }

    fn recipient_word() -> String {
        encode_address_word(address!("70997970C51812dc3A010C7d01b50e0d17dc79C8"))
    }

    // ==================== value transfer tests ====================

    #[test]
    fn test_empty_calldata_with_value_emits_eth_transfer() {
        let records = decode_interactions(&tx(TOKEN, "1000", "0x")).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].interaction_type, InteractionType::EthTransfer);
        assert_eq!(records[0].method_signature, ETH_TRANSFER_SIGNATURE);
        assert_eq!(records[0].value, "1000");
        assert_eq!(records[0].to, TOKEN);
    }

    #[test]
    fn test_empty_calldata_without_value_emits_nothing() {
        assert!(decode_interactions(&tx(TOKEN, "0", "")).unwrap().is_empty());
    }

    #[test]
    fn test_contract_creation_emits_nothing() {
        let creation = tx("0x0000000000000000000000000000000000000000", "0", "0x6080604052");
        assert!(decode_interactions(&creation).unwrap().is_empty());
    }

    #[test]
    fn test_invalid_transaction_value_is_error() {
        let result = decode_interactions(&tx(TOKEN, "not-a-number", "0x"));
        assert!(matches!(result, Err(DecodeError::InvalidValue(_))));
    }

    // ==================== ERC20 decode tests ====================

    #[test]
    fn test_decode_transfer() {
        let data = format!("0xa9059cbb{}{}", recipient_word(), ONE_ETH_WORD);
        let records = decode_interactions(&tx(TOKEN, "0", &data)).unwrap();

        assert_eq!(records.len(), 1);
        let r = &records[0];
        assert_eq!(r.interaction_type, InteractionType::Transfer);
        assert_eq!(r.value, "1000000000000000000");
        assert_eq!(r.from, SENDER);
        assert_eq!(r.to, "0x70997970c51812dc3a010c7d01b50e0d17dc79c8");
        assert_eq!(r.contract_address, TOKEN);
        assert_eq!(r.method_signature, "a9059cbb");
        assert_eq!(r.relationship_type(), "ERC20_TRANSFER");
    }

    #[test]
    fn test_decode_transfer_round_trips_argument_words() {
        let args = format!("{}{}", recipient_word(), ONE_ETH_WORD);
        let data = format!("0xa9059cbb{args}");
        let r = &decode_interactions(&tx(TOKEN, "0", &data)).unwrap()[0];

        let recipient: Address = r.to.parse().unwrap();
        let value: U256 = r.value.parse().unwrap();
        let reencoded = format!("{}{}", encode_address_word(recipient), encode_uint_word(value));
        assert_eq!(reencoded, args);
    }

    #[test]
    fn test_decode_transfer_value_beyond_u64() {
        let big = U256::from(u128::MAX) * U256::from(16u8);
        let data = format!("0xa9059cbb{}{}", recipient_word(), encode_uint_word(big));
        let r = &decode_interactions(&tx(TOKEN, "0", &data)).unwrap()[0];
        assert_eq!(r.value, big.to_string());
    }

    #[test]
    fn test_decode_transfer_from() {
        let owner = encode_address_word(address!("3C44CdDdB6a900fa2b585dd299e03d12FA4293BC"));
        let data = format!("0x23b872dd{}{}{}", owner, recipient_word(), ONE_ETH_WORD);
        let r = &decode_interactions(&tx(TOKEN, "0", &data)).unwrap()[0];

        assert_eq!(r.interaction_type, InteractionType::TransferFrom);
        assert_eq!(r.from, "0x3c44cdddb6a900fa2b585dd299e03d12fa4293bc");
        assert_eq!(r.to, "0x70997970c51812dc3a010c7d01b50e0d17dc79c8");
        assert_eq!(r.value, "1000000000000000000");
    }

    #[test]
    fn test_decode_approval_family() {
        for (selector, expected) in [
            ("095ea7b3", InteractionType::Approve),
            ("39509351", InteractionType::IncreaseAllowance),
            ("a457c2d7", InteractionType::DecreaseAllowance),
        ] {
            let data = format!("0x{selector}{}{}", recipient_word(), ONE_ETH_WORD);
            let r = &decode_interactions(&tx(TOKEN, "0", &data)).unwrap()[0];
            assert_eq!(r.interaction_type, expected);
            assert_eq!(r.relationship_type(), "ERC20_APPROVAL");
            assert_eq!(r.to, "0x70997970c51812dc3a010c7d01b50e0d17dc79c8");
        }
    }

    // ==================== signature-only dispatch tests ====================

    #[test]
    fn test_swap_passes_transaction_value_through() {
        let data = format!("0x7ff36ab5{}", ONE_ETH_WORD);
        let r = &decode_interactions(&tx(ROUTER, "500", &data)).unwrap()[0];
        assert_eq!(r.interaction_type, InteractionType::Swap);
        assert_eq!(r.value, "500");
        assert_eq!(r.from, ROUTER);
        assert_eq!(r.to, ROUTER);
        assert_eq!(r.contract_address, ROUTER);
        assert_eq!(r.relationship_type(), "DEX_SWAP");
    }

    #[test]
    fn test_bare_selector_is_enough_for_signature_only_calls() {
        let cases = [
            ("0xe8e33700", InteractionType::AddLiquidity),
            ("0x02751cec", InteractionType::RemoveLiquidity),
            ("0xd0e30db0", InteractionType::Deposit),
            ("0x2e1a7d4d", InteractionType::Withdraw),
            ("0xac9650d8", InteractionType::Multicall),
        ];
        for (data, expected) in cases {
            let r = &decode_interactions(&tx(ROUTER, "0", data)).unwrap()[0];
            assert_eq!(r.interaction_type, expected, "selector {data}");
        }
    }

    #[test]
    fn test_signature_only_records_use_contract_as_both_endpoints() {
        let r = &decode_interactions(&tx(ROUTER, "0", "0x38ed1739")).unwrap()[0];
        assert_eq!(r.interaction_type, InteractionType::Swap);
        assert_eq!(r.from, r.contract_address);
        assert_eq!(r.to, r.contract_address);
        assert_eq!(r.contract_address, ROUTER);
    }

    // ==================== fallback tests ====================

    #[test]
    fn test_unknown_selector_preserves_signature() {
        let r = &decode_interactions(&tx(ROUTER, "0", "0x12345678abcd")).unwrap()[0];
        assert_eq!(r.interaction_type, InteractionType::UnknownContractCall);
        assert_eq!(r.method_signature, "12345678");
        assert_eq!(r.relationship_type(), "CONTRACT_INTERACTION");
        assert_eq!(r.from, SENDER);
    }

    #[test]
    fn test_unfamiliar_dex_selector_is_inferred_as_swap() {
        // swapExactTokensForTokensSupportingFeeOnTransferTokens has no decoder entry
        let r = &decode_interactions(&tx(ROUTER, "0", "0x5c11d795")).unwrap()[0];
        assert_eq!(r.interaction_type, InteractionType::Swap);
        assert_eq!(r.method_signature, "5c11d795");
        assert_eq!(r.from, ROUTER);
    }

    #[test]
    fn test_truncated_transfer_falls_back_to_unknown_call() {
        let data = format!("0xa9059cbb{}", recipient_word());
        let r = &decode_interactions(&tx(TOKEN, "0", &data)).unwrap()[0];
        assert_eq!(r.interaction_type, InteractionType::UnknownContractCall);
        assert_eq!(r.method_signature, "a9059cbb");
    }

    #[test]
    fn test_non_hex_argument_falls_back_to_unknown_call() {
        let data = format!("0xa9059cbb{}{}", recipient_word(), "zz".repeat(32));
        let r = &decode_interactions(&tx(TOKEN, "0", &data)).unwrap()[0];
        assert_eq!(r.interaction_type, InteractionType::UnknownContractCall);
    }

    #[test]
    fn test_short_calldata_never_panics() {
        for data in ["0x1", "0xa9", "0xa9059c", "a9059cb", "0xé"] {
            let records = decode_interactions(&tx(TOKEN, "0", data)).unwrap();
            assert!(records.len() <= 1);
            if let Some(r) = records.first() {
                assert_eq!(r.interaction_type, InteractionType::UnknownContractCall);
            }
        }
    }

    #[test]
    fn test_uppercase_calldata_is_normalized() {
        let data = format!("0xA9059CBB{}{}", recipient_word(), ONE_ETH_WORD).to_uppercase();
        let r = &decode_interactions(&tx(TOKEN, "0", &data.replacen("0X", "0x", 1))).unwrap()[0];
        assert_eq!(r.interaction_type, InteractionType::Transfer);
        assert_eq!(r.method_signature, "a9059cbb");
    }

    // ==================== word helper tests ====================

    #[test]
    fn test_read_word_reports_missing_bytes() {
        let err = read_word("00", 0).unwrap_err();
        assert_eq!(err, DecodeError::InsufficientData { expected: 64, actual: 2 });
    }

    #[test]
    fn test_encode_address_word_is_left_padded() {
        let word = recipient_word();
        assert_eq!(word.len(), WORD_HEX_LEN);
        assert!(word.starts_with("000000000000000000000000"));
    }
}
