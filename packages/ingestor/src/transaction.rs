//! Transaction Model
//!
//! The raw transaction record delivered by the queue, plus the address and
//! hex helpers shared by the decoder and classifiers.

use std::time::{SystemTime, UNIX_EPOCH};

use alloy::primitives::{Address, U256};
use serde::{Deserialize, Serialize};

use crate::decoder::DecodeError;

/// The canonical zero address, used as the recipient of contract creations
pub const ZERO_ADDRESS: &str = "0x0000000000000000000000000000000000000000";

/// Call-data value that carries no call
pub const EMPTY_CALLDATA: &str = "0x";

/// Raw transaction as received from the ingestion queue
///
/// Immutable once received; every field is kept in its wire representation
/// so that values of arbitrary size survive untouched.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    /// Transaction hash with 0x prefix
    pub hash: String,
    /// Sender address
    pub from: String,
    /// Recipient address, empty or zero for contract creation
    #[serde(default)]
    pub to: String,
    /// Transaction value in wei as decimal string
    #[serde(default = "zero_value")]
    pub value: String,
    /// Call data as hex string, may be empty
    #[serde(default, alias = "input")]
    pub data: String,
    pub block_number: u64,
    /// Block timestamp in seconds
    pub timestamp: u64,
    /// Network tag (e.g. "ethereum")
    #[serde(default)]
    pub network: String,
    /// Execution status, defaults to success when the source omits it
    #[serde(default = "default_success")]
    pub success: bool,
}

fn zero_value() -> String {
    "0".to_string()
}

fn default_success() -> bool {
    true
}

impl Transaction {
    /// Whether the transaction carries no call data
    pub fn has_empty_calldata(&self) -> bool {
        let data = self.data.trim();
        data.is_empty() || data == EMPTY_CALLDATA
    }

    /// Whether the transaction creates a contract (no recipient or zero address)
    pub fn is_contract_creation(&self) -> bool {
        let to = self.to.trim();
        to.is_empty() || is_zero_address(to)
    }

    /// Parse the transaction value as an arbitrary-precision unsigned integer
    pub fn parsed_value(&self) -> Result<U256, DecodeError> {
        parse_value(&self.value)
    }
}

/// Canonicalize an address to its lower-cased, trimmed form
pub fn canonical_address(address: &str) -> String {
    address.trim().to_ascii_lowercase()
}

/// Check whether an address string is the zero address
pub fn is_zero_address(address: &str) -> bool {
    let hex_part = strip_hex_prefix(address.trim());
    !hex_part.is_empty() && hex_part.chars().all(|c| c == '0')
}

/// Parse an address string into an alloy `Address`
pub fn parse_address(address: &str) -> Option<Address> {
    address.trim().parse::<Address>().ok()
}

/// Format an address as lower-case hex with 0x prefix
pub fn format_address(address: Address) -> String {
    format!("{:#x}", address)
}

/// Strip an optional 0x / 0X prefix
pub fn strip_hex_prefix(hex_str: &str) -> &str {
    hex_str
        .strip_prefix("0x")
        .or_else(|| hex_str.strip_prefix("0X"))
        .unwrap_or(hex_str)
}

/// Parse a decimal (or 0x-prefixed hex) value string into a U256
pub fn parse_value(value: &str) -> Result<U256, DecodeError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Ok(U256::ZERO);
    }
    trimmed
        .parse::<U256>()
        .map_err(|e| DecodeError::InvalidValue(format!("{trimmed}: {e}")))
}

/// Convert a wei amount into native-token units for heuristics
///
/// Goes through the decimal representation so amounts above 128 bits do not
/// truncate; precision loss here only affects threshold comparisons.
pub fn wei_to_native(value: U256) -> f64 {
    value.to_string().parse::<f64>().unwrap_or(f64::MAX) / 1e18
}

/// Get current timestamp in milliseconds
pub fn current_timestamp_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tx(to: &str, value: &str, data: &str) -> Transaction {
        Transaction {
            hash: "0xabc".to_string(),
            from: "0xf39Fd6e51aad88F6F4ce6aB8827279cffFb92266".to_string(),
            to: to.to_string(),
            value: value.to_string(),
            data: data.to_string(),
            block_number: 1,
            timestamp: 1_700_000_000,
            network: "ethereum".to_string(),
            success: true,
        }
    }

    // ==================== calldata / creation tests ====================

    #[test]
    fn test_empty_calldata_variants() {
        assert!(tx("0x1", "0", "").has_empty_calldata());
        assert!(tx("0x1", "0", "0x").has_empty_calldata());
        assert!(!tx("0x1", "0", "0xa9059cbb").has_empty_calldata());
    }

    #[test]
    fn test_contract_creation_detection() {
        assert!(tx("", "0", "0x60").is_contract_creation());
        assert!(tx(ZERO_ADDRESS, "0", "0x60").is_contract_creation());
        assert!(!tx("0x7a250d5630b4cf539739df2c5dacb4c659f2488d", "0", "0x").is_contract_creation());
    }

    // ==================== value parsing tests ====================

    #[test]
    fn test_parse_value_beyond_u64() {
        let v = parse_value("340282366920938463463374607431768211456").unwrap();
        assert_eq!(v.to_string(), "340282366920938463463374607431768211456");
    }

    #[test]
    fn test_parse_value_empty_is_zero() {
        assert_eq!(parse_value("").unwrap(), U256::ZERO);
    }

    #[test]
    fn test_parse_value_hex_prefixed() {
        assert_eq!(parse_value("0x0de0b6b3a7640000").unwrap().to_string(), "1000000000000000000");
    }

    #[test]
    fn test_parse_value_invalid() {
        assert!(matches!(parse_value("12abc"), Err(DecodeError::InvalidValue(_))));
    }

    #[test]
    fn test_wei_to_native() {
        let one_eth = parse_value("1000000000000000000").unwrap();
        assert!((wei_to_native(one_eth) - 1.0).abs() < f64::EPSILON);
    }

    // ==================== address helper tests ====================

    #[test]
    fn test_canonical_address_lowercases() {
        assert_eq!(
            canonical_address(" 0xF39Fd6e51aad88F6F4ce6aB8827279cffFb92266 "),
            "0xf39fd6e51aad88f6f4ce6ab8827279cfffb92266"
        );
    }

    #[test]
    fn test_is_zero_address() {
        assert!(is_zero_address(ZERO_ADDRESS));
        assert!(is_zero_address("0x0"));
        assert!(!is_zero_address("0x"));
        assert!(!is_zero_address("0x01"));
    }

    #[test]
    fn test_parse_and_format_address() {
        let addr = parse_address("0xF39Fd6e51aad88F6F4ce6aB8827279cffFb92266").unwrap();
        assert_eq!(format_address(addr), "0xf39fd6e51aad88f6f4ce6ab8827279cfffb92266");
        assert!(parse_address("not-an-address").is_none());
    }

    #[test]
    fn test_transaction_deserializes_with_input_alias() {
        let json = r#"{"hash":"0x1","from":"0xa","to":"0xb","value":"5","input":"0xd0e30db0","blockNumber":7,"timestamp":9}"#;
        let parsed: Transaction = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.data, "0xd0e30db0");
        assert!(parsed.success);
        assert_eq!(parsed.network, "");
    }
}
