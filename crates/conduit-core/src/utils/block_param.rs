//! Block parameter parsing and block-reference extraction from EVM requests.
//!
//! The eligibility filter only needs one thing from a request: the specific historical
//! block number it targets, if that can be determined. Tags such as `latest` or
//! `pending` never yield a number.

use serde_json::Value;
use thiserror::Error;

/// Error types for block parameter parsing
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("invalid hex string: {0}")]
    InvalidHex(String),
    #[error("invalid number: {0}")]
    InvalidNumber(String),
}

/// Block reference carried by an EVM JSON-RPC parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockRef {
    Number(u64),
    Tag(BlockTag),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockTag {
    Latest,
    Earliest,
    Pending,
    Safe,
    Finalized,
}

impl TryFrom<&str> for BlockRef {
    type Error = ParseError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        BlockParameter::parse(value)
    }
}

/// Where a method carries its block parameter.
enum BlockPosition {
    /// Positional string parameter at the given index.
    Index(usize),
    /// Filter object at index 0, reading the given keys in order.
    Filter(&'static [&'static str]),
}

fn block_position(method: &str) -> Option<BlockPosition> {
    match method {
        "eth_getBlockByNumber" |
        "eth_getBlockTransactionCountByNumber" |
        "eth_getUncleCountByBlockNumber" |
        "eth_getTransactionByBlockNumberAndIndex" |
        "eth_getUncleByBlockNumberAndIndex" |
        "eth_getBlockReceipts" |
        "trace_block" |
        "debug_traceBlockByNumber" => Some(BlockPosition::Index(0)),
        "eth_getBalance" |
        "eth_getCode" |
        "eth_getTransactionCount" |
        "eth_call" |
        "eth_estimateGas" |
        "debug_traceCall" => Some(BlockPosition::Index(1)),
        "eth_getStorageAt" | "eth_getProof" => Some(BlockPosition::Index(2)),
        "eth_getLogs" | "trace_filter" => {
            Some(BlockPosition::Filter(&["fromBlock", "toBlock"]))
        }
        _ => None,
    }
}

/// Block parameter parsing helpers.
pub struct BlockParameter;

impl BlockParameter {
    /// Parses a block parameter string.
    ///
    /// Accepts `0x`-prefixed hex, plain decimal, and the standard tags.
    ///
    /// # Errors
    /// Returns `ParseError` if the input is not a valid block parameter.
    pub fn parse(param: &str) -> Result<BlockRef, ParseError> {
        match param {
            "latest" => Ok(BlockRef::Tag(BlockTag::Latest)),
            "pending" => Ok(BlockRef::Tag(BlockTag::Pending)),
            "earliest" => Ok(BlockRef::Tag(BlockTag::Earliest)),
            "safe" => Ok(BlockRef::Tag(BlockTag::Safe)),
            "finalized" => Ok(BlockRef::Tag(BlockTag::Finalized)),
            s => {
                if let Some(hex_str) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
                    u64::from_str_radix(hex_str, 16)
                        .map(BlockRef::Number)
                        .map_err(|_| ParseError::InvalidHex(s.to_string()))
                } else {
                    s.parse::<u64>()
                        .map(BlockRef::Number)
                        .map_err(|_| ParseError::InvalidNumber(s.to_string()))
                }
            }
        }
    }

    /// Parses a hex quantity (with or without `0x`).
    #[must_use]
    pub fn parse_hex(s: &str) -> Option<u64> {
        let s = s.strip_prefix("0x").unwrap_or(s);
        u64::from_str_radix(s, 16).ok()
    }

    /// Extracts the historical block number targeted by an EVM request.
    ///
    /// Returns `None` when the method carries no block parameter, when the parameter is a
    /// tag, or when it cannot be parsed. For filter-style methods the lowest determinable
    /// bound is returned since that is the oldest block the node must serve.
    ///
    /// ```
    /// use conduit_core::utils::block_param::BlockParameter;
    /// use serde_json::json;
    ///
    /// let params = json!(["0x0000000000000000000000000000000000000001", "0x352"]);
    /// assert_eq!(BlockParameter::from_request("eth_getBalance", Some(&params)), Some(850));
    /// assert_eq!(BlockParameter::from_request("eth_getBalance", Some(&json!(["0x1", "latest"]))), None);
    /// ```
    #[must_use]
    pub fn from_request(method: &str, params: Option<&Value>) -> Option<u64> {
        let params = params?.as_array()?;

        match block_position(method)? {
            BlockPosition::Index(idx) => Self::number_from_value(params.get(idx)?),
            BlockPosition::Filter(keys) => {
                let filter = params.first()?.as_object()?;
                keys.iter()
                    .filter_map(|key| filter.get(*key).and_then(Self::number_from_value))
                    .min()
            }
        }
    }

    fn number_from_value(value: &Value) -> Option<u64> {
        match value {
            Value::String(s) => match Self::parse(s).ok()? {
                BlockRef::Number(n) => Some(n),
                BlockRef::Tag(_) => None,
            },
            Value::Number(n) => n.as_u64(),
            // EIP-1898 block object
            Value::Object(map) => map.get("blockNumber").and_then(Self::number_from_value),
            _ => None,
        }
    }

    /// Rewrites a hex quantity into its canonical form (lowercase, no leading zeros).
    ///
    /// Values that are not hex quantities are returned unchanged.
    #[must_use]
    pub fn canonical_quantity(value: &str) -> Option<String> {
        let digits = value.strip_prefix("0x").or_else(|| value.strip_prefix("0X"))?;
        if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_hexdigit()) {
            return None;
        }
        let trimmed = digits.trim_start_matches('0');
        if trimmed.is_empty() {
            return Some("0x0".to_string());
        }
        Some(format!("0x{}", trimmed.to_ascii_lowercase()))
    }

    /// Canonicalizes the block parameter of `method` in place, if it has one.
    ///
    /// Returns `true` when a value was rewritten.
    pub fn normalize_request_params(method: &str, params: &mut Value) -> bool {
        let Some(position) = block_position(method) else {
            return false;
        };
        let Some(params) = params.as_array_mut() else {
            return false;
        };

        let mut rewrite = |slot: &mut Value| -> bool {
            if let Value::String(s) = slot {
                if let Some(canonical) = Self::canonical_quantity(s) {
                    if &canonical != s {
                        *s = canonical;
                        return true;
                    }
                }
            }
            false
        };

        match position {
            BlockPosition::Index(idx) => params.get_mut(idx).is_some_and(&mut rewrite),
            BlockPosition::Filter(keys) => {
                let Some(filter) = params.first_mut().and_then(Value::as_object_mut) else {
                    return false;
                };
                let mut changed = false;
                for key in keys {
                    if let Some(slot) = filter.get_mut(*key) {
                        changed |= rewrite(slot);
                    }
                }
                changed
            }
        }
    }
}
