//! The handful of `eth_*` methods needed to observe confirmations.

use serde_json::Value;

use crate::dispatcher::Method;
use crate::format;
use crate::types::{BlockHeader, TransactionReceipt};

/// `eth_blockNumber` → head number.
pub fn block_number() -> Method<u64> {
    Method::<Value>::new("eth_blockNumber", 0).with_after(|v| {
        v.as_str()
            .and_then(format::parse_hex_u64)
            .ok_or_else(|| format!("expected hex quantity, got {v}"))
    })
}

/// `eth_getTransactionReceipt(hash)` → `None` until mined.
pub fn transaction_receipt() -> Method<Option<TransactionReceipt>> {
    Method::new("eth_getTransactionReceipt", 1)
}

/// `eth_getBlockByNumber(number)`; the hook hex-encodes the number and asks
/// for transaction hashes only.
pub fn block_by_number() -> Method<Option<BlockHeader>> {
    Method::<Value>::new("eth_getBlockByNumber", 1)
        .with_before(|params| {
            let tag = match &params[0] {
                Value::Number(n) => n
                    .as_u64()
                    .map(format::to_hex)
                    .ok_or_else(|| format!("invalid block number {n}"))?,
                Value::String(s) if is_block_tag(s) => s.clone(),
                other => return Err(format!("invalid block number {other}")),
            };
            Ok(vec![Value::String(tag), Value::Bool(false)])
        })
        .with_after(header_or_null)
}

/// `eth_getBlockByHash(hash)`.
pub fn block_by_hash() -> Method<Option<BlockHeader>> {
    Method::<Value>::new("eth_getBlockByHash", 1)
        .with_before(|mut params| {
            params.push(Value::Bool(false));
            Ok(params)
        })
        .with_after(header_or_null)
}

/// `eth_sendRawTransaction(data)` → transaction hash.
pub fn send_raw_transaction() -> Method<String> {
    Method::new("eth_sendRawTransaction", 1)
}

fn is_block_tag(s: &str) -> bool {
    matches!(s, "latest" | "earliest" | "pending" | "safe" | "finalized")
        || format::parse_hex_u64(s).is_some() && s.starts_with("0x")
}

fn header_or_null(v: Value) -> Result<Option<BlockHeader>, String> {
    if v.is_null() {
        return Ok(None);
    }
    serde_json::from_value(v).map(Some).map_err(|e| e.to_string())
}
