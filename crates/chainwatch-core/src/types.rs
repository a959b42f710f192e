//! Chain types observed while tracking a transaction.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use crate::format::{self, opt_quantity, quantity};

// ─── BlockHeader ──────────────────────────────────────────────────────────────

/// The three header fields the continuity check needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockHeader {
    /// Block number.
    #[serde(with = "quantity")]
    pub number: u64,
    /// Block hash (`0x…`).
    pub hash: String,
    /// Parent block hash (`0x…`).
    pub parent_hash: String,
}

impl BlockHeader {
    pub fn new(number: u64, hash: impl Into<String>, parent_hash: impl Into<String>) -> Self {
        Self {
            number,
            hash: hash.into(),
            parent_hash: parent_hash.into(),
        }
    }

    /// Returns `true` if `parent`'s hash is this block's `parent_hash`.
    pub fn is_child_of(&self, parent: &BlockHeader) -> bool {
        format::same_hash(&self.parent_hash, &parent.hash)
    }

    /// Decode a header from a `newHeads` push or an `eth_getBlockBy*` result.
    /// Extra fields are ignored; `null` yields `None`.
    pub fn from_json(v: &Value) -> Option<Self> {
        if v.is_null() {
            return None;
        }
        serde_json::from_value(v.clone()).ok()
    }

    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

// ─── TransactionReceipt ───────────────────────────────────────────────────────

/// Execution status reported in a receipt.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ReceiptStatus {
    /// Pre-Byzantium receipts carry no status.
    #[default]
    Unknown,
    Success,
    Failure,
}

impl Serialize for ReceiptStatus {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Unknown => s.serialize_none(),
            Self::Success => s.serialize_str("0x1"),
            Self::Failure => s.serialize_str("0x0"),
        }
    }
}

impl<'de> Deserialize<'de> for ReceiptStatus {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let raw = Option::<Value>::deserialize(d)?;
        Ok(match raw {
            Some(Value::String(s)) => match format::parse_hex_u64(&s) {
                Some(1) => Self::Success,
                Some(0) => Self::Failure,
                _ => Self::Unknown,
            },
            Some(Value::Bool(true)) => Self::Success,
            Some(Value::Bool(false)) => Self::Failure,
            _ => Self::Unknown,
        })
    }
}

impl std::fmt::Display for ReceiptStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unknown => write!(f, "unknown"),
            Self::Success => write!(f, "success"),
            Self::Failure => write!(f, "failure"),
        }
    }
}

/// The subset of a transaction receipt the observer relies on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionReceipt {
    pub transaction_hash: String,
    #[serde(default)]
    pub block_hash: Option<String>,
    #[serde(default, with = "opt_quantity")]
    pub block_number: Option<u64>,
    #[serde(default, skip_serializing_if = "is_unknown")]
    pub status: ReceiptStatus,
}

fn is_unknown(status: &ReceiptStatus) -> bool {
    *status == ReceiptStatus::Unknown
}

impl TransactionReceipt {
    /// Receipt for a transaction included in `block`.
    pub fn mined(tx_hash: impl Into<String>, block: &BlockHeader, status: ReceiptStatus) -> Self {
        Self {
            transaction_hash: tx_hash.into(),
            block_hash: Some(block.hash.clone()),
            block_number: Some(block.number),
            status,
        }
    }

    /// Returns `true` once the receipt names its containing block.
    pub fn is_mined(&self) -> bool {
        self.block_hash.is_some() && self.block_number.is_some()
    }

    pub fn is_success(&self) -> bool {
        self.status == ReceiptStatus::Success
    }
}

// ─── Confirmation progress ────────────────────────────────────────────────────

/// Emitted on every accepted progress step of an observation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfirmationEvent {
    pub receipt: TransactionReceipt,
    pub confirmations: u64,
    pub confirmation_checks: u64,
}

/// Successful outcome of an observation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Confirmed {
    pub receipt: TransactionReceipt,
    pub confirmations: u64,
    pub confirmation_checks: u64,
}

/// Partial progress attached to every observation failure, so callers can
/// tell "still pending" apart from "definitely failed".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Progress {
    pub receipt: Option<TransactionReceipt>,
    pub confirmations: u64,
    pub confirmation_checks: u64,
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn header_from_new_heads_payload() {
        let payload = json!({
            "number": "0x1b4",
            "hash": "0xdc0818cf",
            "parentHash": "0xe99e022112",
            "miner": "0x0000000000000000000000000000000000000000",
            "timestamp": "0x55ba467c"
        });
        let header = BlockHeader::from_json(&payload).unwrap();
        assert_eq!(header.number, 436);
        assert_eq!(header.parent_hash, "0xe99e022112");
        assert_eq!(BlockHeader::from_json(&Value::Null), None);
    }

    #[test]
    fn header_json_round_trip_uses_hex_numbers() {
        let header = BlockHeader::new(16, "0xb", "0xa");
        let v = header.to_json();
        assert_eq!(v["number"], "0x10");
        assert_eq!(v["parentHash"], "0xa");
    }

    #[test]
    fn child_check_ignores_case() {
        let parent = BlockHeader::new(1, "0xABC", "0x0");
        let child = BlockHeader::new(2, "0xdef", "0xabc");
        assert!(child.is_child_of(&parent));
        assert!(!parent.is_child_of(&child));
    }

    #[test]
    fn receipt_decodes_status_and_pending_fields() {
        let mined: TransactionReceipt = serde_json::from_value(json!({
            "transactionHash": "0x01",
            "blockHash": "0xaa",
            "blockNumber": "0x2",
            "status": "0x1",
            "gasUsed": "0x5208"
        }))
        .unwrap();
        assert!(mined.is_mined());
        assert!(mined.is_success());
        assert_eq!(mined.block_number, Some(2));

        let pending: TransactionReceipt = serde_json::from_value(json!({
            "transactionHash": "0x01",
            "blockHash": null,
            "blockNumber": null
        }))
        .unwrap();
        assert!(!pending.is_mined());
        assert_eq!(pending.status, ReceiptStatus::Unknown);
    }

    #[test]
    fn failed_receipt_status() {
        let r: TransactionReceipt = serde_json::from_value(json!({
            "transactionHash": "0x01",
            "blockHash": "0xaa",
            "blockNumber": "0x2",
            "status": "0x0"
        }))
        .unwrap();
        assert_eq!(r.status, ReceiptStatus::Failure);
        assert_eq!(serde_json::to_value(&r).unwrap()["status"], "0x0");
    }
}
