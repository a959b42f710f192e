//! Confirmation counting for one observed transaction.
//!
//! This is the pure half of the observer: it holds the receipt, the last
//! accepted block and the counters, and applies the continuity rule. It never
//! talks to a node; the driver feeds it fetched receipts and headers.

use crate::types::{BlockHeader, ConfirmationEvent, Confirmed, Progress, TransactionReceipt};

/// Progress of one `observe()` call.
#[derive(Debug, Clone)]
pub struct ObservationSession {
    tx_hash: String,
    required: u64,
    receipt: Option<TransactionReceipt>,
    last_block: Option<BlockHeader>,
    confirmations: u64,
    confirmation_checks: u64,
}

impl ObservationSession {
    pub fn new(tx_hash: impl Into<String>, required: u64) -> Self {
        Self {
            tx_hash: tx_hash.into(),
            required,
            receipt: None,
            last_block: None,
            confirmations: 0,
            confirmation_checks: 0,
        }
    }

    pub fn tx_hash(&self) -> &str {
        &self.tx_hash
    }

    pub fn required(&self) -> u64 {
        self.required
    }

    /// Count one check. Every step starts here.
    pub fn begin_check(&mut self) -> u64 {
        self.confirmation_checks += 1;
        self.confirmation_checks
    }

    pub fn has_receipt(&self) -> bool {
        self.receipt.is_some()
    }

    /// Store the receipt the first time it is seen and anchor the count at its
    /// containing block.
    pub fn record_receipt(
        &mut self,
        receipt: TransactionReceipt,
        containing: Option<BlockHeader>,
    ) -> ConfirmationEvent {
        self.receipt = Some(receipt.clone());
        self.last_block = containing;
        self.confirmations = 0;
        self.event(receipt)
    }

    /// Evaluate `block` against the last accepted block.
    ///
    /// Only a block whose parent is the last accepted block counts. Any other
    /// block is ignored, except that a higher block replaces the anchor so
    /// counting can resume on the new branch.
    pub fn accept_block(&mut self, block: &BlockHeader) -> Option<ConfirmationEvent> {
        let receipt = self.receipt.clone()?;
        let Some(last) = &self.last_block else {
            self.last_block = Some(block.clone());
            return None;
        };

        if block.is_child_of(last) {
            self.confirmations += 1;
            self.last_block = Some(block.clone());
            return Some(self.event(receipt));
        }

        if block.number == last.number + 1 {
            tracing::warn!(
                tx = %self.tx_hash,
                number = block.number,
                hash = %block.hash,
                parent = %block.parent_hash,
                expected_parent = %last.hash,
                "block does not extend the last accepted block, possible reorg"
            );
        } else {
            tracing::debug!(
                tx = %self.tx_hash,
                number = block.number,
                last = last.number,
                "block is not a child of the last accepted block"
            );
        }
        if block.number > last.number {
            self.last_block = Some(block.clone());
        }
        None
    }

    /// `true` once the receipt is buried under the required confirmations.
    pub fn is_satisfied(&self) -> bool {
        self.receipt.is_some() && self.confirmations >= self.required
    }

    pub fn confirmations(&self) -> u64 {
        self.confirmations
    }

    pub fn confirmation_checks(&self) -> u64 {
        self.confirmation_checks
    }

    pub fn last_block(&self) -> Option<&BlockHeader> {
        self.last_block.as_ref()
    }

    pub fn receipt(&self) -> Option<&TransactionReceipt> {
        self.receipt.as_ref()
    }

    pub fn progress(&self) -> Progress {
        Progress {
            receipt: self.receipt.clone(),
            confirmations: self.confirmations,
            confirmation_checks: self.confirmation_checks,
        }
    }

    /// The success value, once satisfied.
    pub fn confirmed(&self) -> Option<Confirmed> {
        if !self.is_satisfied() {
            return None;
        }
        self.receipt.clone().map(|receipt| Confirmed {
            receipt,
            confirmations: self.confirmations,
            confirmation_checks: self.confirmation_checks,
        })
    }

    fn event(&self, receipt: TransactionReceipt) -> ConfirmationEvent {
        ConfirmationEvent {
            receipt,
            confirmations: self.confirmations,
            confirmation_checks: self.confirmation_checks,
        }
    }
}
