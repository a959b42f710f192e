//! The shared step function both strategies feed, plus the cancellation
//! signal and event sink a session runs with.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::{mpsc, Notify};

use super::chain::ChainReader;
use super::session::ObservationSession;
use crate::error::{DispatchError, ObserveError, SubscriptionError, TimeoutLimit};
use crate::registry::{SubscriptionHandle, SubscriptionRegistry};
use crate::types::{BlockHeader, ConfirmationEvent, Confirmed};

/// One-way cancellation flag shared by an `Observation` and its task.
#[derive(Debug, Default)]
pub(crate) struct Cancellation {
    cancelled: AtomicBool,
    notify: Notify,
}

impl Cancellation {
    pub(crate) fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Resolves once [`cancel`](Self::cancel) has been called.
    pub(crate) async fn cancelled(&self) {
        let notified = self.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if self.is_cancelled() {
            return;
        }
        notified.await;
    }
}

/// Event channel that goes quiet as soon as the session is cancelled.
pub(crate) struct EventSink {
    tx: Option<mpsc::UnboundedSender<ConfirmationEvent>>,
    cancel: std::sync::Arc<Cancellation>,
}

impl EventSink {
    pub(crate) fn new(
        tx: mpsc::UnboundedSender<ConfirmationEvent>,
        cancel: std::sync::Arc<Cancellation>,
    ) -> Self {
        Self { tx: Some(tx), cancel }
    }

    fn emit(&self, event: ConfirmationEvent) {
        if self.cancel.is_cancelled() {
            return;
        }
        if let Some(tx) = &self.tx {
            let _ = tx.send(event);
        }
    }

    /// Drop the sender so the caller's stream ends.
    pub(crate) fn close(&mut self) {
        self.tx = None;
    }
}

/// Runs the step algorithm for one session and owns everything teardown
/// has to release.
pub(crate) struct SessionDriver {
    pub(crate) session: ObservationSession,
    pub(crate) chain: ChainReader,
    sink: EventSink,
    block_timeout: Option<u64>,
    /// New heads seen while the receipt was still missing.
    pending_blocks: u64,
    highest_pending: Option<u64>,
    subscription: Option<(SubscriptionRegistry, SubscriptionHandle)>,
}

impl SessionDriver {
    pub(crate) fn new(
        session: ObservationSession,
        chain: ChainReader,
        sink: EventSink,
        block_timeout: Option<u64>,
    ) -> Self {
        Self {
            session,
            chain,
            sink,
            block_timeout,
            pending_blocks: 0,
            highest_pending: None,
            subscription: None,
        }
    }

    /// One check. `block` is the header that triggered it, if any.
    ///
    /// Returns `Some` when the session is satisfied.
    pub(crate) async fn step(
        &mut self,
        block: Option<&BlockHeader>,
    ) -> Result<Option<Confirmed>, ObserveError> {
        let check = self.session.begin_check();
        tracing::debug!(
            tx = %self.session.tx_hash(),
            check,
            block = block.map(|b| b.number),
            confirmations = self.session.confirmations(),
            "confirmation check"
        );

        if self.session.has_receipt() {
            if let Some(block) = block {
                if let Some(event) = self.session.accept_block(block) {
                    self.sink.emit(event);
                }
            }
            return Ok(self.session.confirmed());
        }

        let receipt = self
            .chain
            .receipt(self.session.tx_hash())
            .await
            .map_err(|e| self.dispatch_failed(e))?;

        let Some(receipt) = receipt else {
            if self.session.required() == 0 {
                return Err(ObserveError::NoReceipt {
                    tx_hash: self.session.tx_hash().to_string(),
                    progress: self.session.progress(),
                });
            }
            self.count_pending(block)?;
            return Ok(None);
        };

        let containing = if self.session.required() == 0 {
            None
        } else {
            let header = self
                .chain
                .containing_block(&receipt)
                .await
                .map_err(|e| self.dispatch_failed(e))?;
            if header.is_none() {
                // Receipt and block disagree, usually mid-reorg or a node
                // still importing. Try again on the next check.
                tracing::debug!(tx = %self.session.tx_hash(), block = ?receipt.block_hash, "containing block not found yet");
                return Ok(None);
            }
            header
        };

        tracing::info!(
            tx = %self.session.tx_hash(),
            block = receipt.block_number,
            status = %receipt.status,
            "receipt found"
        );
        let event = self.session.record_receipt(receipt, containing);
        self.sink.emit(event);

        // The triggering head counts only if it sits directly on the
        // containing block. A head further up must not move the anchor;
        // `catch_up` walks the blocks in between.
        if let Some(block) = block {
            let extends = self.session.last_block().is_some_and(|c| block.is_child_of(c));
            if extends && !self.session.is_satisfied() {
                if let Some(event) = self.session.accept_block(block) {
                    self.sink.emit(event);
                }
            }
        }
        Ok(self.session.confirmed())
    }

    /// Walk canonical blocks from `last_block + 1` up to `to`, one check per
    /// block. Stops at the first block the node cannot serve yet. Does
    /// nothing until the receipt has anchored the session.
    pub(crate) async fn catch_up(&mut self, to: u64) -> Result<Option<Confirmed>, ObserveError> {
        let Some(last) = self.session.last_block().map(|b| b.number) else {
            return Ok(None);
        };
        for number in last + 1..=to {
            let block = self
                .chain
                .block_by_number(number)
                .await
                .map_err(|e| self.dispatch_failed(e))?;
            let Some(block) = block else {
                tracing::debug!(tx = %self.session.tx_hash(), number, "block not available yet");
                break;
            };
            if let Some(done) = self.step(Some(&block)).await? {
                return Ok(Some(done));
            }
        }
        Ok(None)
    }

    fn count_pending(&mut self, block: Option<&BlockHeader>) -> Result<(), ObserveError> {
        let (Some(limit), Some(block)) = (self.block_timeout, block) else {
            return Ok(());
        };
        if self.highest_pending.is_some_and(|n| block.number <= n) {
            return Ok(());
        }
        self.highest_pending = Some(block.number);
        self.pending_blocks += 1;
        if self.pending_blocks >= limit {
            return Err(ObserveError::Timeout {
                tx_hash: self.session.tx_hash().to_string(),
                limit: TimeoutLimit::Blocks(limit),
                required: self.session.required(),
                progress: self.session.progress(),
            });
        }
        Ok(())
    }

    pub(crate) fn dispatch_failed(&self, source: DispatchError) -> ObserveError {
        ObserveError::Dispatch {
            tx_hash: self.session.tx_hash().to_string(),
            source,
            progress: self.session.progress(),
        }
    }

    pub(crate) fn subscription_failed(&self, source: SubscriptionError) -> ObserveError {
        ObserveError::Subscription {
            tx_hash: self.session.tx_hash().to_string(),
            source,
            progress: self.session.progress(),
        }
    }

    pub(crate) fn deadline_passed(&self, timeout: Duration) -> ObserveError {
        ObserveError::Timeout {
            tx_hash: self.session.tx_hash().to_string(),
            limit: TimeoutLimit::Deadline(timeout),
            required: self.session.required(),
            progress: self.session.progress(),
        }
    }

    pub(crate) fn cancelled(&self) -> ObserveError {
        ObserveError::Cancelled {
            tx_hash: self.session.tx_hash().to_string(),
            progress: self.session.progress(),
        }
    }

    /// Remember the push subscription so teardown can release it.
    pub(crate) fn hold_subscription(&mut self, registry: SubscriptionRegistry, handle: SubscriptionHandle) {
        self.subscription = Some((registry, handle));
    }

    /// Close the event stream and release the push subscription, if any.
    pub(crate) async fn teardown(&mut self) {
        self.sink.close();
        let Some((registry, handle)) = self.subscription.take() else {
            return;
        };
        match registry.unsubscribe(handle).await {
            Ok(_) => tracing::debug!(tx = %self.session.tx_hash(), %handle, "block subscription released"),
            Err(e) => tracing::debug!(tx = %self.session.tx_hash(), error = %e, "releasing block subscription failed"),
        }
    }
}
