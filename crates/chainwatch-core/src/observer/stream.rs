//! Streamed transaction submission: send, then observe the returned hash.

use std::pin::Pin;
use std::task::{Context, Poll};

use futures::{Stream, StreamExt};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use super::TransactionObserver;
use crate::dispatcher::Method;
use crate::error::SubmissionError;
use crate::types::{ConfirmationEvent, Confirmed};

/// Events of a streamed submission, in order: one `TransactionHash`, zero or
/// more `Confirmation`s, then exactly one `Receipt` or `Error`.
#[derive(Debug, Clone)]
pub enum TransactionEvent {
    TransactionHash(String),
    Confirmation(ConfirmationEvent),
    Receipt(Confirmed),
    Error(SubmissionError),
}

impl TransactionEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Receipt(_) | Self::Error(_))
    }
}

/// Handle to a streamed submission. Dropping it stops the submission task.
#[derive(Debug)]
pub struct TransactionStream {
    events: mpsc::UnboundedReceiver<TransactionEvent>,
    outcome: oneshot::Receiver<Result<Confirmed, SubmissionError>>,
    task: JoinHandle<()>,
}

impl TransactionStream {
    /// Wait for the terminal result; the same value the stream's final event
    /// carries.
    pub async fn outcome(mut self) -> Result<Confirmed, SubmissionError> {
        (&mut self.outcome)
            .await
            .unwrap_or(Err(SubmissionError::Cancelled))
    }
}

impl Stream for TransactionStream {
    type Item = TransactionEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.events.poll_recv(cx)
    }
}

impl Drop for TransactionStream {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl TransactionObserver {
    /// Submit a transaction with `method` (whose result is the transaction
    /// hash) and observe it with this observer's settings.
    pub fn execute_streaming(&self, method: Method<String>, params: Vec<Value>) -> TransactionStream {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (outcome_tx, outcome_rx) = oneshot::channel();
        let observer = self.clone();

        let task = tokio::spawn(async move {
            let result = submit_and_observe(&observer, &method, params, &events_tx).await;
            let terminal = match &result {
                Ok(done) => TransactionEvent::Receipt(done.clone()),
                Err(e) => TransactionEvent::Error(e.clone()),
            };
            let _ = events_tx.send(terminal);
            let _ = outcome_tx.send(result);
        });

        TransactionStream {
            events: events_rx,
            outcome: outcome_rx,
            task,
        }
    }
}

async fn submit_and_observe(
    observer: &TransactionObserver,
    method: &Method<String>,
    params: Vec<Value>,
    events: &mpsc::UnboundedSender<TransactionEvent>,
) -> Result<Confirmed, SubmissionError> {
    let tx_hash = observer
        .dispatcher()
        .execute(method, params)
        .await
        .map_err(SubmissionError::Dispatch)?;
    tracing::debug!(tx = %tx_hash, method = method.name(), "transaction submitted");
    let _ = events.send(TransactionEvent::TransactionHash(tx_hash.clone()));

    let mut observation = observer.observe(tx_hash);
    while let Some(event) = observation.next().await {
        let _ = events.send(TransactionEvent::Confirmation(event));
    }
    observation.outcome().await.map_err(SubmissionError::Observe)
}
