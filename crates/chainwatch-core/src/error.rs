//! Error types for every layer: transport, dispatch, subscriptions and
//! observation sessions.

use std::time::Duration;

use thiserror::Error;

use crate::registry::SubscriptionHandle;
use crate::request::JsonRpcError;
use crate::types::{Progress, TransactionReceipt};

/// Errors raised by a [`Provider`](crate::provider::Provider).
#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    /// HTTP request failed (connection refused, bad status, etc.).
    #[error("HTTP error: {0}")]
    Http(String),

    /// WebSocket connection/send/receive error.
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    /// JSON-RPC protocol-level error returned by the node.
    #[error("RPC error {}: {}", .0.code, .0.message)]
    Rpc(JsonRpcError),

    /// No response arrived within the configured duration.
    #[error("Request timed out after {ms}ms")]
    Timeout { ms: u64 },

    /// Response could not be deserialized.
    #[error("Deserialization error: {0}")]
    Deserialization(String),

    /// The connection is closed and the request was not sent.
    #[error("Connection closed")]
    Closed,

    /// Subscribe/unsubscribe on a request/response-only transport.
    #[error("{operation} is not supported by this transport")]
    UnsupportedOperation { operation: &'static str },

    #[error("{0}")]
    Other(String),
}

impl From<serde_json::Error> for ProviderError {
    fn from(e: serde_json::Error) -> Self {
        Self::Deserialization(e.to_string())
    }
}

impl ProviderError {
    /// Returns `true` if this is a node-side error rather than a transport failure.
    pub fn is_execution_error(&self) -> bool {
        matches!(self, Self::Rpc(_))
    }
}

/// Errors raised by the [`RequestDispatcher`](crate::dispatcher::RequestDispatcher).
#[derive(Debug, Clone, Error)]
pub enum DispatchError {
    /// Caller bug: wrong number of params. Never sent, never retried.
    #[error("Invalid number of parameters for \"{method}\". Got {got} expected {expected}!")]
    Arity {
        method: String,
        expected: usize,
        got: usize,
    },

    /// The `before` hook rejected the params.
    #[error("Invalid params for \"{method}\": {reason}")]
    InvalidParams { method: String, reason: String },

    /// The `after` hook could not map the raw result.
    #[error("Unexpected result for \"{method}\": {reason}")]
    Format { method: String, reason: String },

    #[error(transparent)]
    Provider(#[from] ProviderError),
}

/// Errors raised by the [`SubscriptionRegistry`](crate::registry::SubscriptionRegistry).
#[derive(Debug, Clone, Error)]
pub enum SubscriptionError {
    /// The handle was never issued or has already been unsubscribed.
    #[error("Unknown subscription {0}")]
    UnknownSubscription(SubscriptionHandle),

    /// Re-subscribing after a reconnect failed; the subscription is gone.
    #[error("Re-subscribing to {topic} failed: {source}")]
    ResubscribeFailed {
        topic: String,
        #[source]
        source: ProviderError,
    },

    #[error(transparent)]
    Provider(#[from] ProviderError),
}

/// What bounded the wait when an observation timed out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutLimit {
    /// Wall-clock deadline.
    Deadline(Duration),
    /// Number of new blocks seen without a receipt.
    Blocks(u64),
}

impl std::fmt::Display for TimeoutLimit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Deadline(d) => write!(f, "{}ms", d.as_millis()),
            Self::Blocks(n) => write!(f, "{n} blocks"),
        }
    }
}

/// Terminal failure of an observation session. Every variant carries the
/// progress made before the failure.
#[derive(Debug, Clone, Error)]
pub enum ObserveError {
    /// Zero-confirmation mode found no receipt on its single check.
    #[error("No receipt found for transaction {tx_hash}")]
    NoReceipt { tx_hash: String, progress: Progress },

    #[error(
        "Transaction {tx_hash} was not confirmed within {limit}: {} of {required} confirmations",
        .progress.confirmations
    )]
    Timeout {
        tx_hash: String,
        limit: TimeoutLimit,
        required: u64,
        progress: Progress,
    },

    #[error("Fetching chain data for {tx_hash} failed: {source}")]
    Dispatch {
        tx_hash: String,
        #[source]
        source: DispatchError,
        progress: Progress,
    },

    #[error("Block subscription for {tx_hash} failed: {source}")]
    Subscription {
        tx_hash: String,
        #[source]
        source: SubscriptionError,
        progress: Progress,
    },

    /// The caller dropped or cancelled the observation.
    #[error("Observation of {tx_hash} was cancelled")]
    Cancelled { tx_hash: String, progress: Progress },
}

impl ObserveError {
    pub fn progress(&self) -> &Progress {
        match self {
            Self::NoReceipt { progress, .. }
            | Self::Timeout { progress, .. }
            | Self::Dispatch { progress, .. }
            | Self::Subscription { progress, .. }
            | Self::Cancelled { progress, .. } => progress,
        }
    }

    /// Last receipt seen before the failure, if any.
    pub fn receipt(&self) -> Option<&TransactionReceipt> {
        self.progress().receipt.as_ref()
    }

    pub fn confirmations(&self) -> u64 {
        self.progress().confirmations
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

/// Terminal failure of a streamed transaction submission.
#[derive(Debug, Clone, Error)]
pub enum SubmissionError {
    /// The submission call itself failed; no hash was obtained.
    #[error("Submitting transaction failed: {0}")]
    Dispatch(#[source] DispatchError),

    #[error(transparent)]
    Observe(ObserveError),

    /// The stream was dropped before a result was produced.
    #[error("Transaction stream was cancelled")]
    Cancelled,
}

impl SubmissionError {
    /// Progress made before the failure, when a hash was obtained.
    pub fn progress(&self) -> Option<&Progress> {
        match self {
            Self::Observe(e) => Some(e.progress()),
            _ => None,
        }
    }
}
