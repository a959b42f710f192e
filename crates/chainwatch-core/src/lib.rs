//! chainwatch-core: reorg-safe transaction confirmation tracking over JSON-RPC.
//!
//! # Architecture
//!
//! ```text
//! TransactionObserver::observe(hash) → Observation (Stream + outcome)
//!        ├── push strategy → SubscriptionRegistry → Provider (newHeads)
//!        └── poll strategy → RequestDispatcher    → Provider (eth_*)
//! ```
//!
//! - [`Provider`]: the transport trait (HTTP, WebSocket, in-process)
//! - [`RequestDispatcher`] / [`Method`]: arity-checked calls with hooks
//! - [`SubscriptionRegistry`]: logical handles over transport subscriptions
//! - [`TransactionObserver`]: confirmation counting with a parent-hash
//!   continuity check
//! - [`LocalProvider`]: an in-memory node for single-process use and tests

pub mod dispatcher;
pub mod error;
pub mod format;
pub mod local;
pub mod methods;
pub mod observer;
pub mod provider;
pub mod registry;
pub mod request;
pub mod types;

pub use dispatcher::{Method, RequestDispatcher};
pub use error::{
    DispatchError, ObserveError, ProviderError, SubmissionError, SubscriptionError, TimeoutLimit,
};
pub use local::LocalProvider;
pub use observer::{
    Observation, ObserverConfig, TransactionEvent, TransactionObserver, TransactionStream,
};
pub use provider::{EventEmitter, EventKind, ListenerId, Provider, ProviderEvent, SubscriptionId};
pub use registry::{SubscriptionHandle, SubscriptionMessage, SubscriptionRegistry};
pub use request::{JsonRpcError, JsonRpcRequest, JsonRpcResponse, RpcId};
pub use types::{
    BlockHeader, ConfirmationEvent, Confirmed, Progress, ReceiptStatus, TransactionReceipt,
};
