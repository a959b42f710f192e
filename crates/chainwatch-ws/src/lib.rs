//! chainwatch-ws: WebSocket JSON-RPC provider with auto-reconnect.
//!
//! # Features
//! - Request multiplexing over a single connection, with caller ids re-mapped
//!   to connection-unique wire ids
//! - `eth_subscribe` / `eth_unsubscribe` and `eth_subscription` push routing
//! - Auto-reconnect on disconnect (exponential backoff), announced through
//!   `Connect` / `Close` events so a `SubscriptionRegistry` can restore
//!   subscriptions

pub mod client;

pub use client::{WsProvider, WsProviderConfig};
