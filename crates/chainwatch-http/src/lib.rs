//! chainwatch-http: request/response JSON-RPC provider over HTTP.
//!
//! [`HttpProvider`] sends one self-contained POST per request and never
//! supports subscriptions, so observers built on it use the poll strategy.

pub mod client;

pub use client::{HttpProvider, HttpProviderConfig};
