//! The `Provider` trait: the uniform seam over request/response transports
//! (HTTP) and persistent socket transports (WebSocket, in-process).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;

use crate::error::ProviderError;
use crate::request::{JsonRpcRequest, JsonRpcResponse};

/// Transport-assigned subscription id (the `eth_subscribe` result).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub String);

impl From<String> for SubscriptionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle and push events a provider emits.
#[derive(Debug, Clone)]
pub enum ProviderEvent {
    /// A connection was (re-)established. Previous subscriptions are gone.
    Connect,
    Error(ProviderError),
    Close,
    /// A push payload for a transport subscription.
    Message {
        subscription: SubscriptionId,
        payload: Value,
    },
}

impl ProviderEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Connect => EventKind::Connect,
            Self::Error(_) => EventKind::Error,
            Self::Close => EventKind::Close,
            Self::Message { .. } => EventKind::Message,
        }
    }
}

/// Event kinds a listener can register for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Connect,
    Error,
    Close,
    Message,
}

/// Token returned by [`Provider::on`], used to remove the listener again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

pub type EventHandler = Arc<dyn Fn(&ProviderEvent) + Send + Sync>;

/// Listener table shared by every provider implementation.
#[derive(Default)]
pub struct EventEmitter {
    next_id: AtomicU64,
    listeners: Mutex<Vec<(ListenerId, EventKind, EventHandler)>>,
}

impl EventEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(&self, kind: EventKind, handler: EventHandler) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, kind, handler));
        id
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.lock().unwrap_or_else(|e| e.into_inner());
        let before = listeners.len();
        listeners.retain(|(lid, _, _)| *lid != id);
        listeners.len() != before
    }

    /// Invoke every handler registered for the event's kind.
    ///
    /// Handlers run after the table lock is released, so a handler may add or
    /// remove listeners.
    pub fn emit(&self, event: &ProviderEvent) {
        let kind = event.kind();
        let handlers: Vec<EventHandler> = self
            .listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|(_, k, _)| *k == kind)
            .map(|(_, _, h)| Arc::clone(h))
            .collect();
        for handler in handlers {
            handler(event);
        }
    }

    pub fn listener_count(&self, kind: EventKind) -> usize {
        self.listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|(_, k, _)| *k == kind)
            .count()
    }
}

impl std::fmt::Debug for EventEmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let count = self.listeners.lock().map(|l| l.len()).unwrap_or(0);
        f.debug_struct("EventEmitter").field("listeners", &count).finish()
    }
}

/// The central async trait every node transport implements.
///
/// # Thread Safety
/// Implementations must be `Send + Sync` for use across Tokio tasks.
///
/// # Object Safety
/// The trait is object-safe and can be stored as `Arc<dyn Provider>`.
#[async_trait]
pub trait Provider: Send + Sync + 'static {
    /// Send one JSON-RPC request and return the matching response.
    ///
    /// The request id is chosen by the caller and echoed back in the response.
    async fn send(&self, req: JsonRpcRequest) -> Result<JsonRpcResponse, ProviderError>;

    /// `true` for transports that can deliver push subscriptions.
    fn supports_subscriptions(&self) -> bool {
        false
    }

    /// Open a transport-level subscription and return its id.
    async fn subscribe(
        &self,
        topic: &str,
        params: Vec<Value>,
    ) -> Result<SubscriptionId, ProviderError> {
        let _ = (topic, params);
        Err(ProviderError::UnsupportedOperation {
            operation: "subscribe",
        })
    }

    /// Close a transport-level subscription. `Ok(false)` means the node did
    /// not know the id.
    async fn unsubscribe(&self, id: &SubscriptionId) -> Result<bool, ProviderError> {
        let _ = id;
        Err(ProviderError::UnsupportedOperation {
            operation: "unsubscribe",
        })
    }

    /// The provider's listener table.
    fn events(&self) -> &EventEmitter;

    /// Return the transport's identifier (URL or name).
    fn url(&self) -> &str;

    fn on(&self, kind: EventKind, handler: EventHandler) -> ListenerId {
        self.events().on(kind, handler)
    }

    fn remove_listener(&self, id: ListenerId) -> bool {
        self.events().remove_listener(id)
    }
}
