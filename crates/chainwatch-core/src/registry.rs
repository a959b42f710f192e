//! Subscription multiplexing over a shared provider.
//!
//! Callers hold a logical [`SubscriptionHandle`]; the registry maps it to the
//! transport-assigned [`SubscriptionId`] of the current connection. Inbound
//! pushes are routed by transport id, and when the provider reconnects every
//! live entry is re-subscribed and re-indexed under its new transport id
//! while the handle and its listeners stay the same.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::{ProviderError, SubscriptionError};
use crate::provider::{EventKind, ListenerId, Provider, ProviderEvent, SubscriptionId};

/// Caller-visible subscription handle. Stable across reconnects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionHandle(u64);

impl std::fmt::Display for SubscriptionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// What a subscription listener receives.
#[derive(Debug, Clone)]
pub enum SubscriptionMessage {
    Payload(Value),
    /// The subscription is gone; no further messages follow.
    Error(SubscriptionError),
}

pub type SubscriptionListener = mpsc::UnboundedSender<SubscriptionMessage>;

struct SubscriptionEntry {
    transport_id: SubscriptionId,
    topic: String,
    params: Vec<Value>,
    listeners: Vec<SubscriptionListener>,
    /// Connection epoch the subscribe request was issued under.
    epoch: u64,
}

#[derive(Default)]
struct RegistryState {
    entries: HashMap<SubscriptionHandle, SubscriptionEntry>,
    by_transport: HashMap<SubscriptionId, SubscriptionHandle>,
}

struct RegistryInner {
    provider: Arc<dyn Provider>,
    state: Mutex<RegistryState>,
    next_handle: AtomicU64,
    /// Bumped on every `Connect`.
    epoch: AtomicU64,
    provider_listeners: Vec<ListenerId>,
    reconnecting: tokio::sync::Mutex<()>,
}

impl Drop for RegistryInner {
    fn drop(&mut self) {
        for id in &self.provider_listeners {
            self.provider.remove_listener(*id);
        }
    }
}

/// Shared registry of live subscriptions on one provider.
#[derive(Clone)]
pub struct SubscriptionRegistry {
    inner: Arc<RegistryInner>,
}

impl SubscriptionRegistry {
    /// Create a registry for `provider` and start listening for its push
    /// messages and `Connect` events.
    pub fn attach(provider: Arc<dyn Provider>) -> Self {
        let inner = Arc::new_cyclic(|weak: &Weak<RegistryInner>| {
            let on_message = weak.clone();
            let message_listener = provider.on(
                EventKind::Message,
                Arc::new(move |event: &ProviderEvent| {
                    if let ProviderEvent::Message { subscription, payload } = event {
                        if let Some(inner) = on_message.upgrade() {
                            SubscriptionRegistry { inner }.dispatch(subscription, payload.clone());
                        }
                    }
                }),
            );

            let on_connect = weak.clone();
            let connect_listener = provider.on(
                EventKind::Connect,
                Arc::new(move |_: &ProviderEvent| {
                    let Some(inner) = on_connect.upgrade() else {
                        return;
                    };
                    let epoch = inner.epoch.fetch_add(1, Ordering::SeqCst) + 1;
                    let registry = SubscriptionRegistry { inner };
                    match tokio::runtime::Handle::try_current() {
                        Ok(rt) => {
                            rt.spawn(async move { registry.restore(epoch).await });
                        }
                        Err(_) => {
                            tracing::warn!("provider reconnected outside a Tokio runtime; subscriptions not restored");
                        }
                    }
                }),
            );

            RegistryInner {
                provider,
                state: Mutex::new(RegistryState::default()),
                next_handle: AtomicU64::new(1),
                epoch: AtomicU64::new(0),
                provider_listeners: vec![message_listener, connect_listener],
                reconnecting: tokio::sync::Mutex::new(()),
            }
        });
        Self { inner }
    }

    fn state(&self) -> MutexGuard<'_, RegistryState> {
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn provider(&self) -> &Arc<dyn Provider> {
        &self.inner.provider
    }

    /// Open a transport subscription and register `listener` for it.
    ///
    /// Nothing is stored when the transport rejects the subscription.
    pub async fn subscribe(
        &self,
        topic: &str,
        params: Vec<Value>,
        listener: SubscriptionListener,
    ) -> Result<SubscriptionHandle, SubscriptionError> {
        let epoch = self.inner.epoch.load(Ordering::SeqCst);
        let transport_id = self.inner.provider.subscribe(topic, params.clone()).await?;
        let handle = SubscriptionHandle(self.inner.next_handle.fetch_add(1, Ordering::Relaxed));

        let mut state = self.state();
        state.by_transport.insert(transport_id.clone(), handle);
        state.entries.insert(
            handle,
            SubscriptionEntry {
                transport_id: transport_id.clone(),
                topic: topic.to_string(),
                params,
                listeners: vec![listener],
                epoch,
            },
        );
        drop(state);

        tracing::debug!(%handle, %transport_id, topic, "subscribed");
        Ok(handle)
    }

    /// Add another listener to a live subscription.
    pub fn add_listener(
        &self,
        handle: SubscriptionHandle,
        listener: SubscriptionListener,
    ) -> Result<(), SubscriptionError> {
        let mut state = self.state();
        let entry = state
            .entries
            .get_mut(&handle)
            .ok_or(SubscriptionError::UnknownSubscription(handle))?;
        entry.listeners.push(listener);
        Ok(())
    }

    /// Forward an inbound push to the listeners of its subscription.
    ///
    /// Unknown transport ids, typically late pushes for a subscription that
    /// was just removed, are dropped.
    pub fn dispatch(&self, transport_id: &SubscriptionId, payload: Value) {
        let mut state = self.state();
        let Some(handle) = state.by_transport.get(transport_id).copied() else {
            tracing::trace!(%transport_id, "dropping push for unknown subscription");
            return;
        };
        if let Some(entry) = state.entries.get_mut(&handle) {
            entry
                .listeners
                .retain(|l| l.send(SubscriptionMessage::Payload(payload.clone())).is_ok());
        }
    }

    /// Remove a subscription and close it on the transport.
    ///
    /// Local state is cleared before the round-trip, so no push reaches the
    /// listeners afterwards. `Ok(false)` means the node did not know the id;
    /// the local entry stays removed either way.
    pub async fn unsubscribe(&self, handle: SubscriptionHandle) -> Result<bool, SubscriptionError> {
        let entry = {
            let mut state = self.state();
            let entry = state
                .entries
                .remove(&handle)
                .ok_or(SubscriptionError::UnknownSubscription(handle))?;
            state.by_transport.remove(&entry.transport_id);
            entry
        };

        let SubscriptionEntry { transport_id, listeners, .. } = entry;
        drop(listeners);

        let removed = self.inner.provider.unsubscribe(&transport_id).await?;
        if !removed {
            tracing::warn!(%handle, %transport_id, "node did not recognise subscription on unsubscribe");
        }
        Ok(removed)
    }

    /// Re-issue every live subscription on the current connection.
    ///
    /// Runs automatically when the provider emits `Connect`. Entries whose
    /// resubscription fails get an error message and are dropped.
    pub async fn on_reconnect(&self) {
        let epoch = self.inner.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        self.restore(epoch).await;
    }

    /// Resubscribe entries issued before connection `epoch`. Entries issued
    /// since already belong to the new connection.
    async fn restore(&self, epoch: u64) {
        let _guard = self.inner.reconnecting.lock().await;

        let snapshot: Vec<(SubscriptionHandle, String, Vec<Value>)> = self
            .state()
            .entries
            .iter()
            .filter(|(_, e)| e.epoch < epoch)
            .map(|(h, e)| (*h, e.topic.clone(), e.params.clone()))
            .collect();

        if snapshot.is_empty() {
            return;
        }
        tracing::info!(count = snapshot.len(), "restoring subscriptions after reconnect");

        for (handle, topic, params) in snapshot {
            let issued = self.inner.epoch.load(Ordering::SeqCst);
            match self.inner.provider.subscribe(&topic, params).await {
                Ok(new_id) => self.rebind(handle, new_id, issued).await,
                Err(e) => self.drop_failed(handle, topic, e),
            }
        }
    }

    async fn rebind(&self, handle: SubscriptionHandle, new_id: SubscriptionId, epoch: u64) {
        let orphaned = {
            let mut state = self.state();
            let RegistryState { entries, by_transport } = &mut *state;
            match entries.get_mut(&handle) {
                Some(entry) => {
                    by_transport.remove(&entry.transport_id);
                    by_transport.insert(new_id.clone(), handle);
                    tracing::debug!(%handle, old = %entry.transport_id, new = %new_id, "subscription restored");
                    entry.transport_id = new_id;
                    entry.epoch = epoch;
                    None
                }
                // Unsubscribed while the resubscribe was in flight.
                None => Some(new_id),
            }
        };
        if let Some(id) = orphaned {
            if let Err(e) = self.inner.provider.unsubscribe(&id).await {
                tracing::debug!(error = %e, "failed to release orphaned subscription");
            }
        }
    }

    fn drop_failed(&self, handle: SubscriptionHandle, topic: String, source: ProviderError) {
        let entry = {
            let mut state = self.state();
            let Some(entry) = state.entries.remove(&handle) else {
                return;
            };
            state.by_transport.remove(&entry.transport_id);
            entry
        };
        tracing::warn!(%handle, topic = %topic, error = %source, "resubscribe failed, dropping subscription");
        let err = SubscriptionError::ResubscribeFailed { topic, source };
        for listener in entry.listeners {
            let _ = listener.send(SubscriptionMessage::Error(err.clone()));
        }
    }

    /// Current transport id of `handle`.
    pub fn transport_id(&self, handle: SubscriptionHandle) -> Option<SubscriptionId> {
        self.state().entries.get(&handle).map(|e| e.transport_id.clone())
    }

    /// Handles of all live subscriptions.
    pub fn handles(&self) -> Vec<SubscriptionHandle> {
        let mut handles: Vec<_> = self.state().entries.keys().copied().collect();
        handles.sort();
        handles
    }

    /// Number of live subscriptions.
    pub fn len(&self) -> usize {
        self.state().entries.len()
    }

    /// Returns `true` if there are no live subscriptions.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for SubscriptionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionRegistry")
            .field("provider", &self.inner.provider.url())
            .field("subscriptions", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local::LocalProvider;
    use serde_json::json;

    fn setup() -> (Arc<LocalProvider>, SubscriptionRegistry) {
        let node = Arc::new(LocalProvider::socket());
        let registry = SubscriptionRegistry::attach(node.clone());
        (node, registry)
    }

    fn payload(msg: SubscriptionMessage) -> Value {
        match msg {
            SubscriptionMessage::Payload(v) => v,
            SubscriptionMessage::Error(e) => panic!("unexpected error message: {e}"),
        }
    }

    #[tokio::test]
    async fn subscribe_and_dispatch() {
        let (node, registry) = setup();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = registry.subscribe("newHeads", vec![], tx).await.unwrap();

        let id = registry.transport_id(handle).unwrap();
        registry.dispatch(&id, json!({"number": "0x1"}));
        assert_eq!(payload(rx.try_recv().unwrap())["number"], "0x1");

        let block = node.mine();
        assert_eq!(payload(rx.try_recv().unwrap())["hash"], block.hash.as_str());
    }

    #[tokio::test]
    async fn failed_subscribe_stores_nothing() {
        let (node, registry) = setup();
        node.fail_next("eth_subscribe", ProviderError::Closed);
        let (tx, _rx) = mpsc::unbounded_channel();
        let err = registry.subscribe("newHeads", vec![], tx).await.unwrap_err();
        assert!(matches!(err, SubscriptionError::Provider(ProviderError::Closed)));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn unknown_transport_ids_are_dropped() {
        let (_node, registry) = setup();
        registry.dispatch(&SubscriptionId("0xdead".into()), json!({}));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn late_push_after_unsubscribe_is_not_delivered() {
        let (node, registry) = setup();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = registry.subscribe("newHeads", vec![], tx).await.unwrap();
        let id = registry.transport_id(handle).unwrap();

        assert!(registry.unsubscribe(handle).await.unwrap());
        node.push(&id, json!({"number": "0x9"}));

        // Listener set was released with the entry.
        assert!(matches!(
            rx.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
    }

    #[tokio::test]
    async fn double_unsubscribe_is_an_unknown_subscription() {
        let (_node, registry) = setup();
        let (tx, _rx) = mpsc::unbounded_channel();
        let handle = registry.subscribe("newHeads", vec![], tx).await.unwrap();
        registry.unsubscribe(handle).await.unwrap();
        let err = registry.unsubscribe(handle).await.unwrap_err();
        assert!(matches!(err, SubscriptionError::UnknownSubscription(h) if h == handle));
    }

    #[tokio::test]
    async fn failed_transport_unsubscribe_still_clears_local_state() {
        let (node, registry) = setup();
        let (tx, _rx) = mpsc::unbounded_channel();
        let handle = registry.subscribe("newHeads", vec![], tx).await.unwrap();
        node.fail_next("eth_unsubscribe", ProviderError::Timeout { ms: 10 });

        assert!(registry.unsubscribe(handle).await.is_err());
        assert!(registry.is_empty());
        assert!(matches!(
            registry.unsubscribe(handle).await,
            Err(SubscriptionError::UnknownSubscription(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_keeps_handles_and_listeners() {
        let (node, registry) = setup();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (tx2, mut rx2) = mpsc::unbounded_channel();
        let handle = registry.subscribe("newHeads", vec![], tx).await.unwrap();
        registry.add_listener(handle, tx2).unwrap();
        let old_id = registry.transport_id(handle).unwrap();

        node.disconnect();
        node.reconnect();
        // The Connect listener spawns the restore.
        tokio::time::sleep(std::time::Duration::from_millis(1)).await;

        assert_eq!(registry.handles(), vec![handle]);
        let new_id = registry.transport_id(handle).unwrap();
        assert_ne!(new_id, old_id);
        assert_eq!(node.subscription_ids().len(), 1);
        assert_eq!(node.subscription_ids()[0], new_id);

        // The stale id no longer routes anywhere.
        registry.dispatch(&old_id, json!({"stale": true}));
        assert!(rx.try_recv().is_err());

        registry.dispatch(&new_id, json!({"fresh": true}));
        assert_eq!(payload(rx.try_recv().unwrap())["fresh"], true);
        assert_eq!(payload(rx2.try_recv().unwrap())["fresh"], true);
    }

    #[tokio::test(start_paused = true)]
    async fn subscriptions_opened_after_connect_are_not_restored_again() {
        let (node, registry) = setup();
        let (tx, _rx) = mpsc::unbounded_channel();
        let old = registry.subscribe("newHeads", vec![], tx).await.unwrap();

        node.disconnect();
        node.reconnect();
        // Opened on the new connection before the spawned restore runs.
        let (tx, _rx2) = mpsc::unbounded_channel();
        let fresh = registry.subscribe("newHeads", vec![], tx).await.unwrap();
        let fresh_id = registry.transport_id(fresh).unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(1)).await;

        assert_eq!(registry.transport_id(fresh), Some(fresh_id.clone()));
        let live = node.subscription_ids();
        assert_eq!(live.len(), 2);
        assert!(live.contains(&fresh_id));
        assert!(live.contains(&registry.transport_id(old).unwrap()));
        assert_eq!(node.calls("eth_subscribe"), 3);
    }

    #[tokio::test]
    async fn failed_resubscribe_notifies_and_drops() {
        let (node, registry) = setup();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = registry.subscribe("newHeads", vec![], tx).await.unwrap();

        node.fail_next("eth_subscribe", ProviderError::WebSocket("refused".into()));
        registry.on_reconnect().await;

        assert!(registry.is_empty());
        match rx.try_recv().unwrap() {
            SubscriptionMessage::Error(SubscriptionError::ResubscribeFailed { topic, .. }) => {
                assert_eq!(topic, "newHeads")
            }
            other => panic!("unexpected message: {other:?}"),
        }
        assert!(matches!(
            registry.unsubscribe(handle).await,
            Err(SubscriptionError::UnknownSubscription(_))
        ));
    }

    #[tokio::test]
    async fn dropping_the_registry_detaches_from_the_provider() {
        let node = Arc::new(LocalProvider::socket());
        let registry = SubscriptionRegistry::attach(node.clone());
        assert_eq!(node.events().listener_count(EventKind::Message), 1);
        drop(registry);
        assert_eq!(node.events().listener_count(EventKind::Message), 0);
        assert_eq!(node.events().listener_count(EventKind::Connect), 0);
    }
}
