//! WebSocket JSON-RPC provider with auto-reconnect.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use chainwatch_core::error::ProviderError;
use chainwatch_core::provider::{EventEmitter, Provider, ProviderEvent, SubscriptionId};
use chainwatch_core::request::{JsonRpcRequest, JsonRpcResponse, RpcId, SubscriptionNotification};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type ResponseTx = oneshot::Sender<Result<JsonRpcResponse, ProviderError>>;

/// Configuration for [`WsProvider`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WsProviderConfig {
    /// Reconnect backoff starting duration (milliseconds).
    pub reconnect_initial_ms: u64,
    /// Maximum reconnect backoff (milliseconds).
    pub reconnect_max_ms: u64,
    /// How long a request waits for its response (milliseconds).
    pub request_timeout_ms: u64,
}

impl Default for WsProviderConfig {
    fn default() -> Self {
        Self {
            reconnect_initial_ms: 500,
            reconnect_max_ms: 60_000,
            request_timeout_ms: 30_000,
        }
    }
}

impl WsProviderConfig {
    fn reconnect_initial(&self) -> Duration {
        Duration::from_millis(self.reconnect_initial_ms)
    }

    fn reconnect_max(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_ms)
    }
}

/// Command sent from callers to the background WS task.
enum WsCommand {
    Send { req: JsonRpcRequest, tx: ResponseTx },
    Close,
}

/// A request awaiting its response, keyed by wire id.
struct Pending {
    caller_id: RpcId,
    tx: ResponseTx,
}

/// WebSocket JSON-RPC provider.
///
/// A background task owns the connection. It reconnects with exponential
/// backoff and emits `Connect` after every successful (re)connection; it does
/// not replay subscriptions itself.
pub struct WsProvider {
    url: String,
    cmd_tx: mpsc::UnboundedSender<WsCommand>,
    events: Arc<EventEmitter>,
    next_id: AtomicU64,
    request_timeout: Duration,
}

impl WsProvider {
    /// Connect to `url` and start the background task.
    ///
    /// Fails if the first connection attempt fails; later disconnects are
    /// retried in the background.
    pub async fn connect(url: impl Into<String>, config: WsProviderConfig) -> Result<Self, ProviderError> {
        let url = url.into();
        tracing::info!(url = %url, "connecting via WebSocket");
        let (ws, _) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .map_err(|e| ProviderError::WebSocket(e.to_string()))?;

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel::<WsCommand>();
        let events = Arc::new(EventEmitter::new());
        let request_timeout = Duration::from_millis(config.request_timeout_ms);

        tokio::spawn(ws_task(url.clone(), ws, cmd_rx, events.clone(), config));

        Ok(Self {
            url,
            cmd_tx,
            events,
            next_id: AtomicU64::new(1),
            request_timeout,
        })
    }

    /// Create with default configuration.
    pub async fn default_for(url: impl Into<String>) -> Result<Self, ProviderError> {
        Self::connect(url, WsProviderConfig::default()).await
    }

    async fn call(&self, method: &str, params: Vec<Value>) -> Result<Value, ProviderError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let resp = self.send(JsonRpcRequest::new(id, method, params)).await?;
        resp.into_result().map_err(ProviderError::Rpc)
    }
}

impl Drop for WsProvider {
    fn drop(&mut self) {
        let _ = self.cmd_tx.send(WsCommand::Close);
    }
}

impl std::fmt::Debug for WsProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsProvider").field("url", &self.url).finish()
    }
}

#[async_trait]
impl Provider for WsProvider {
    async fn send(&self, req: JsonRpcRequest) -> Result<JsonRpcResponse, ProviderError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(WsCommand::Send { req, tx })
            .map_err(|_| ProviderError::Closed)?;
        match time::timeout(self.request_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ProviderError::Closed),
            Err(_) => Err(ProviderError::Timeout {
                ms: self.request_timeout.as_millis() as u64,
            }),
        }
    }

    fn supports_subscriptions(&self) -> bool {
        true
    }

    async fn subscribe(&self, topic: &str, params: Vec<Value>) -> Result<SubscriptionId, ProviderError> {
        let params = std::iter::once(Value::String(topic.to_string()))
            .chain(params)
            .collect();
        let id: String = serde_json::from_value(self.call("eth_subscribe", params).await?)?;
        Ok(SubscriptionId(id))
    }

    async fn unsubscribe(&self, id: &SubscriptionId) -> Result<bool, ProviderError> {
        let removed = self
            .call("eth_unsubscribe", vec![Value::String(id.0.clone())])
            .await?;
        Ok(removed.as_bool().unwrap_or(false))
    }

    fn events(&self) -> &EventEmitter {
        &self.events
    }

    fn url(&self) -> &str {
        &self.url
    }
}

/// Background task that owns the WebSocket connection.
async fn ws_task(
    url: String,
    first: WsStream,
    mut cmd_rx: mpsc::UnboundedReceiver<WsCommand>,
    events: Arc<EventEmitter>,
    config: WsProviderConfig,
) {
    let mut backoff = config.reconnect_initial();
    let mut next_wire_id: u64 = 1;
    let mut conn = Some(first);

    loop {
        let ws = match conn.take() {
            Some(ws) => ws,
            None => {
                tracing::info!(url = %url, "reconnecting via WebSocket");
                match tokio_tungstenite::connect_async(url.as_str()).await {
                    Ok((ws, _)) => {
                        backoff = config.reconnect_initial(); // reset on success
                        ws
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "WS connect failed, retrying in {backoff:?}");
                        events.emit(&ProviderEvent::Error(ProviderError::WebSocket(e.to_string())));
                        if !wait_rejecting(backoff, &mut cmd_rx).await {
                            return;
                        }
                        backoff = (backoff * 2).min(config.reconnect_max());
                        continue;
                    }
                }
            }
        };

        tracing::info!(url = %url, "WS connected");
        events.emit(&ProviderEvent::Connect);

        let (mut sink, mut stream) = ws.split();
        let mut pending: HashMap<u64, Pending> = HashMap::new();

        // Main dispatch loop
        let closed_by_caller = loop {
            tokio::select! {
                // Incoming commands from callers
                cmd = cmd_rx.recv() => {
                    match cmd {
                        None | Some(WsCommand::Close) => {
                            let _ = sink.send(Message::Close(None)).await;
                            break true;
                        }
                        Some(WsCommand::Send { mut req, tx }) => {
                            let wire_id = next_wire_id;
                            next_wire_id += 1;
                            let caller_id = std::mem::replace(&mut req.id, RpcId::Number(wire_id));
                            let msg = match serde_json::to_string(&req) {
                                Ok(msg) => msg,
                                Err(e) => {
                                    let _ = tx.send(Err(e.into()));
                                    continue;
                                }
                            };
                            pending.retain(|_, p| !p.tx.is_closed());
                            pending.insert(wire_id, Pending { caller_id, tx });
                            if let Err(e) = sink.send(Message::Text(msg.into())).await {
                                tracing::warn!(error = %e, "WS send failed");
                                break false;
                            }
                        }
                    }
                }
                // Incoming messages from node
                msg = stream.next() => {
                    match msg {
                        None => break false,
                        Some(Err(e)) => {
                            tracing::warn!(error = %e, "WS receive error");
                            events.emit(&ProviderEvent::Error(ProviderError::WebSocket(e.to_string())));
                            break false;
                        }
                        Some(Ok(Message::Text(text))) => {
                            handle_message(text.as_str(), &mut pending, &events);
                        }
                        Some(Ok(Message::Ping(payload))) => {
                            if sink.send(Message::Pong(payload)).await.is_err() {
                                break false;
                            }
                        }
                        Some(Ok(Message::Close(_))) => break false,
                        _ => {}
                    }
                }
            }
        };

        for (_, p) in pending.drain() {
            let _ = p.tx.send(Err(ProviderError::Closed));
        }
        events.emit(&ProviderEvent::Close);
        if closed_by_caller {
            tracing::debug!(url = %url, "WS closed");
            return;
        }

        tracing::warn!(url = %url, "WS disconnected, reconnecting in {backoff:?}");
        if !wait_rejecting(backoff, &mut cmd_rx).await {
            return;
        }
        backoff = (backoff * 2).min(config.reconnect_max());
    }
}

/// Sleep for `delay` while failing any request issued in the meantime.
/// Returns `false` if the provider was closed.
async fn wait_rejecting(delay: Duration, cmd_rx: &mut mpsc::UnboundedReceiver<WsCommand>) -> bool {
    let sleep = time::sleep(delay);
    tokio::pin!(sleep);
    loop {
        tokio::select! {
            _ = &mut sleep => return true,
            cmd = cmd_rx.recv() => match cmd {
                None | Some(WsCommand::Close) => return false,
                Some(WsCommand::Send { tx, .. }) => {
                    let _ = tx.send(Err(ProviderError::Closed));
                }
            }
        }
    }
}

fn handle_message(text: &str, pending: &mut HashMap<u64, Pending>, events: &EventEmitter) {
    let Ok(val) = serde_json::from_str::<Value>(text) else {
        tracing::debug!("failed to parse WS message as JSON");
        return;
    };

    // Subscription notification
    if val.get("method").and_then(|m| m.as_str()) == Some("eth_subscription") {
        match val.get("params").cloned().map(serde_json::from_value::<SubscriptionNotification>) {
            Some(Ok(n)) => events.emit(&ProviderEvent::Message {
                subscription: SubscriptionId(n.subscription),
                payload: n.result,
            }),
            _ => tracing::debug!("malformed eth_subscription message"),
        }
        return;
    }

    // Regular JSON-RPC response
    let mut resp = match serde_json::from_value::<JsonRpcResponse>(val) {
        Ok(resp) => resp,
        Err(e) => {
            tracing::debug!(error = %e, "unrecognised WS message");
            return;
        }
    };
    let Some(wire_id) = resp.id.as_number() else {
        return;
    };
    match pending.remove(&wire_id) {
        Some(p) => {
            resp.id = p.caller_id;
            let _ = p.tx.send(Ok(resp));
        }
        None => tracing::trace!(wire_id, "response for unknown or abandoned request"),
    }
}
