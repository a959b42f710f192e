//! `WsProvider` against a scripted in-process WebSocket node.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use chainwatch_core::error::ProviderError;
use chainwatch_core::provider::{EventKind, Provider, ProviderEvent, SubscriptionId};
use chainwatch_core::registry::{SubscriptionMessage, SubscriptionRegistry};
use chainwatch_core::request::{JsonRpcRequest, RpcId};
use chainwatch_ws::{WsProvider, WsProviderConfig};

const WAIT: Duration = Duration::from_secs(5);

enum Control {
    Push { subscription: String, result: Value },
    Close,
}

type Log = Arc<Mutex<Vec<Value>>>;

/// Start a node that accepts one connection at a time. Each accepted
/// connection yields a control channel; every request received is logged.
async fn spawn_node() -> (String, mpsc::UnboundedReceiver<mpsc::UnboundedSender<Control>>, Log) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    let (conn_tx, conn_rx) = mpsc::unbounded_channel();
    let log: Log = Arc::new(Mutex::new(Vec::new()));
    let server_log = log.clone();

    tokio::spawn(async move {
        // Subscription ids stay unique across connections.
        let mut next_sub = 1u64;
        while let Ok((tcp, _)) = listener.accept().await {
            let Ok(ws) = tokio_tungstenite::accept_async(tcp).await else {
                continue;
            };
            let (control_tx, control_rx) = mpsc::unbounded_channel();
            let _ = conn_tx.send(control_tx);
            serve(ws, control_rx, &server_log, &mut next_sub).await;
        }
    });

    (url, conn_rx, log)
}

async fn serve(
    ws: WebSocketStream<TcpStream>,
    mut control: mpsc::UnboundedReceiver<Control>,
    log: &Log,
    next_sub: &mut u64,
) {
    let (mut sink, mut stream) = ws.split();
    loop {
        tokio::select! {
            msg = stream.next() => {
                let Some(Ok(Message::Text(text))) = msg else { return };
                let req: Value = serde_json::from_str(&text).unwrap();
                log.lock().unwrap().push(req.clone());
                let result = match req["method"].as_str().unwrap_or_default() {
                    "eth_subscribe" => {
                        let id = format!("0x{:x}", *next_sub);
                        *next_sub += 1;
                        json!(id)
                    }
                    "eth_unsubscribe" => json!(true),
                    "eth_hang" => continue,
                    other => json!(other),
                };
                let reply = json!({"jsonrpc": "2.0", "id": req["id"], "result": result});
                if sink.send(Message::Text(reply.to_string().into())).await.is_err() {
                    return;
                }
            }
            cmd = control.recv() => match cmd {
                Some(Control::Push { subscription, result }) => {
                    let note = json!({
                        "jsonrpc": "2.0",
                        "method": "eth_subscription",
                        "params": {"subscription": subscription, "result": result}
                    });
                    if sink.send(Message::Text(note.to_string().into())).await.is_err() {
                        return;
                    }
                }
                Some(Control::Close) | None => {
                    let _ = sink.send(Message::Close(None)).await;
                    return;
                }
            }
        }
    }
}

fn fast_config() -> WsProviderConfig {
    WsProviderConfig {
        reconnect_initial_ms: 20,
        reconnect_max_ms: 200,
        request_timeout_ms: 5_000,
    }
}

fn forward(provider: &WsProvider, kind: EventKind) -> mpsc::UnboundedReceiver<ProviderEvent> {
    let (tx, rx) = mpsc::unbounded_channel();
    provider.on(
        kind,
        Arc::new(move |ev: &ProviderEvent| {
            let _ = tx.send(ev.clone());
        }),
    );
    rx
}

#[tokio::test]
async fn responses_are_correlated_and_caller_ids_restored() {
    let (url, mut conns, log) = spawn_node().await;
    let provider = WsProvider::connect(url, fast_config()).await.unwrap();
    let _conn = timeout(WAIT, conns.recv()).await.unwrap().unwrap();

    // Two callers that picked the same id.
    let (a, b) = tokio::join!(
        provider.send(JsonRpcRequest::new(5, "alpha", vec![])),
        provider.send(JsonRpcRequest::new(5, "beta", vec![])),
    );
    let (a, b) = (a.unwrap(), b.unwrap());
    assert_eq!(a.id, RpcId::Number(5));
    assert_eq!(b.id, RpcId::Number(5));
    assert_eq!(a.into_result().unwrap(), json!("alpha"));
    assert_eq!(b.into_result().unwrap(), json!("beta"));

    let wire: Vec<Value> = log.lock().unwrap().iter().map(|r| r["id"].clone()).collect();
    assert_eq!(wire.len(), 2);
    assert_ne!(wire[0], wire[1]);
}

#[tokio::test]
async fn pushes_are_emitted_as_messages() {
    let (url, mut conns, _log) = spawn_node().await;
    let provider = WsProvider::connect(url, fast_config()).await.unwrap();
    let conn = timeout(WAIT, conns.recv()).await.unwrap().unwrap();
    let mut messages = forward(&provider, EventKind::Message);

    assert!(provider.supports_subscriptions());
    let id = provider.subscribe("newHeads", vec![]).await.unwrap();
    assert_eq!(id, SubscriptionId("0x1".into()));

    conn.send(Control::Push {
        subscription: "0x1".into(),
        result: json!({"number": "0x10", "hash": "0xb", "parentHash": "0xa"}),
    })
    .unwrap_or_else(|_| panic!("node connection gone"));

    match timeout(WAIT, messages.recv()).await.unwrap().unwrap() {
        ProviderEvent::Message { subscription, payload } => {
            assert_eq!(subscription, id);
            assert_eq!(payload["number"], "0x10");
        }
        other => panic!("unexpected event: {other:?}"),
    }

    assert!(provider.unsubscribe(&id).await.unwrap());
}

#[tokio::test]
async fn in_flight_requests_fail_when_the_connection_drops() {
    let (url, mut conns, _log) = spawn_node().await;
    let provider = Arc::new(WsProvider::connect(url, fast_config()).await.unwrap());
    let conn = timeout(WAIT, conns.recv()).await.unwrap().unwrap();
    let mut closes = forward(&provider, EventKind::Close);

    let hanging = {
        let provider = provider.clone();
        tokio::spawn(async move { provider.send(JsonRpcRequest::new(1, "eth_hang", vec![])).await })
    };
    // Give the request time to reach the node before dropping the connection.
    tokio::time::sleep(Duration::from_millis(50)).await;
    conn.send(Control::Close)
        .unwrap_or_else(|_| panic!("node connection gone"));

    let result = timeout(WAIT, hanging).await.unwrap().unwrap();
    assert!(matches!(result, Err(ProviderError::Closed)));
    assert!(matches!(
        timeout(WAIT, closes.recv()).await.unwrap(),
        Some(ProviderEvent::Close)
    ));
}

#[tokio::test]
async fn reconnect_lets_the_registry_restore_subscriptions() {
    let (url, mut conns, log) = spawn_node().await;
    let provider = Arc::new(WsProvider::connect(url, fast_config()).await.unwrap());
    let registry = SubscriptionRegistry::attach(provider.clone());
    let first = timeout(WAIT, conns.recv()).await.unwrap().unwrap();
    let mut connects = forward(&provider, EventKind::Connect);

    let (tx, mut rx) = mpsc::unbounded_channel();
    let handle = registry.subscribe("newHeads", vec![], tx).await.unwrap();
    assert_eq!(registry.transport_id(handle), Some(SubscriptionId("0x1".into())));

    first
        .send(Control::Close)
        .unwrap_or_else(|_| panic!("node connection gone"));
    let second = timeout(WAIT, conns.recv()).await.unwrap().unwrap();
    assert!(matches!(
        timeout(WAIT, connects.recv()).await.unwrap(),
        Some(ProviderEvent::Connect)
    ));

    let restored = SubscriptionId("0x2".into());
    timeout(WAIT, async {
        while registry.transport_id(handle).as_ref() != Some(&restored) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(registry.handles(), vec![handle]);

    second
        .send(Control::Push {
            subscription: "0x2".into(),
            result: json!({"number": "0x2"}),
        })
        .unwrap_or_else(|_| panic!("node connection gone"));

    match timeout(WAIT, rx.recv()).await.unwrap().unwrap() {
        SubscriptionMessage::Payload(v) => assert_eq!(v["number"], "0x2"),
        SubscriptionMessage::Error(e) => panic!("unexpected error: {e}"),
    }

    let subscribes = log
        .lock()
        .unwrap()
        .iter()
        .filter(|r| r["method"] == "eth_subscribe")
        .count();
    assert_eq!(subscribes, 2);
}
