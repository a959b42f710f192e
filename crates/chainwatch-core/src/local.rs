//! In-process provider backed by an in-memory chain.
//!
//! `LocalProvider` answers the `eth_*` methods the observer needs straight
//! from memory and, when built with [`LocalProvider::socket`], behaves like a
//! persistent socket: it accepts `eth_subscribe("newHeads")`, pushes every
//! announced header, and emits `Close`/`Connect` around simulated
//! reconnects. Useful for single-process setups and for tests that need to
//! script reorgs, duplicate deliveries or transport failures.

use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use serde_json::Value;

use crate::error::ProviderError;
use crate::format;
use crate::provider::{EventEmitter, Provider, ProviderEvent, SubscriptionId};
use crate::request::{JsonRpcError, JsonRpcRequest, JsonRpcResponse};
use crate::types::{BlockHeader, ReceiptStatus, TransactionReceipt};

const ZERO_HASH: &str = "0x0000000000000000000000000000000000000000000000000000000000000000";

struct NodeState {
    canonical: BTreeMap<u64, BlockHeader>,
    by_hash: HashMap<String, BlockHeader>,
    receipts: HashMap<String, TransactionReceipt>,
    subscriptions: HashMap<SubscriptionId, String>,
    failures: HashMap<String, VecDeque<ProviderError>>,
    calls: HashMap<String, usize>,
    connected: bool,
    minted: u64,
}

impl NodeState {
    fn genesis() -> Self {
        let genesis = BlockHeader::new(0, mint_hash(0), ZERO_HASH);
        let mut state = Self {
            canonical: BTreeMap::new(),
            by_hash: HashMap::new(),
            receipts: HashMap::new(),
            subscriptions: HashMap::new(),
            failures: HashMap::new(),
            calls: HashMap::new(),
            connected: true,
            minted: 1,
        };
        state.make_canonical(genesis);
        state
    }

    fn head(&self) -> BlockHeader {
        self.canonical
            .values()
            .next_back()
            .cloned()
            .unwrap_or_else(|| BlockHeader::new(0, ZERO_HASH, ZERO_HASH))
    }

    /// Install `header` at its height, dropping everything above it.
    fn make_canonical(&mut self, header: BlockHeader) {
        let _ = self.canonical.split_off(&header.number);
        self.by_hash
            .insert(header.hash.to_ascii_lowercase(), header.clone());
        self.canonical.insert(header.number, header);
    }

    fn is_canonical(&self, hash: &str, number: u64) -> bool {
        self.canonical
            .get(&number)
            .is_some_and(|b| format::same_hash(&b.hash, hash))
    }

    fn new_heads_subscribers(&self) -> Vec<SubscriptionId> {
        self.subscriptions
            .iter()
            .filter(|(_, topic)| topic.as_str() == "newHeads")
            .map(|(id, _)| id.clone())
            .collect()
    }
}

fn mint_hash(n: u64) -> String {
    format!("0x{n:064x}")
}

/// In-memory node; see the module docs.
pub struct LocalProvider {
    name: String,
    subscriptions_enabled: bool,
    next_subscription: AtomicU64,
    state: Mutex<NodeState>,
    events: EventEmitter,
}

impl LocalProvider {
    /// A push-capable node, like a WebSocket or IPC connection.
    pub fn socket() -> Self {
        Self::build("local://socket", true)
    }

    /// A request/response-only node, like plain HTTP.
    pub fn request_only() -> Self {
        Self::build("local://http", false)
    }

    fn build(name: &str, subscriptions_enabled: bool) -> Self {
        Self {
            name: name.to_string(),
            subscriptions_enabled,
            next_subscription: AtomicU64::new(1),
            state: Mutex::new(NodeState::genesis()),
            events: EventEmitter::new(),
        }
    }

    fn state(&self) -> MutexGuard<'_, NodeState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Current canonical head.
    pub fn head(&self) -> BlockHeader {
        self.state().head()
    }

    /// Canonical block at `number`.
    pub fn block(&self, number: u64) -> Option<BlockHeader> {
        self.state().canonical.get(&number).cloned()
    }

    /// Extend the canonical head by one block and announce it.
    pub fn mine(&self) -> BlockHeader {
        let head = self.head();
        self.mine_on(&head)
    }

    /// Mine `n` blocks on the head, announcing each.
    pub fn mine_many(&self, n: usize) -> Vec<BlockHeader> {
        (0..n).map(|_| self.mine()).collect()
    }

    /// Mine a child of `parent` and make it canonical. When `parent` is not the
    /// head this is a reorg: everything above `parent` is dropped.
    pub fn mine_on(&self, parent: &BlockHeader) -> BlockHeader {
        let header = {
            let mut state = self.state();
            let hash = mint_hash(state.minted);
            state.minted += 1;
            let header = BlockHeader::new(parent.number + 1, hash, parent.hash.clone());
            state.make_canonical(header.clone());
            header
        };
        self.announce(&header);
        header
    }

    /// Make an explicit header canonical and announce it.
    pub fn import(&self, header: BlockHeader) {
        self.state().make_canonical(header.clone());
        self.announce(&header);
    }

    /// Push `header` to every `newHeads` subscriber without touching the chain.
    /// Lets tests replay stale, duplicate or out-of-order deliveries.
    pub fn announce(&self, header: &BlockHeader) {
        let subscribers = self.state().new_heads_subscribers();
        let payload = header.to_json();
        for id in subscribers {
            self.push(&id, payload.clone());
        }
    }

    /// Emit a raw push for `id`, whether or not the node still knows it.
    pub fn push(&self, id: &SubscriptionId, payload: Value) {
        self.events.emit(&ProviderEvent::Message {
            subscription: id.clone(),
            payload,
        });
    }

    /// Record a successful receipt for `tx_hash` in `block`.
    pub fn include(&self, tx_hash: &str, block: &BlockHeader) -> TransactionReceipt {
        let receipt = TransactionReceipt::mined(tx_hash, block, ReceiptStatus::Success);
        self.insert_receipt(receipt.clone());
        receipt
    }

    /// Store `receipt` as is. A receipt naming a block that was reorged out is
    /// hidden; one naming a block the node has not imported yet is served.
    pub fn insert_receipt(&self, receipt: TransactionReceipt) {
        self.state()
            .receipts
            .insert(receipt.transaction_hash.to_ascii_lowercase(), receipt);
    }

    /// Drop the connection: subscriptions are forgotten and `Close` is emitted.
    pub fn disconnect(&self) {
        {
            let mut state = self.state();
            state.connected = false;
            state.subscriptions.clear();
        }
        self.events.emit(&ProviderEvent::Close);
    }

    /// Re-establish the connection and emit `Connect`.
    pub fn reconnect(&self) {
        self.state().connected = true;
        self.events.emit(&ProviderEvent::Connect);
    }

    /// Make the next call to `method` fail with `error`.
    pub fn fail_next(&self, method: &str, error: ProviderError) {
        self.state()
            .failures
            .entry(method.to_string())
            .or_default()
            .push_back(error);
    }

    /// Number of times `method` has been called.
    pub fn calls(&self, method: &str) -> usize {
        self.state().calls.get(method).copied().unwrap_or(0)
    }

    pub fn subscription_ids(&self) -> Vec<SubscriptionId> {
        self.state().subscriptions.keys().cloned().collect()
    }

    /// The hash `eth_sendRawTransaction` returns for `raw`.
    pub fn tx_hash_for(raw: &str) -> String {
        let mut hasher = DefaultHasher::new();
        raw.hash(&mut hasher);
        format!("0x{:064x}", hasher.finish())
    }

    fn handle(&self, method: &str, params: &[Value]) -> Result<Value, ProviderError> {
        let mut state = self.state();
        *state.calls.entry(method.to_string()).or_default() += 1;

        if !state.connected {
            return Err(ProviderError::Closed);
        }
        if let Some(err) = state.failures.get_mut(method).and_then(VecDeque::pop_front) {
            return Err(err);
        }

        let arg = |i: usize| params.get(i).and_then(Value::as_str).unwrap_or_default();

        match method {
            "eth_blockNumber" => Ok(Value::String(format::to_hex(state.head().number))),
            "eth_getBlockByNumber" => {
                let block = match arg(0) {
                    "latest" | "pending" | "safe" | "finalized" => Some(state.head()),
                    "earliest" => state.canonical.get(&0).cloned(),
                    tag => format::parse_hex_u64(tag).and_then(|n| state.canonical.get(&n).cloned()),
                };
                Ok(block.map(|b| b.to_json()).unwrap_or(Value::Null))
            }
            "eth_getBlockByHash" => Ok(state
                .by_hash
                .get(&arg(0).to_ascii_lowercase())
                .map(|b| b.to_json())
                .unwrap_or(Value::Null)),
            "eth_getTransactionReceipt" => {
                let receipt = state
                    .receipts
                    .get(&arg(0).to_ascii_lowercase())
                    .filter(|r| match (&r.block_hash, r.block_number) {
                        // Blocks the node has never imported are served
                        // anyway, like an index that runs ahead of the chain.
                        (Some(hash), Some(number)) => {
                            state.is_canonical(hash, number)
                                || !state.by_hash.contains_key(&hash.to_ascii_lowercase())
                        }
                        _ => true,
                    })
                    .cloned();
                Ok(receipt
                    .map(|r| serde_json::to_value(r).unwrap_or(Value::Null))
                    .unwrap_or(Value::Null))
            }
            "eth_sendRawTransaction" => Ok(Value::String(Self::tx_hash_for(arg(0)))),
            "eth_subscribe" if self.subscriptions_enabled => {
                let n = self.next_subscription.fetch_add(1, Ordering::Relaxed);
                let id = SubscriptionId(format!("0x{n:x}"));
                state.subscriptions.insert(id.clone(), arg(0).to_string());
                Ok(Value::String(id.0))
            }
            "eth_unsubscribe" if self.subscriptions_enabled => {
                let removed = state
                    .subscriptions
                    .remove(&SubscriptionId(arg(0).to_string()))
                    .is_some();
                Ok(Value::Bool(removed))
            }
            other => Err(ProviderError::Rpc(JsonRpcError::method_not_found(other))),
        }
    }
}

#[async_trait]
impl Provider for LocalProvider {
    async fn send(&self, req: JsonRpcRequest) -> Result<JsonRpcResponse, ProviderError> {
        match self.handle(&req.method, &req.params) {
            Ok(result) => Ok(JsonRpcResponse::success(req.id, result)),
            Err(ProviderError::Rpc(e)) => Ok(JsonRpcResponse::failure(req.id, e)),
            Err(e) => Err(e),
        }
    }

    fn supports_subscriptions(&self) -> bool {
        self.subscriptions_enabled
    }

    async fn subscribe(
        &self,
        topic: &str,
        params: Vec<Value>,
    ) -> Result<SubscriptionId, ProviderError> {
        if !self.subscriptions_enabled {
            return Err(ProviderError::UnsupportedOperation {
                operation: "subscribe",
            });
        }
        let params: Vec<Value> = std::iter::once(Value::String(topic.to_string()))
            .chain(params)
            .collect();
        let id = self.handle("eth_subscribe", &params)?;
        Ok(SubscriptionId(serde_json::from_value(id)?))
    }

    async fn unsubscribe(&self, id: &SubscriptionId) -> Result<bool, ProviderError> {
        if !self.subscriptions_enabled {
            return Err(ProviderError::UnsupportedOperation {
                operation: "unsubscribe",
            });
        }
        let removed = self.handle("eth_unsubscribe", &[Value::String(id.0.clone())])?;
        Ok(removed.as_bool().unwrap_or(false))
    }

    fn events(&self) -> &EventEmitter {
        &self.events
    }

    fn url(&self) -> &str {
        &self.name
    }
}
