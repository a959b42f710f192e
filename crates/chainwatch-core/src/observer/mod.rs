//! Transaction confirmation observer.
//!
//! [`TransactionObserver::observe`] starts one session per transaction hash
//! and returns an [`Observation`]: a stream of [`ConfirmationEvent`]s plus the
//! terminal outcome. The session is driven by one of two tick sources, picked
//! once when the session starts:
//!
//! - **push**: the provider supports subscriptions, so every `newHeads`
//!   delivery from the [`SubscriptionRegistry`] triggers a check;
//! - **poll**: a fixed-interval timer fetches the head and walks forward.
//!
//! Both feed the same step function, and a block only counts as a
//! confirmation when its parent hash links it to the last accepted block.

mod chain;
mod driver;
mod poll;
mod push;
pub mod session;
mod stream;

pub use stream::{TransactionEvent, TransactionStream};

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::Stream;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use crate::dispatcher::RequestDispatcher;
use crate::error::ObserveError;
use crate::provider::Provider;
use crate::registry::SubscriptionRegistry;
use crate::types::{ConfirmationEvent, Confirmed, Progress};

use self::chain::ChainReader;
use self::driver::{Cancellation, EventSink, SessionDriver};
use self::session::ObservationSession;

// ─── Config ───────────────────────────────────────────────────────────────────

/// Observer tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObserverConfig {
    /// Confirmations required on top of the containing block. `0` means a
    /// single receipt check.
    pub block_confirmations: u64,
    /// Overall deadline per session (milliseconds).
    pub timeout_ms: u64,
    /// Poll strategy tick interval (milliseconds).
    pub poll_interval_ms: u64,
    /// Give up after this many new heads without a receipt. `None` disables
    /// the limit.
    pub block_timeout: Option<u64>,
    /// Subscription topic used by the push strategy.
    pub head_topic: String,
}

impl Default for ObserverConfig {
    fn default() -> Self {
        Self {
            block_confirmations: 24,
            timeout_ms: 750_000,
            poll_interval_ms: 1_000,
            block_timeout: Some(50),
            head_topic: "newHeads".into(),
        }
    }
}

impl ObserverConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

// ─── Observer ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
enum Strategy {
    /// `block_confirmations == 0`: one receipt check, no tick source.
    Single,
    Push {
        registry: SubscriptionRegistry,
        topic: String,
    },
    Poll {
        interval: Duration,
    },
}

impl Strategy {
    fn name(&self) -> &'static str {
        match self {
            Self::Single => "single",
            Self::Push { .. } => "push",
            Self::Poll { .. } => "poll",
        }
    }
}

/// Starts observation sessions over a shared dispatcher and, for
/// push-capable providers, a shared subscription registry.
#[derive(Debug, Clone)]
pub struct TransactionObserver {
    dispatcher: Arc<RequestDispatcher>,
    registry: Option<SubscriptionRegistry>,
    config: ObserverConfig,
}

impl TransactionObserver {
    /// Build an observer that owns its dispatcher and, if the provider can
    /// push, its own registry.
    pub fn new(provider: Arc<dyn Provider>, config: ObserverConfig) -> Self {
        let registry = provider
            .supports_subscriptions()
            .then(|| SubscriptionRegistry::attach(provider.clone()));
        Self {
            dispatcher: Arc::new(RequestDispatcher::new(provider)),
            registry,
            config,
        }
    }

    /// Build an observer over existing shared components.
    pub fn from_parts(
        dispatcher: Arc<RequestDispatcher>,
        registry: Option<SubscriptionRegistry>,
        config: ObserverConfig,
    ) -> Self {
        Self {
            dispatcher,
            registry,
            config,
        }
    }

    pub fn config(&self) -> &ObserverConfig {
        &self.config
    }

    pub fn dispatcher(&self) -> &Arc<RequestDispatcher> {
        &self.dispatcher
    }

    pub fn registry(&self) -> Option<&SubscriptionRegistry> {
        self.registry.as_ref()
    }

    fn strategy(&self) -> Strategy {
        if self.config.block_confirmations == 0 {
            return Strategy::Single;
        }
        match &self.registry {
            Some(registry) if self.dispatcher.provider().supports_subscriptions() => Strategy::Push {
                registry: registry.clone(),
                topic: self.config.head_topic.clone(),
            },
            _ => Strategy::Poll {
                interval: self.config.poll_interval(),
            },
        }
    }

    /// Start observing `tx_hash`. Must be called within a Tokio runtime.
    pub fn observe(&self, tx_hash: impl Into<String>) -> Observation {
        let tx_hash = tx_hash.into();
        let strategy = self.strategy();
        let cancel = Arc::new(Cancellation::default());
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (outcome_tx, outcome_rx) = oneshot::channel();

        let driver = SessionDriver::new(
            ObservationSession::new(tx_hash.clone(), self.config.block_confirmations),
            ChainReader::new(self.dispatcher.clone()),
            EventSink::new(events_tx, cancel.clone()),
            self.config.block_timeout,
        );
        let timeout = self.config.timeout();
        let deadline = Instant::now() + timeout;

        tokio::spawn(run_session(driver, strategy, deadline, timeout, cancel.clone(), outcome_tx));

        Observation {
            tx_hash,
            events: events_rx,
            outcome: outcome_rx,
            cancel,
        }
    }
}

enum Interrupt {
    Cancelled,
    Deadline,
}

async fn run_session(
    mut driver: SessionDriver,
    strategy: Strategy,
    deadline: Instant,
    timeout: Duration,
    cancel: Arc<Cancellation>,
    outcome: oneshot::Sender<Result<Confirmed, ObserveError>>,
) {
    tracing::info!(
        tx = %driver.session.tx_hash(),
        strategy = strategy.name(),
        required = driver.session.required(),
        "observing transaction"
    );

    let result = tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Interrupt::Cancelled),
        _ = tokio::time::sleep_until(deadline) => Err(Interrupt::Deadline),
        r = drive(&mut driver, &strategy) => Ok(r),
    };
    let result = match result {
        Ok(r) => r,
        Err(Interrupt::Cancelled) => Err(driver.cancelled()),
        Err(Interrupt::Deadline) => Err(driver.deadline_passed(timeout)),
    };

    match &result {
        Ok(done) => tracing::info!(
            tx = %driver.session.tx_hash(),
            confirmations = done.confirmations,
            checks = done.confirmation_checks,
            "transaction confirmed"
        ),
        Err(e) => tracing::info!(tx = %driver.session.tx_hash(), error = %e, "observation ended"),
    }

    let _ = outcome.send(result);
    driver.teardown().await;
}

async fn drive(driver: &mut SessionDriver, strategy: &Strategy) -> Result<Confirmed, ObserveError> {
    match strategy {
        Strategy::Single => match driver.step(None).await? {
            Some(done) => Ok(done),
            None => Err(ObserveError::NoReceipt {
                tx_hash: driver.session.tx_hash().to_string(),
                progress: driver.session.progress(),
            }),
        },
        Strategy::Push { registry, topic } => push::run(driver, registry, topic).await,
        Strategy::Poll { interval } => poll::run(driver, *interval).await,
    }
}

// ─── Observation ──────────────────────────────────────────────────────────────

/// Handle to a running session.
///
/// Yields confirmation events as a [`Stream`]; the stream ends when the
/// session does. [`outcome`](Self::outcome) resolves to the terminal result.
/// Dropping the observation cancels the session.
#[derive(Debug)]
pub struct Observation {
    tx_hash: String,
    events: mpsc::UnboundedReceiver<ConfirmationEvent>,
    outcome: oneshot::Receiver<Result<Confirmed, ObserveError>>,
    cancel: Arc<Cancellation>,
}

impl Observation {
    pub fn tx_hash(&self) -> &str {
        &self.tx_hash
    }

    /// Stop the session. No event is yielded after this returns, even one
    /// that was already buffered.
    pub fn cancel(&mut self) {
        self.cancel.cancel();
        self.events.close();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Wait for the terminal result. Events not yet consumed are discarded.
    pub async fn outcome(mut self) -> Result<Confirmed, ObserveError> {
        match (&mut self.outcome).await {
            Ok(result) => result,
            Err(_) => Err(ObserveError::Cancelled {
                tx_hash: self.tx_hash.clone(),
                progress: Progress::default(),
            }),
        }
    }
}

impl Stream for Observation {
    type Item = ConfirmationEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.cancel.is_cancelled() {
            return Poll::Ready(None);
        }
        self.events.poll_recv(cx)
    }
}

impl Drop for Observation {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
