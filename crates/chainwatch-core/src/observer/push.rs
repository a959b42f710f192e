//! Push strategy: every `newHeads` delivery drives one check.

use serde_json::Value;
use tokio::sync::mpsc;

use super::driver::SessionDriver;
use crate::error::{ObserveError, ProviderError, SubscriptionError};
use crate::registry::{SubscriptionMessage, SubscriptionRegistry};
use crate::types::{BlockHeader, Confirmed};

pub(crate) async fn run(
    driver: &mut SessionDriver,
    registry: &SubscriptionRegistry,
    topic: &str,
) -> Result<Confirmed, ObserveError> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let handle = registry
        .subscribe(topic, Vec::<Value>::new(), tx)
        .await
        .map_err(|e| driver.subscription_failed(e))?;
    driver.hold_subscription(registry.clone(), handle);
    tracing::debug!(tx = %driver.session.tx_hash(), %handle, topic, "subscribed to new heads");

    if let Some(done) = driver.step(None).await? {
        return Ok(done);
    }

    loop {
        match rx.recv().await {
            Some(SubscriptionMessage::Payload(payload)) => {
                let Some(header) = BlockHeader::from_json(&payload) else {
                    tracing::warn!(tx = %driver.session.tx_hash(), %payload, "ignoring malformed head");
                    continue;
                };
                // Heads skipped by the node are fetched so the walk stays
                // contiguous, as in the poll strategy.
                let gap = driver
                    .session
                    .last_block()
                    .is_some_and(|last| header.number > last.number + 1);
                if gap {
                    if let Some(done) = driver.catch_up(header.number - 1).await? {
                        return Ok(done);
                    }
                }
                if let Some(done) = driver.step(Some(&header)).await? {
                    return Ok(done);
                }
                if let Some(done) = driver.catch_up(header.number).await? {
                    return Ok(done);
                }
            }
            Some(SubscriptionMessage::Error(e)) => return Err(driver.subscription_failed(e)),
            None => {
                return Err(driver.subscription_failed(SubscriptionError::Provider(
                    ProviderError::Closed,
                )))
            }
        }
    }
}
