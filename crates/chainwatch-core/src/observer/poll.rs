//! Poll strategy: a fixed-interval tick walks the chain forward.
//!
//! Ticks never overlap; the next sleep starts only after the previous tick's
//! requests have completed.

use std::time::Duration;

use super::driver::SessionDriver;
use crate::error::ObserveError;
use crate::types::Confirmed;

pub(crate) async fn run(driver: &mut SessionDriver, interval: Duration) -> Result<Confirmed, ObserveError> {
    if let Some(done) = driver.step(None).await? {
        return Ok(done);
    }
    loop {
        tokio::time::sleep(interval).await;
        if let Some(done) = tick(driver).await? {
            return Ok(done);
        }
    }
}

async fn tick(driver: &mut SessionDriver) -> Result<Option<Confirmed>, ObserveError> {
    if driver.session.last_block().is_none() {
        // Receipt still unknown: only the head matters.
        let head = driver
            .chain
            .latest()
            .await
            .map_err(|e| driver.dispatch_failed(e))?;
        if let Some(done) = driver.step(head.as_ref()).await? {
            return Ok(Some(done));
        }
        return match head {
            Some(head) => driver.catch_up(head.number).await,
            None => Ok(None),
        };
    }

    let head = driver
        .chain
        .head_number()
        .await
        .map_err(|e| driver.dispatch_failed(e))?;
    driver.catch_up(head).await
}
