//! Bounded polling and retry.
//!
//! Only the two waits of a deployment (running state, address allocation)
//! and best-effort cleanup retry. Everything else fails fast.

use std::future::Future;
use std::time::Duration;

use tokio::time::{Instant, sleep};
use tracing::debug;

use crate::{Error, Result};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Poll `check` until it yields `Some`, retrying transient errors, until
/// `timeout` elapses. A permanent error ends the wait at once; the last
/// transient one is carried in the timeout.
pub async fn poll_until<T, F, Fut>(
    what: &'static str,
    timeout: Duration,
    interval: Duration,
    mut check: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>>>,
{
    let deadline = Instant::now() + timeout;
    let mut last = None;
    loop {
        match check().await {
            Ok(Some(value)) => return Ok(value),
            Ok(None) => {
                debug!(what, "not ready yet");
                last = None;
            }
            Err(e) if e.is_transient() => {
                debug!(what, error = %e, "transient error, retrying");
                last = Some(e.to_string());
            }
            Err(e) => return Err(e),
        }

        if Instant::now() + interval > deadline {
            return Err(Error::Timeout {
                what,
                secs: timeout.as_secs(),
                last,
            });
        }
        sleep(interval).await;
    }
}

/// Run `op` until it succeeds. Transient errors are retried until
/// `timeout`; the last error is returned once the deadline passes.
pub async fn retry<T, F, Fut>(
    what: &'static str,
    timeout: Duration,
    interval: Duration,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let deadline = Instant::now() + timeout;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && Instant::now() + interval <= deadline => {
                debug!(what, error = %e, "retrying");
                sleep(interval).await;
            }
            Err(e) => return Err(e),
        }
    }
}
