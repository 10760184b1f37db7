//! Poll-until-ready helper shared by startup and the reconciler.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;

use crate::{Error, Result};

/// Interval used for every readiness poll in the controller
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Poll until `poll_fn` yields a value or `timeout` expires.
///
/// `poll_fn` returns `Ok(Some(T))` when ready and `Ok(None)` to keep
/// waiting. Errors are logged and polling continues; only the timeout ends
/// the wait unsuccessfully, with [`Error::Timeout`].
pub async fn wait_for_resource<T, F, Fut>(
    description: &str,
    timeout: Duration,
    poll_interval: Duration,
    mut poll_fn: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>>>,
{
    let start = Instant::now();

    loop {
        match poll_fn().await {
            Ok(Some(value)) => return Ok(value),
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(error = %e, "Poll error for {}, retrying...", description);
            }
        }

        if start.elapsed() >= timeout {
            return Err(Error::Timeout(format!(
                "after {:?} waiting for {}",
                timeout, description
            )));
        }

        tokio::time::sleep(poll_interval).await;
    }
}
