//! Bounded retry with a fixed interval

use crate::error::{RemoteError, Result};
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Run `action` up to `max_attempts` times, `interval` apart
///
/// Returns the first success, or the last failure once attempts are
/// exhausted. A cancelled token, or an action that itself reports
/// `Cancelled`, ends the loop immediately.
pub async fn retry<T, F, Fut>(
    mut action: F,
    max_attempts: u32,
    interval: Duration,
    cancel: &CancellationToken,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let max_attempts = max_attempts.max(1);
    let mut attempt = 1;

    loop {
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(RemoteError::Cancelled),
            result = action() => result,
        };

        match result {
            Ok(value) => return Ok(value),
            Err(RemoteError::Cancelled) => return Err(RemoteError::Cancelled),
            Err(e) if attempt >= max_attempts => return Err(e),
            Err(e) => {
                warn!("Attempt {}/{} failed: {}", attempt, max_attempts, e);
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => return Err(RemoteError::Cancelled),
            _ = tokio::time::sleep(interval) => {}
        }
        attempt += 1;
    }
}
