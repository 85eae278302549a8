//! Capped exponential backoff for transient provider failures.
//!
//! Retries happen inside one turn and never consume the cell's turn
//! budget. Only `Error::is_retryable` failures are retried.

use std::future::Future;
use std::time::Duration;

use casc_domain::error::Result;

use crate::registry::mask_secrets;

/// Ceiling on a single backoff sleep.
const MAX_BACKOFF: Duration = Duration::from_secs(5);

/// Run `op` up to `attempts` times, sleeping `base_backoff * 2^n` between
/// transient failures. The last error is returned on exhaustion.
pub async fn with_retry<T, F, Fut>(attempts: u32, base_backoff: Duration, op: F) -> Result<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let attempts = attempts.max(1);
    let mut backoff = base_backoff;

    for attempt in 1..=attempts {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt < attempts => {
                tracing::warn!(
                    attempt,
                    attempts,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %mask_secrets(&e.to_string()),
                    "transient provider failure, retrying"
                );
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(MAX_BACKOFF);
            }
            Err(e) => return Err(e),
        }
    }
    unreachable!("loop returns on the final attempt");
}

#[cfg(test)]
mod tests {
    use super::*;
    use casc_domain::error::Error;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn retries_transient_until_success() {
        let calls = AtomicU32::new(0);
        let result = with_retry(3, Duration::from_millis(10), || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(Error::ProviderTransient("503".into()))
                } else {
                    Ok("ok")
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), "ok");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_errors_fail_fast() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = with_retry(3, Duration::from_millis(10), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(Error::ProviderPermanent("401".into())) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn exhaustion_returns_last_error() {
        let result: Result<()> = with_retry(2, Duration::from_millis(10), || async {
            Err(Error::ProviderTransient("timeout".into()))
        })
        .await;
        assert!(matches!(result, Err(Error::ProviderTransient(_))));
    }
}
