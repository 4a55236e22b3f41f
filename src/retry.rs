//! Bounded retry with fixed delay
//!
//! One reusable primitive for every retry site in the crate: transient
//! hardware writes, verification re-measurement, and auto-revert. Bounded
//! attempt counts plus bounded delays; nothing here blocks forever.

use std::future::Future;
use std::time::Duration;

use tracing::debug;

/// Run `op` up to `attempts` times, sleeping `delay` between failures.
///
/// Returns the first success, or the last error once attempts run out.
/// `attempts` is clamped to at least 1.
pub async fn retry_with_delay<T, E, F, Fut>(attempts: u32, delay: Duration, mut op: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let attempts = attempts.max(1);
    let mut last_err = match op().await {
        Ok(value) => return Ok(value),
        Err(e) => {
            debug!(attempt = 1, attempts, error = %e, "attempt failed");
            e
        }
    };

    for attempt in 2..=attempts {
        tokio::time::sleep(delay).await;
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                debug!(attempt, attempts, error = %e, "attempt failed");
                last_err = e;
            }
        }
    }

    Err(last_err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn returns_first_success() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, String> = retry_with_delay(3, Duration::from_millis(10), || {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                if n < 2 {
                    Err("transient".to_string())
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausts_attempts_and_returns_last_error() {
        let calls = AtomicU32::new(0);
        let result: Result<(), String> = retry_with_delay(3, Duration::from_millis(10), || {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            async move { Err(format!("fail {}", n)) }
        })
        .await;
        assert_eq!(result.unwrap_err(), "fail 3");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_attempts_clamps_to_one() {
        let result: Result<u32, String> =
            retry_with_delay(0, Duration::ZERO, || async { Ok(7) }).await;
        assert_eq!(result.unwrap(), 7);
    }
}
