//! Bounded constant-backoff retries for operations against flaky peers
//! (backend scrapes, owner pulls, etcd reads).

use std::future::Future;
use std::time::Duration;

use tracing::debug;

/// Retry policy: at most `max_retries` retries (so `max_retries + 1`
/// attempts total), sleeping `interval` between attempts.
#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    pub max_retries: usize,
    pub interval: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: usize, interval: Duration) -> Self {
        Self {
            max_retries,
            interval,
        }
    }
}

/// Runs `op` until it succeeds, it fails with a non-retryable error, or the
/// policy is exhausted. `retryable` classifies errors; a non-retryable error
/// is returned immediately.
pub async fn retry<T, E, F, Fut, R>(policy: RetryPolicy, retryable: R, mut op: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    R: Fn(&E) -> bool,
    E: std::fmt::Display,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if attempt < policy.max_retries && retryable(&e) => {
                attempt += 1;
                debug!(%e, attempt, "retrying after transient error");
                tokio::time::sleep(policy.interval).await;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let calls = AtomicUsize::new(0);
        let policy = RetryPolicy::new(3, Duration::from_millis(1));
        let out: Result<u32, String> = retry(policy, |_| true, || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err("transient".to_string())
                } else {
                    Ok(7)
                }
            }
        })
        .await;
        assert_eq!(out.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_max_retries() {
        let calls = AtomicUsize::new(0);
        let policy = RetryPolicy::new(2, Duration::from_millis(1));
        let out: Result<(), String> = retry(policy, |_| true, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err("still broken".to_string()) }
        })
        .await;
        assert!(out.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_retryable_fails_fast() {
        let calls = AtomicUsize::new(0);
        let policy = RetryPolicy::new(5, Duration::from_millis(1));
        let out: Result<(), String> = retry(policy, |_| false, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err("fatal".to_string()) }
        })
        .await;
        assert!(out.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
