//! Bounded retry with fresh state per attempt.
//!
//! All optimistic-concurrency loops in the allocator and the GC controller
//! go through [`with_retry`]. The operation itself must fetch everything it
//! mutates, so a conflicted attempt never reapplies a stale snapshot.

use std::future::Future;

use tracing::warn;

use crate::error::IpamError;

/// Runs `op` until it succeeds, fails fatally, or `attempts` runs out.
///
/// Retryable errors (see [`IpamError::is_retryable`]) are logged and
/// retried; everything else returns immediately. Exhausting the bound
/// yields [`IpamError::RetryExhausted`].
///
/// The closure receives the 1-based attempt number.
pub async fn with_retry<T, F, Fut>(attempts: u32, what: &str, mut op: F) -> Result<T, IpamError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, IpamError>>,
{
    for attempt in 1..=attempts {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() => {
                warn!(what, attempt, attempts, error = %e, "attempt failed, will retry");
            }
            Err(e) => return Err(e),
        }
    }
    Err(IpamError::RetryExhausted {
        what: what.to_string(),
        attempts,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StoreError;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn conflict() -> IpamError {
        IpamError::Store(StoreError::Conflict("IPPoolLedger pool-a".to_string()))
    }

    #[tokio::test]
    async fn test_retries_conflicts_until_success() {
        let calls = AtomicU32::new(0);
        let result = with_retry(5, "test op", |_| {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            async move { if n < 3 { Err(conflict()) } else { Ok(n) } }
        })
        .await;
        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_fatal_errors_short_circuit() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_retry(5, "test op", |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(IpamError::PoolExhausted("pool-a".to_string())) }
        })
        .await;
        assert!(matches!(result, Err(IpamError::PoolExhausted(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_exhaustion_is_reported() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_retry(3, "test op", |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(conflict()) }
        })
        .await;
        assert!(matches!(
            result,
            Err(IpamError::RetryExhausted { attempts: 3, .. })
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_attempt_numbers_are_one_based() {
        let mut seen = Vec::new();
        let _ = with_retry(3, "test op", |attempt| {
            seen.push(attempt);
            async { Err::<(), _>(conflict()) }
        })
        .await;
        assert_eq!(seen, vec![1, 2, 3]);
    }
}
