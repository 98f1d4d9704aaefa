//! Bounded retry for conflict-class failures.

use std::future::Future;
use std::time::Duration;

use skiff_error::Result;
use tracing::debug;

/// Attempts per lifecycle operation before a conflict is surfaced.
pub const MAX_CONFLICT_ATTEMPTS: u32 = 5;

/// Runs an operation, retrying while it fails with a conflict.
///
/// Conflicts signal transient commit races (stale handle, concurrent
/// rename); every other error class returns immediately.
pub async fn retry_on_conflict<T, F, Fut>(what: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Err(e) if e.is_conflict() && attempt < MAX_CONFLICT_ATTEMPTS => {
                debug!(attempt, "{} conflicted, retrying: {}", what, e);
                tokio::time::sleep(Duration::from_millis(50 * u64::from(attempt))).await;
                attempt += 1;
            }
            result => return result,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skiff_error::EngineError;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn conflicts_are_retried_until_success() {
        let calls = AtomicU32::new(0);
        let result = retry_on_conflict("test", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(EngineError::conflict("stale handle"))
                } else {
                    Ok(n)
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(result, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_conflicts_fail_fast() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = retry_on_conflict("test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(EngineError::not_found("gone")) }
        })
        .await;
        assert!(result.unwrap_err().is_not_found());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn persistent_conflict_surfaces_after_bound() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = retry_on_conflict("test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(EngineError::conflict("always")) }
        })
        .await;
        assert!(result.unwrap_err().is_conflict());
        assert_eq!(calls.load(Ordering::SeqCst), MAX_CONFLICT_ATTEMPTS);
    }
}
