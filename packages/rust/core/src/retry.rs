//! Retry wrapper for store calls.

use std::future::Future;

use courier_shared::{Result, RetryPolicy};
use tracing::warn;

/// Run `op`, retrying storage-class errors with `policy`'s backoff.
/// Any other error is returned on the first occurrence.
pub(crate) async fn with_storage_retry<T, F, Fut>(
    policy: &RetryPolicy,
    what: &str,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Err(e) if e.is_storage() && attempt < policy.max_attempts => {
                let delay = policy.delay_for(attempt);
                warn!(op = what, attempt, ?delay, error = %e, "storage write failed, retrying");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            other => return other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use courier_shared::CourierError;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
        }
    }

    #[tokio::test]
    async fn retries_storage_errors_then_succeeds() {
        let calls = AtomicU32::new(0);
        let result = with_storage_retry(&policy(), "put", || async {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(CourierError::storage("database is locked"))
            } else {
                Ok(7)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = with_storage_retry(&policy(), "put", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(CourierError::storage("disk full"))
        })
        .await;
        assert!(result.unwrap_err().is_storage());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn other_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = with_storage_retry(&policy(), "get", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(CourierError::validation("bad row"))
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
