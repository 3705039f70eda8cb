use std::future::Future;

use crate::error::IdempotencyError;
use crate::policy::IdempotencyConfig;

/// Run a store operation under the configured retry policy.
///
/// The operation is attempted `storage_retry_count + 1` times with a constant
/// `storage_retry_delay` between attempts. Failure-mode handling (fail-safe
/// vs. fail-open) is applied by the caller, which knows the per-operation
/// fallback value.
pub async fn with_store_retry<T, F, Fut>(
    config: &IdempotencyConfig,
    operation_name: &str,
    mut operation: F,
) -> Result<T, IdempotencyError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, IdempotencyError>>,
{
    let attempts = config.storage_retry_count + 1;
    let mut last_error = None;
    for attempt in 0..attempts {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                tracing::warn!(
                    "idempotency store {} attempt {}/{} failed: {}",
                    operation_name,
                    attempt + 1,
                    attempts,
                    e
                );
                last_error = Some(e);
                if attempt + 1 < attempts {
                    tokio::time::sleep(config.storage_retry_delay).await;
                }
            }
        }
    }
    // attempts は常に 1 以上なので last_error は必ず埋まっている
    Err(last_error.unwrap_or_else(|| IdempotencyError::Storage("no attempts made".to_string())))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn test_success_on_first_attempt() {
        let config = IdempotencyConfig::default();
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = calls.clone();
        let result = with_store_retry(&config, "get", move || {
            let calls = calls2.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, IdempotencyError>(42u32)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_no_retry_by_default() {
        let config = IdempotencyConfig::default();
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = calls.clone();
        let result: Result<u32, _> = with_store_retry(&config, "get", move || {
            let calls = calls2.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(IdempotencyError::Storage("down".to_string()))
            }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retries_until_success() {
        let config =
            IdempotencyConfig::default().with_storage_retry(3, Duration::from_millis(1));
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = calls.clone();
        let result = with_store_retry(&config, "save", move || {
            let calls = calls2.clone();
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(IdempotencyError::Storage("transient".to_string()))
                } else {
                    Ok("saved")
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), "saved");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhausted_retries_return_last_error() {
        let config =
            IdempotencyConfig::default().with_storage_retry(2, Duration::from_millis(1));
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = calls.clone();
        let result: Result<(), _> = with_store_retry(&config, "lock", move || {
            let calls = calls2.clone();
            async move {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                Err(IdempotencyError::Storage(format!("failure {n}")))
            }
        })
        .await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        match result {
            Err(IdempotencyError::Storage(msg)) => assert_eq!(msg, "failure 2"),
            other => panic!("unexpected result: {other:?}"),
        }
    }
}
