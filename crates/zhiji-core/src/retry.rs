use std::future::Future;

use crate::error::Result;

/// Retry an async operation with exponential backoff for transient errors.
/// Non-transient errors are returned immediately; `max_retries` counts the
/// extra attempts after the first one.
pub async fn with_retry<F, Fut, T>(max_retries: usize, base_delay_ms: u64, f: F) -> Result<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0usize;
    loop {
        match f().await {
            Ok(val) => return Ok(val),
            Err(e) if !e.is_transient() || attempt >= max_retries => return Err(e),
            Err(e) => {
                let delay = base_delay_ms * 2u64.pow(attempt as u32);
                tracing::warn!(
                    attempt = attempt + 1,
                    max_retries,
                    delay_ms = delay,
                    error = %e,
                    "transient error, retrying"
                );
                tokio::time::sleep(std::time::Duration::from_millis(delay)).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ZhijiError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_first_attempt_success() {
        let calls = AtomicUsize::new(0);
        let result = with_retry(2, 1, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok::<_, ZhijiError>("ok") }
        })
        .await;
        assert_eq!(result.unwrap(), "ok");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_permanent_error_is_not_retried() {
        let calls = AtomicUsize::new(0);
        let result = with_retry(3, 1, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(ZhijiError::InvalidInput("bad".into())) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_timeouts_exhaust_retries() {
        let calls = AtomicUsize::new(0);
        let result = with_retry(1, 1, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(ZhijiError::Timeout("search".into())) }
        })
        .await;
        assert!(matches!(result, Err(ZhijiError::Timeout(_))));
        // one call plus one retry
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_recovers_after_transient_failure() {
        let calls = AtomicUsize::new(0);
        let result = with_retry(2, 1, || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    Err(ZhijiError::Search("HTTP 503".into()))
                } else {
                    Ok(7)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
