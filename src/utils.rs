//! Small shared helpers

use std::future::Future;
use std::time::Duration;

use anyhow::Result;
use log::warn;

use crate::errors::{TimeoutError, is_timeout};

/// Run an async operation under a deadline.
///
/// On deadline the operation is dropped (cancelling it cooperatively) and a
/// [`TimeoutError`] naming the operation is returned.
pub async fn with_timeout<F, T>(operation: F, timeout: Duration, operation_name: &str) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(timeout, operation).await {
        Ok(result) => result,
        Err(_) => Err(TimeoutError::new(operation_name, timeout).into()),
    }
}

/// Run a re-creatable async operation under a deadline, retrying on timeout.
///
/// Non-timeout errors surface immediately; timeouts are retried up to
/// `retries` additional attempts with a warning each time.
pub async fn with_timeout_retried<Make, Fut, T>(
    make: Make,
    timeout: Duration,
    retries: u32,
    operation_name: &str,
) -> Result<T>
where
    Make: Fn() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        match with_timeout(make(), timeout, operation_name).await {
            Ok(value) => return Ok(value),
            Err(err) if is_timeout(&err) && attempt < retries => {
                attempt += 1;
                warn!("{operation_name} timed out, retrying ({attempt}/{retries})");
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn returns_value_before_deadline() {
        let value = with_timeout(
            async { Ok::<_, anyhow::Error>(42) },
            Duration::from_secs(1),
            "fast op",
        )
        .await
        .expect("should succeed");
        assert_eq!(value, 42);
    }

    #[tokio::test]
    async fn deadline_produces_timeout_error() {
        let result: Result<()> = with_timeout(
            async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(())
            },
            Duration::from_millis(10),
            "slow op",
        )
        .await;

        let err = result.expect_err("should time out");
        assert!(is_timeout(&err));
        assert!(err.to_string().contains("slow op"));
    }

    #[tokio::test]
    async fn retries_timeouts_then_succeeds() {
        let calls = AtomicU32::new(0);
        let value = with_timeout_retried(
            || async {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    tokio::time::sleep(Duration::from_secs(10)).await;
                }
                Ok::<_, anyhow::Error>(n)
            },
            Duration::from_millis(20),
            3,
            "flaky op",
        )
        .await
        .expect("third attempt should succeed");
        assert_eq!(value, 2);
    }

    #[tokio::test]
    async fn non_timeout_errors_surface_immediately() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = with_timeout_retried(
            || async {
                calls.fetch_add(1, Ordering::SeqCst);
                anyhow::bail!("hard failure")
            },
            Duration::from_secs(1),
            3,
            "failing op",
        )
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
