use std::future::Future;
use std::time::Duration;

use ferry_types::StorageResult;
use tracing::warn;

/// Bounded retry with exponential backoff.
///
/// Only errors for which [`ferry_types::StorageError::is_retryable`] holds are
/// retried; everything else is returned on the first occurrence.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    attempts: u32,
    backoff: Duration,
    backoff_max: Duration,
}

impl RetryPolicy {
    pub fn new(attempts: u32, backoff: Duration, backoff_max: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            backoff,
            backoff_max: backoff_max.max(backoff),
        }
    }

    /// A single attempt, no retry.
    pub fn once() -> Self {
        Self::new(1, Duration::ZERO, Duration::ZERO)
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Delay before attempt `attempt + 1`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(16);
        self.backoff.saturating_mul(factor).min(self.backoff_max)
    }

    /// Run `op` until it succeeds, fails terminally, or attempts run out.
    ///
    /// `op` receives the 1-based attempt number.
    pub async fn run<T, F, Fut>(&self, what: &str, mut op: F) -> StorageResult<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = StorageResult<T>>,
    {
        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() && attempt < self.attempts => {
                    let delay = self.delay(attempt);
                    warn!(
                        target: "ferry::retry",
                        what,
                        attempt,
                        attempts = self.attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferry_types::StorageError;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast(attempts: u32) -> RetryPolicy {
        RetryPolicy::new(attempts, Duration::from_millis(1), Duration::from_millis(2))
    }

    #[test]
    fn backoff_doubles_then_caps() {
        let policy = RetryPolicy::new(10, Duration::from_millis(100), Duration::from_millis(500));
        assert_eq!(policy.delay(1), Duration::from_millis(100));
        assert_eq!(policy.delay(2), Duration::from_millis(200));
        assert_eq!(policy.delay(3), Duration::from_millis(400));
        assert_eq!(policy.delay(4), Duration::from_millis(500));
        assert_eq!(policy.delay(40), Duration::from_millis(500));
    }

    #[test]
    fn zero_attempts_means_one() {
        assert_eq!(RetryPolicy::new(0, Duration::ZERO, Duration::ZERO).attempts(), 1);
    }

    #[tokio::test]
    async fn transient_errors_retried() {
        let calls = AtomicU32::new(0);
        let value = fast(3)
            .run("op", |attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt < 3 {
                        Err(StorageError::Connectivity("refused".into()))
                    } else {
                        Ok(attempt)
                    }
                }
            })
            .await
            .unwrap();
        assert_eq!(value, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn terminal_error_not_retried() {
        let calls = AtomicU32::new(0);
        let err = fast(5)
            .run("op", |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(StorageError::Cipher("bad tag".into())) }
            })
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Cipher(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn client_errors_not_retried() {
        let calls = AtomicU32::new(0);
        let _ = fast(5)
            .run("op", |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    Err::<(), _>(StorageError::Provider { status: Some(404), message: "no such key".into() })
                }
            })
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhausted_returns_last_error() {
        let calls = AtomicU32::new(0);
        let err = fast(4)
            .run("op", |attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move { Err::<(), _>(StorageError::Timeout(format!("attempt {attempt}"))) }
            })
            .await
            .unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(err.message(), "attempt 4");
    }
}
