//! Deadlock retry and operation deadlines for store calls.

use std::future::Future;
use std::time::Duration;

use lodestar_core::Error;

use crate::Result;
use crate::metrics::StateMetrics;

/// Default number of attempts for a deadlocked transaction.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Default pause between deadlock retries.
pub const DEFAULT_BACKOFF: Duration = Duration::from_millis(500);

/// Default deadline for one store operation, retries included.
pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(30);

/// How a store retries transient transaction failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Fixed pause between attempts.
    pub backoff: Duration,
    /// Deadline for the whole operation.
    pub operation_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff: DEFAULT_BACKOFF,
            operation_timeout: DEFAULT_OPERATION_TIMEOUT,
        }
    }
}

impl RetryPolicy {
    /// Runs `attempt` until it succeeds, fails with something other than a
    /// deadlock, or runs out of attempts.
    ///
    /// Each call to `attempt` must run one complete transaction. If the
    /// deadline passes the in-flight attempt is dropped, which rolls its
    /// transaction back.
    ///
    /// # Errors
    ///
    /// - [`Error::Timeout`] if the deadline passes
    /// - [`Error::Deadlock`] if every attempt deadlocked
    /// - Any other error from `attempt` as-is
    pub async fn run<T, F, Fut>(&self, operation: &'static str, mut attempt: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let retries = async {
            let mut tries = 1;
            loop {
                match attempt().await {
                    Err(Error::Deadlock { message }) if tries < self.max_attempts => {
                        tracing::warn!(
                            operation,
                            attempt = tries,
                            error = %message,
                            "deadlock detected, retrying transaction"
                        );
                        StateMetrics::new().record_deadlock_retry(operation);
                        tokio::time::sleep(self.backoff).await;
                        tries += 1;
                    }
                    other => return other,
                }
            }
        };

        tokio::time::timeout(self.operation_timeout, retries)
            .await
            .map_err(|_| Error::timeout(operation))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            backoff: Duration::from_millis(1),
            operation_timeout: Duration::from_secs(5),
        }
    }

    #[tokio::test]
    async fn retries_deadlocks_then_succeeds() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result = fast()
            .run("op", move || async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(Error::deadlock("victim"))
                } else {
                    Ok(7)
                }
            })
            .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<()> = fast()
            .run("op", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(Error::deadlock("victim"))
            })
            .await;
        assert!(matches!(result, Err(Error::Deadlock { .. })));
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn other_errors_are_not_retried() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<()> = fast()
            .run("op", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(Error::conflict("stale"))
            })
            .await;
        assert!(matches!(result, Err(Error::Conflict { .. })));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn deadline_is_enforced() {
        let policy = RetryPolicy {
            operation_timeout: Duration::from_millis(10),
            ..fast()
        };
        let result: Result<()> = policy
            .run("slow", || async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(Error::Timeout { .. })));
    }
}
