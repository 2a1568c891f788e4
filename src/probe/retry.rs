//! Bounded sequential retries with a fixed delay

use crate::{descriptor::RetryPolicy, error::ProbeError};
use std::future::Future;
use tokio::time::sleep;
use tracing::{info, warn};

/// Run `operation` until it succeeds, fails with a non-transient error, or
/// `policy.max_attempts()` attempts have been made.
///
/// The closure receives the 1-based attempt number. On success the attempt
/// count is returned next to the value; a failure is stamped with it instead.
///
/// # Errors
///
/// Returns the last error once retries are exhausted, or the first
/// non-transient error immediately
pub async fn retry_transient<T, F, Fut>(
    policy: &RetryPolicy,
    target: &str,
    mut operation: F,
) -> Result<(T, u32), ProbeError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, ProbeError>>,
{
    let max_attempts = policy.max_attempts();
    let mut attempt = 1;

    loop {
        info!(attempt, max_attempts, target, "connecting");

        match operation(attempt).await {
            Ok(value) => return Ok((value, attempt)),
            Err(err) if err.is_transient() && attempt < max_attempts => {
                warn!(
                    attempt,
                    max_attempts,
                    error = %err,
                    "transient failure, retrying in {:?}",
                    policy.retry_delay
                );
                sleep(policy.retry_delay).await;
                attempt += 1;
            }
            Err(err) => {
                warn!(attempt, max_attempts, kind = %err.kind(), "giving up: {err}");
                return Err(err.with_attempts(attempt));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;
    use std::{
        sync::atomic::{AtomicU32, Ordering},
        time::Duration,
    };

    fn policy(retry_count: u32) -> RetryPolicy {
        RetryPolicy {
            retry_count,
            retry_delay: Duration::from_millis(1),
        }
    }

    #[tokio::test]
    async fn test_success_on_first_attempt() {
        let (value, attempts) = retry_transient(&policy(3), "db:5432", |_| async { Ok(42) })
            .await
            .unwrap();
        assert_eq!(value, 42);
        assert_eq!(attempts, 1);
    }

    #[tokio::test]
    async fn test_network_failures_exhaust_all_attempts() {
        let calls = AtomicU32::new(0);
        let err = retry_transient(&policy(4), "db:5432", |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(ProbeError::network("db:5432", "connection refused")) }
        })
        .await
        .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 5);
        assert_eq!(err.attempts(), Some(5));
    }

    #[tokio::test]
    async fn test_recovers_after_transient_failure() {
        let (value, attempts) = retry_transient(&policy(2), "db:5432", |attempt| async move {
            if attempt < 3 {
                Err(ProbeError::network("db:5432", "timed out"))
            } else {
                Ok(attempt)
            }
        })
        .await
        .unwrap();
        assert_eq!(value, 3);
        assert_eq!(attempts, 3);
    }

    #[tokio::test]
    async fn test_non_transient_error_is_not_retried() {
        let calls = AtomicU32::new(0);
        let err = retry_transient(&policy(5), "db:5432", |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async {
                Err::<(), _>(ProbeError::Authentication {
                    user: "admin".into(),
                    reason: "password authentication failed".into(),
                })
            }
        })
        .await
        .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(err.kind(), crate::error::ErrorKind::Authentication);
        assert_eq!(err.attempts(), Some(1));
    }

    #[tokio::test]
    async fn test_permanent_failure_after_retries_keeps_count() {
        let err = retry_transient(&policy(5), "db:5432", |attempt| async move {
            if attempt < 3 {
                Err::<(), _>(ProbeError::network("db:5432", "timed out"))
            } else {
                Err(ProbeError::Tls("unknown issuer".into()))
            }
        })
        .await
        .unwrap_err();

        assert_eq!(err.kind(), crate::error::ErrorKind::Tls);
        assert_eq!(err.attempts(), Some(3));
    }

    #[tokio::test]
    async fn test_waits_between_attempts() {
        let delay = RetryPolicy {
            retry_count: 2,
            retry_delay: Duration::from_millis(20),
        };
        let started = std::time::Instant::now();
        let _ = retry_transient(&delay, "db:5432", |_| async {
            Err::<(), _>(ProbeError::network("db:5432", "unreachable"))
        })
        .await;
        assert!(started.elapsed() >= Duration::from_millis(40));
    }
}
