use std::{
    future::Future,
    time::Duration,
};

use common::{
    backoff::Backoff,
    knobs::{
        SWEEPERS_RETRY_ATTEMPTS,
        SWEEPERS_RETRY_INITIAL_BACKOFF,
        SWEEPERS_RETRY_MAX_BACKOFF,
    },
};

use crate::Error;

/// First-class retry policy shared by the scan and bulk engines. Only
/// transport-class failures are retried; auth and query failures surface
/// immediately.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: *SWEEPERS_RETRY_ATTEMPTS,
            initial_backoff: *SWEEPERS_RETRY_INITIAL_BACKOFF,
            max_backoff: *SWEEPERS_RETRY_MAX_BACKOFF,
        }
    }
}

pub async fn with_retries<T, F, Fut>(
    policy: RetryPolicy,
    description: &str,
    mut f: F,
) -> Result<T, Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, Error>>,
{
    let mut backoff = Backoff::new(policy.initial_backoff, policy.max_backoff);
    let mut attempt = 1u32;
    loop {
        match f().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt < policy.max_attempts => {
                let delay = backoff.fail(&mut rand::rng());
                tracing::warn!(
                    "{description} failed (attempt {attempt}/{}): {e}; retrying in {delay:?}",
                    policy.max_attempts,
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            },
            Err(e) => {
                if e.is_retryable() {
                    tracing::error!(
                        "{description} failed after {attempt} attempts, giving up: {e}"
                    );
                }
                return Err(e);
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{
            AtomicU32,
            Ordering,
        },
        time::Duration,
    };

    use http::StatusCode;

    use super::*;

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 4,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(2),
        }
    }

    #[tokio::test]
    async fn test_retries_transport_failures_until_success() {
        let calls = AtomicU32::new(0);
        let result = with_retries(fast_policy(), "test op", || async {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(Error::ServerError {
                    status: StatusCode::SERVICE_UNAVAILABLE,
                    body: "overloaded".to_string(),
                })
            } else {
                Ok(42)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhausts_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let result: Result<(), Error> = with_retries(fast_policy(), "test op", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(Error::ServerError {
                status: StatusCode::INTERNAL_SERVER_ERROR,
                body: "boom".to_string(),
            })
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_auth_failures_are_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<(), Error> = with_retries(fast_policy(), "test op", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(Error::Auth {
                status: StatusCode::FORBIDDEN,
            })
        })
        .await;
        assert!(matches!(result, Err(Error::Auth { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
