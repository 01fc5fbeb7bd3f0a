use crate::Error;
use backoff::ExponentialBackoff;
use std::{
    future::Future,
    sync::atomic::{AtomicU32, Ordering},
    time::Duration,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
        }
    }
}

/// Runs `attempt` until it succeeds, fails permanently or `max_attempts` is
/// used up, backing off exponentially in between. `attempt` is passed the
/// 1-based attempt number.
pub async fn retry<T, F, Fut>(policy: &RetryPolicy, mut attempt: F) -> Result<T, Error>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, Error>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let attempts = AtomicU32::new(0);

    let mut backoff: ExponentialBackoff = ExponentialBackoff::default();
    backoff.initial_interval = policy.initial_backoff;
    backoff.current_interval = policy.initial_backoff;
    backoff.max_interval = policy.max_backoff;
    backoff.max_elapsed_time = None;

    backoff::future::retry_notify(
        backoff,
        || {
            let number = attempts.fetch_add(1, Ordering::SeqCst) + 1;
            let future = attempt(number);

            async move {
                future.await.map_err(|e| {
                    if e.is_transient() && number < max_attempts {
                        backoff::Error::transient(e)
                    } else {
                        backoff::Error::permanent(e)
                    }
                })
            }
        },
        |e: Error, wait: Duration| {
            tracing::warn!("attempt failed, retrying in {}ms: {:#}", wait.as_millis(), e)
        },
    )
    .await
}
