//! Fixed-interval retry with a total wait budget, for transient infrastructure errors.

use std::future::Future;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio_retry::strategy::FixedInterval;
use tokio_retry::Retry;

use crate::error::{LaunchError, Result};

/// Runs `op` until it succeeds, sleeping `interval` between attempts. Once `budget`
/// has elapsed the last attempt's error is returned as `RetryExhausted`.
pub async fn retry_fixed<T, F, Fut>(
    what: &str,
    interval: Duration,
    budget: Duration,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let last_error: Mutex<Option<String>> = Mutex::new(None);
    let action = || {
        let attempt = op();
        let last_error = &last_error;
        async move {
            attempt.await.map_err(|e| {
                tracing::debug!(what, error = %e, "Attempt failed, retrying");
                *last_error.lock().unwrap_or_else(PoisonError::into_inner) = Some(e.to_string());
                e
            })
        }
    };

    match tokio::time::timeout(budget, Retry::spawn(FixedInterval::new(interval), action)).await {
        Ok(result) => result,
        Err(_) => {
            let last = last_error
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take()
                .unwrap_or_else(|| format!("no attempt finished within {:?}", budget));
            Err(LaunchError::RetryExhausted {
                what: what.to_string(),
                last,
            })
        }
    }
}
