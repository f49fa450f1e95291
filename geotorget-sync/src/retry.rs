//! Backoff loop for listing and subscription requests.

use std::future::Future;

use tokio_util::sync::CancellationToken;

use geotorget_core::RetrySettings;

use crate::error::RemoteError;

/// Why [`with_retry`] gave up.
#[derive(Debug)]
pub(crate) enum RetryError {
    Cancelled,
    Remote(RemoteError),
}

/// Run `op` until it succeeds, fails non-transiently, or exhausts
/// `retry.max_attempts`. Backoff waits end early on cancellation.
pub(crate) async fn with_retry<T, F, Fut>(
    retry: &RetrySettings,
    cancel: &CancellationToken,
    what: &str,
    mut op: F,
) -> Result<T, RetryError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, RemoteError>>,
{
    let max_attempts = retry.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        attempt += 1;
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(RetryError::Cancelled),
            result = op() => result,
        };
        match result {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && attempt < max_attempts => {
                let delay = retry.backoff(attempt);
                tracing::warn!(
                    what,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "request failed, retrying"
                );
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(RetryError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            Err(err) => return Err(RetryError::Remote(err)),
        }
    }
}
