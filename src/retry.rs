// Retry/backoff executor for submission attempts: fixed backoff
// schedule of 3s, 9s; maximum 3 attempts.

use tokio::time::{sleep, Duration};

use crate::error::{AutopilotError, AutopilotResult};

/// Fixed backoff schedule used by the submission pipeline.
pub const BACKOFF_SCHEDULE: [Duration; 2] = [Duration::from_secs(3), Duration::from_secs(9)];
pub const MAX_ATTEMPTS: u32 = 3;

/// Run `f` up to [`MAX_ATTEMPTS`] times, sleeping per
/// [`BACKOFF_SCHEDULE`] between attempts. Stops early on a persistent
/// error, skipping further in-batch retry.
pub async fn with_retry<F, Fut, T>(mut f: F) -> AutopilotResult<(T, u32)>
where
    F: FnMut(u32) -> Fut,
    Fut: std::future::Future<Output = AutopilotResult<T>>,
{
    let mut last_error = None;
    for attempt in 1..=MAX_ATTEMPTS {
        match f(attempt).await {
            Ok(value) => return Ok((value, attempt)),
            Err(e) => {
                let retryable = e.is_retryable();
                last_error = Some(e);
                if !retryable || attempt == MAX_ATTEMPTS {
                    break;
                }
                if let Some(delay) = BACKOFF_SCHEDULE.get((attempt - 1) as usize) {
                    sleep(*delay).await;
                }
            }
        }
    }

    let cause = last_error.unwrap_or_else(|| AutopilotError::Internal("retry loop produced no error".to_string()));
    Err(AutopilotError::RetriesExhausted {
        attempts: MAX_ATTEMPTS,
        cause: cause.to_string(),
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn succeeds_without_retry_on_first_try() {
        let calls = AtomicU32::new(0);
        let result = with_retry(|_attempt| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok::<_, AutopilotError>(42) }
        })
        .await;
        assert_eq!(result.unwrap(), (42, 1));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn stops_immediately_on_persistent_error() {
        let calls = AtomicU32::new(0);
        let result: AutopilotResult<((), u32)> = with_retry(|_attempt| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(AutopilotError::Http { status: 400, body: "bad request".to_string() }) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_transient_errors_up_to_max_attempts() {
        let calls = AtomicU32::new(0);
        let result: AutopilotResult<((), u32)> = with_retry(|_attempt| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(AutopilotError::Timeout("slow".to_string())) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), MAX_ATTEMPTS);
    }
}
