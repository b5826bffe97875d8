//! Bounded retry with exponential backoff for transient generation failures.

use std::future::Future;
use std::time::Duration;

use webrag_shared::GenerationError;

const BASE_BACKOFF_MS: u64 = 500;
const MAX_BACKOFF_SHIFT: u32 = 6;
/// Upper bound on a server-requested `Retry-After` wait.
const MAX_RETRY_AFTER: Duration = Duration::from_secs(60);

/// A failed attempt, with the server's requested wait if it sent one.
#[derive(Debug)]
pub(crate) struct AttemptError {
    pub error: GenerationError,
    pub retry_after: Option<Duration>,
}

impl From<GenerationError> for AttemptError {
    fn from(error: GenerationError) -> Self {
        Self {
            error,
            retry_after: None,
        }
    }
}

/// Parse a `Retry-After` header given in whole seconds.
pub(crate) fn retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    headers
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

/// Wait before retry number `attempt + 1`: the server's hint (clamped to
/// [`MAX_RETRY_AFTER`]), else exponential backoff.
pub(crate) fn retry_delay(hint: Option<Duration>, attempt: u32) -> Duration {
    match hint {
        Some(hint) => hint.min(MAX_RETRY_AFTER),
        None => Duration::from_millis(BASE_BACKOFF_MS << attempt.min(MAX_BACKOFF_SHIFT)),
    }
}

/// Run `f`, retrying transient failures up to `max_retries` times.
///
/// Non-transient errors and the last transient error are returned as-is.
pub(crate) async fn with_retry<T, F, Fut>(max_retries: u32, mut f: F) -> Result<T, GenerationError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, AttemptError>>,
{
    let mut attempt = 0;
    loop {
        match f().await {
            Ok(value) => return Ok(value),
            Err(failed) if attempt < max_retries && failed.error.is_transient() => {
                let delay = retry_delay(failed.retry_after, attempt);
                tracing::warn!(
                    error = %failed.error,
                    attempt = attempt + 1,
                    max_retries,
                    delay_ms = delay.as_millis() as u64,
                    "transient generation failure, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(failed) => return Err(failed.error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn backoff_doubles_and_is_capped() {
        assert_eq!(retry_delay(None, 0), Duration::from_millis(500));
        assert_eq!(retry_delay(None, 1), Duration::from_millis(1000));
        assert_eq!(retry_delay(None, 2), Duration::from_millis(2000));
        assert_eq!(retry_delay(None, 40), retry_delay(None, MAX_BACKOFF_SHIFT));
    }

    #[test]
    fn server_hint_wins() {
        assert_eq!(
            retry_delay(Some(Duration::from_secs(7)), 3),
            Duration::from_secs(7)
        );
    }

    #[test]
    fn server_hint_is_clamped() {
        assert_eq!(
            retry_delay(Some(Duration::from_secs(86_400)), 0),
            MAX_RETRY_AFTER
        );
        assert!(MAX_RETRY_AFTER >= retry_delay(None, MAX_BACKOFF_SHIFT));
    }

    #[test]
    fn parses_retry_after_seconds() {
        let mut headers = reqwest::header::HeaderMap::new();
        assert_eq!(retry_after(&headers), None);

        headers.insert(reqwest::header::RETRY_AFTER, "3".parse().unwrap());
        assert_eq!(retry_after(&headers), Some(Duration::from_secs(3)));

        headers.insert(
            reqwest::header::RETRY_AFTER,
            "Wed, 21 Oct 2015 07:28:00 GMT".parse().unwrap(),
        );
        assert_eq!(retry_after(&headers), None);
    }

    #[tokio::test]
    async fn no_retry_when_disabled() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_retry(0, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(AttemptError::from(GenerationError::RateLimited)) }
        })
        .await;

        assert_eq!(result, Err(GenerationError::RateLimited));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_retry(3, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(AttemptError::from(GenerationError::Unauthorized { status: 401 })) }
        })
        .await;

        assert_eq!(result, Err(GenerationError::Unauthorized { status: 401 }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn transient_errors_retry_until_success() {
        let calls = AtomicU32::new(0);
        let result = with_retry(2, || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    Err(AttemptError {
                        error: GenerationError::RateLimited,
                        retry_after: Some(Duration::ZERO),
                    })
                } else {
                    Ok(n)
                }
            }
        })
        .await;

        assert_eq!(result, Ok(1));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
