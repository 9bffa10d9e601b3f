//! Error classification and per-class exponential backoff
//!
//! | Class | Trigger | Growth | Cap |
//! |-------|---------|--------|-----|
//! | Network | no response received | 2^n | 30s |
//! | RateLimit | HTTP 429 | 3^n | 60s |
//! | ServerError | HTTP 5xx | 1.5^n | 15s |
//! | ParseError | malformed structured payload | 2^n | 20s |
//! | Unknown | anything else | 2^n | 20s |
//!
//! The policy only computes delays and re-raises. Turning an exhausted job
//! into a tracked failure is the caller's job.

use crate::crawler::FetchError;
use std::fmt;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

/// Failure category driving the backoff curve
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    Network,
    RateLimit,
    ServerError,
    ParseError,
    Unknown,
}

impl ErrorClass {
    /// Growth factor and ceiling of this class's backoff curve
    fn backoff(&self) -> (f64, Duration) {
        match self {
            Self::Network => (2.0, Duration::from_secs(30)),
            Self::RateLimit => (3.0, Duration::from_secs(60)),
            Self::ServerError => (1.5, Duration::from_secs(15)),
            Self::ParseError | Self::Unknown => (2.0, Duration::from_secs(20)),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Network => "NETWORK",
            Self::RateLimit => "RATE_LIMIT",
            Self::ServerError => "SERVER_ERROR",
            Self::ParseError => "PARSE_ERROR",
            Self::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classifies a structured fetch failure
///
/// Connectivity wins over any status, then 429, then 5xx, then a malformed
/// payload.
pub fn classify(error: &FetchError) -> ErrorClass {
    if error.connectivity {
        return ErrorClass::Network;
    }
    match error.status {
        Some(429) => ErrorClass::RateLimit,
        Some(status) if status >= 500 => ErrorClass::ServerError,
        _ if error.malformed => ErrorClass::ParseError,
        _ => ErrorClass::Unknown,
    }
}

/// A fetch failure that exhausted its retry budget
#[derive(Debug, Clone, Error)]
#[error("{class} after {attempts} attempt(s): {source}")]
pub struct ClassifiedError {
    pub class: ErrorClass,
    pub attempts: u32,
    pub source: FetchError,
}

/// Attempt budget plus the base of every backoff curve
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including the first)
    pub attempts: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn new(attempts: u32, base_delay: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            base_delay,
        }
    }

    /// Delay after the failed attempt `attempt` (0-based) of class `class`
    pub fn delay_for(&self, class: ErrorClass, attempt: u32) -> Duration {
        let (factor, cap) = class.backoff();
        let millis = self.base_delay.as_millis() as f64 * factor.powi(attempt as i32);
        let capped = millis.min(cap.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }
}

/// Runs `op` until it succeeds or the attempt budget is spent
///
/// No delay follows the final attempt. The returned error carries the class
/// of the last failure and the number of attempts made.
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    context: &str,
    mut op: F,
) -> Result<T, ClassifiedError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, FetchError>>,
{
    let mut attempt = 0;
    loop {
        let error = match op().await {
            Ok(value) => return Ok(value),
            Err(error) => error,
        };

        let class = classify(&error);
        attempt += 1;

        if attempt >= policy.attempts {
            tracing::warn!(
                context,
                class = %class,
                attempt,
                "Giving up: {}",
                error
            );
            return Err(ClassifiedError {
                class,
                attempts: attempt,
                source: error,
            });
        }

        let delay = policy.delay_for(class, attempt - 1);
        tracing::warn!(
            context,
            class = %class,
            attempt,
            delay_ms = delay.as_millis() as u64,
            "Attempt failed, retrying: {}",
            error
        );
        tokio::time::sleep(delay).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn status(code: u16) -> FetchError {
        FetchError::status(code, format!("HTTP {}", code))
    }

    #[test]
    fn test_classify() {
        assert_eq!(classify(&FetchError::connectivity("refused")), ErrorClass::Network);
        assert_eq!(classify(&status(429)), ErrorClass::RateLimit);
        assert_eq!(classify(&status(500)), ErrorClass::ServerError);
        assert_eq!(classify(&status(503)), ErrorClass::ServerError);
        assert_eq!(classify(&FetchError::malformed("bad json")), ErrorClass::ParseError);
        assert_eq!(classify(&status(404)), ErrorClass::Unknown);
    }

    #[test]
    fn test_connectivity_wins_over_status() {
        let mut error = status(503);
        error.connectivity = true;
        assert_eq!(classify(&error), ErrorClass::Network);
    }

    #[test]
    fn test_delay_curves() {
        let policy = RetryPolicy::new(3, Duration::from_millis(1000));

        assert_eq!(policy.delay_for(ErrorClass::Network, 0), Duration::from_millis(1000));
        assert_eq!(policy.delay_for(ErrorClass::Network, 2), Duration::from_millis(4000));
        assert_eq!(policy.delay_for(ErrorClass::RateLimit, 2), Duration::from_millis(9000));
        assert_eq!(policy.delay_for(ErrorClass::ServerError, 1), Duration::from_millis(1500));
    }

    #[test]
    fn test_delays_capped_and_non_decreasing() {
        let policy = RetryPolicy::new(20, Duration::from_millis(1000));

        for class in [
            ErrorClass::Network,
            ErrorClass::RateLimit,
            ErrorClass::ServerError,
            ErrorClass::ParseError,
            ErrorClass::Unknown,
        ] {
            let delays: Vec<Duration> = (0..12).map(|a| policy.delay_for(class, a)).collect();
            assert!(delays.windows(2).all(|w| w[0] <= w[1]), "{} not monotonic", class);
            assert_eq!(*delays.last().unwrap(), class.backoff().1);
        }
    }

    #[tokio::test]
    async fn test_with_retry_exhausts_budget() {
        let policy = RetryPolicy::new(3, Duration::from_millis(1));
        let calls = AtomicU32::new(0);

        let result: Result<(), ClassifiedError> = with_retry(&policy, "item 4", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(status(500)) }
        })
        .await;

        let error = result.unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(error.attempts, 3);
        assert_eq!(error.class, ErrorClass::ServerError);
    }

    #[tokio::test]
    async fn test_with_retry_recovers() {
        let policy = RetryPolicy::new(3, Duration::from_millis(1));
        let calls = AtomicU32::new(0);

        let result = with_retry(&policy, "item 1", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    Err(FetchError::connectivity("reset"))
                } else {
                    Ok(n)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
