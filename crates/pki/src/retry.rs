//! Bounded exponential backoff for calls made while a cluster is still coming up.

use std::time::Duration;

use rand::Rng;
use tracing::{error, warn};

/// Backoff policy for a retried call
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Total attempts including the first one
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
}

impl RetryConfig {
    /// Policy used while waiting on a freshly provisioned cluster:
    /// 5 attempts starting at 20s and doubling.
    #[must_use]
    pub fn cluster_backoff() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_secs(20),
            max_delay: Duration::from_secs(300),
            backoff_multiplier: 2.0,
        }
    }

    /// Millisecond delays, for tests
    #[must_use]
    pub fn fast(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            backoff_multiplier: 2.0,
        }
    }

    fn next_delay(&self, delay: Duration) -> Duration {
        Duration::from_secs_f64(
            (delay.as_secs_f64() * self.backoff_multiplier).min(self.max_delay.as_secs_f64()),
        )
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::cluster_backoff()
    }
}

/// Retries `operation` on every error until it succeeds or attempts run out.
pub async fn retry_with_backoff<F, Fut, T, E>(
    config: &RetryConfig,
    operation_name: &str,
    operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    retry_with_backoff_if(config, operation_name, |_| true, operation).await
}

/// Retries `operation` while `should_retry` accepts the error.
///
/// The last error is returned as is once attempts are exhausted or the
/// predicate rejects it.
pub async fn retry_with_backoff_if<F, Fut, T, E, P>(
    config: &RetryConfig,
    operation_name: &str,
    should_retry: P,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let mut delay = config.initial_delay;
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        let err = match operation().await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        if !should_retry(&err) {
            return Err(err);
        }
        if attempt >= config.max_attempts.max(1) {
            error!(
                operation = %operation_name,
                attempt,
                error = %err,
                "Giving up after retries"
            );
            return Err(err);
        }

        let jittered = Duration::from_secs_f64(
            delay.as_secs_f64() * rand::thread_rng().gen_range(0.5..1.5),
        );
        warn!(
            operation = %operation_name,
            attempt,
            error = %err,
            delay_ms = jittered.as_millis(),
            "Retrying"
        );
        tokio::time::sleep(jittered).await;
        delay = config.next_delay(delay);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_cluster_backoff_shape() {
        let config = RetryConfig::cluster_backoff();
        assert_eq!(config.max_attempts, 5);
        assert_eq!(config.initial_delay, Duration::from_secs(20));
        assert_eq!(config.next_delay(config.initial_delay), Duration::from_secs(40));
        assert_eq!(config.next_delay(Duration::from_secs(200)), Duration::from_secs(300));
    }

    #[tokio::test]
    async fn test_recovers_after_transient_errors() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&calls);

        let result: Result<&str, String> = retry_with_backoff(&RetryConfig::fast(5), "op", || {
            let c = Arc::clone(&c);
            async move {
                if c.fetch_add(1, Ordering::SeqCst) < 3 {
                    Err("not yet".to_string())
                } else {
                    Ok("done")
                }
            }
        })
        .await;

        assert_eq!(result, Ok("done"));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_returns_last_error_when_exhausted() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&calls);

        let result: Result<(), String> = retry_with_backoff(&RetryConfig::fast(3), "op", || {
            let n = c.fetch_add(1, Ordering::SeqCst);
            async move { Err(format!("attempt {n}")) }
        })
        .await;

        assert_eq!(result, Err("attempt 2".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_predicate_stops_retries() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&calls);

        let result: Result<(), &str> = retry_with_backoff_if(
            &RetryConfig::fast(5),
            "op",
            |e| *e == "not found",
            || {
                let n = c.fetch_add(1, Ordering::SeqCst);
                async move { if n == 0 { Err("not found") } else { Err("forbidden") } }
            },
        )
        .await;

        assert_eq!(result, Err("forbidden"));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
