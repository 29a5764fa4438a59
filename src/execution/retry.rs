use super::TradingError;
use crate::api::GatewayError;
use rand::Rng;
use std::future::Future;
use tokio::time::{sleep, Duration};

/// Exponential backoff with jitter and an attempt ceiling
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub max_attempts: u32,
    /// Upper bound of the random delay added to each backoff
    pub jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
            max_attempts: 8,
            jitter: Duration::from_millis(250),
        }
    }
}

impl RetryPolicy {
    /// Backoff before retry number `attempt` (1-based), without jitter
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2_u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }

    fn jittered(&self, attempt: u32) -> Duration {
        let jitter_ms = self.jitter.as_millis() as u64;
        let extra = if jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=jitter_ms)
        };
        self.backoff(attempt) + Duration::from_millis(extra)
    }

    /// Run `op` until it succeeds or the attempt ceiling is reached
    ///
    /// # Arguments
    /// * `operation` - Name used in logs and in the exhaustion error
    /// * `op` - Produces a fresh attempt each call
    pub async fn run<T, F, Fut>(&self, operation: &'static str, mut op: F) -> Result<T, TradingError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, GatewayError>>,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => {
                    if attempt > 1 {
                        tracing::info!("✓ {} succeeded after {} attempts", operation, attempt);
                    }
                    return Ok(value);
                }
                Err(e) if attempt >= self.max_attempts => {
                    tracing::error!(
                        "{} failed after {} attempts, giving up: {}",
                        operation,
                        attempt,
                        e
                    );
                    return Err(TradingError::RetriesExhausted {
                        operation,
                        attempts: attempt,
                        source: e,
                    });
                }
                Err(e) => {
                    let delay = self.jittered(attempt);
                    tracing::warn!(
                        "Attempt {}/{} of {} failed: {}. Retrying in {:?}...",
                        attempt,
                        self.max_attempts,
                        operation,
                        e,
                        delay
                    );
                    sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(1000),
            max_attempts,
            jitter: Duration::ZERO,
        }
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = policy(10);
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(4), Duration::from_millis(800));
        assert_eq!(policy.backoff(5), Duration::from_millis(1000));
        assert_eq!(policy.backoff(40), Duration::from_millis(1000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let result = policy(5)
            .run("submit order", || async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(GatewayError::Simulated("down".to_string()))
                } else {
                    Ok(42)
                }
            })
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_at_ceiling() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = policy(3)
            .run("cancel all orders", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(GatewayError::Simulated("down".to_string()))
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        match result {
            Err(TradingError::RetriesExhausted { operation, attempts, .. }) => {
                assert_eq!(operation, "cancel all orders");
                assert_eq!(attempts, 3);
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }
}
