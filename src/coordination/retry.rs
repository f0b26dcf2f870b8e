//! Retry, backoff and error classification for external calls
//!
//! Every call to a chain node, the bridge aggregator or the exchange goes
//! through [`RetryExecutor::execute`]. Failures are classified by
//! [`LpFlowError::class`]:
//! - retryable (network, timeout, rate-limit, stale nonce) back off and retry
//! - fatal errors propagate on the first occurrence
//! - unclassified errors retry only when the policy allows it
//!
//! A rate-limit carrying a server wait uses that wait instead of the computed
//! backoff. When the attempt budget runs out the last error is returned as is.

use rand::Rng;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

use super::throttle::{EndpointClass, Throttle};
use crate::config::RetryConfig;
use crate::error::{ErrorClass, LpFlowError, Result};

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Extra random delay as a fraction of the backoff
    pub jitter: f64,
    pub retry_unclassified: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            jitter: config.jitter.clamp(0.0, 1.0),
            retry_unclassified: config.retry_unclassified,
        }
    }

    /// Single attempt, no retries
    pub fn once() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn should_retry(&self, err: &LpFlowError) -> bool {
        match err.class() {
            ErrorClass::Retryable => true,
            ErrorClass::Unclassified => self.retry_unclassified,
            ErrorClass::Fatal => false,
        }
    }

    /// Exponential backoff for the given 1-based attempt, with jitter, capped
    pub fn backoff<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        let base = self
            .base_delay
            .checked_mul(1u32 << exp)
            .unwrap_or(self.max_delay)
            .min(self.max_delay);

        let jitter = if self.jitter > 0.0 {
            base.mul_f64(rng.gen_range(0.0..=self.jitter))
        } else {
            Duration::ZERO
        };

        (base + jitter).min(self.max_delay)
    }

    /// Delay before the next attempt; a server-specified wait wins
    pub fn delay_for<R: Rng + ?Sized>(
        &self,
        err: &LpFlowError,
        attempt: u32,
        rng: &mut R,
    ) -> Duration {
        err.retry_after().unwrap_or_else(|| self.backoff(attempt, rng))
    }
}

/// Runs operations under a retry policy and the shared throttle
pub struct RetryExecutor {
    policy: RetryPolicy,
    throttle: Arc<Throttle>,
}

impl RetryExecutor {
    pub fn new(policy: RetryPolicy, throttle: Arc<Throttle>) -> Self {
        Self { policy, throttle }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn throttle(&self) -> &Arc<Throttle> {
        &self.throttle
    }

    /// Execute with the default policy
    pub async fn execute<T, F, Fut>(&self, label: &str, class: EndpointClass, op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.execute_with(&self.policy, label, class, op).await
    }

    /// Execute with an explicit policy
    pub async fn execute_with<T, F, Fut>(
        &self,
        policy: &RetryPolicy,
        label: &str,
        class: EndpointClass,
        mut op: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            self.throttle.acquire(class).await;

            match op().await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(op = label, attempt, "succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(err) => {
                    if !policy.should_retry(&err) {
                        debug!(op = label, error = %err, "not retrying");
                        return Err(err);
                    }
                    if attempt >= policy.max_attempts {
                        warn!(
                            op = label,
                            attempts = attempt,
                            error = %err,
                            "retry budget exhausted"
                        );
                        return Err(err);
                    }

                    let delay = policy.delay_for(&err, attempt, &mut rand::thread_rng());
                    warn!(
                        op = label,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "attempt failed, retrying"
                    );
                    sleep(delay).await;
                }
            }
        }
    }
}
