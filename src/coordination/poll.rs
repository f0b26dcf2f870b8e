//! Bounded polling for conditions that settle off-process (bridge
//! deliveries, exchange withdrawals, balances, receipts)

use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use super::shutdown::CancelToken;
use crate::error::{LpFlowError, Result};

/// Fixed-interval wait with an upper bound
#[derive(Debug, Clone, Copy)]
pub struct PollSchedule {
    pub interval: Duration,
    pub max_wait: Duration,
}

impl PollSchedule {
    pub fn new(interval: Duration, max_wait: Duration) -> Self {
        Self { interval, max_wait }
    }
}

/// Call `check` until it yields a value.
///
/// The check runs at least once. Errors from the check propagate unchanged;
/// running past `max_wait` fails with [`LpFlowError::Timeout`] naming `what`.
pub async fn poll_until<T, F, Fut>(
    what: &str,
    schedule: PollSchedule,
    cancel: &CancelToken,
    mut check: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>>>,
{
    let deadline = Instant::now() + schedule.max_wait;
    let mut polls: u32 = 0;

    loop {
        cancel.check()?;
        polls += 1;

        if let Some(value) = check().await? {
            debug!(what, polls, "Condition settled");
            return Ok(value);
        }

        if Instant::now() >= deadline {
            return Err(LpFlowError::Timeout(format!(
                "{} timeout after {}s ({} polls)",
                what,
                schedule.max_wait.as_secs(),
                polls
            )));
        }
        cancel.sleep(schedule.interval).await?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::Shutdown;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast(max_wait_ms: u64) -> PollSchedule {
        PollSchedule::new(Duration::from_millis(2), Duration::from_millis(max_wait_ms))
    }

    #[tokio::test]
    async fn returns_once_the_check_settles() {
        let calls = AtomicU32::new(0);
        let value = poll_until("balance", fast(1_000), &CancelToken::never(), || async {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            Ok((n >= 3).then_some(n))
        })
        .await;

        let settled_on = tokio_test::assert_ok!(value);
        assert_eq!(settled_on, 3);
    }

    #[tokio::test]
    async fn times_out_with_a_descriptive_reason() {
        let never = CancelToken::never();
        let err = poll_until::<(), _, _>("bridge confirmation", fast(20), &never, || async {
            Ok(None)
        })
        .await
        .unwrap_err();

        assert!(matches!(err, LpFlowError::Timeout(_)));
        assert!(err.to_string().contains("bridge confirmation timeout"));
    }

    #[tokio::test]
    async fn check_errors_propagate() {
        let never = CancelToken::never();
        let err = poll_until::<(), _, _>("withdrawal", fast(1_000), &never, || async {
            Err(LpFlowError::TransferFailed("rejected".into()))
        })
        .await
        .unwrap_err();
        assert!(matches!(err, LpFlowError::TransferFailed(_)));
    }

    #[tokio::test]
    async fn cancellation_stops_the_wait() {
        let shutdown = Shutdown::new();
        let token = shutdown.token();
        shutdown.trigger();

        let err = poll_until::<(), _, _>("receipt", fast(1_000), &token, || async { Ok(None) })
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
    }
}
