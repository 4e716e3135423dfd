//! Retry discipline shared by every flaky step in the protocol.
//!
//! One loop, one classification rule: transient errors (see
//! `HarvestError::is_transient`) are retried with a jittered delay, terminal
//! errors abort immediately, and exhaustion is reported as its own error
//! carrying the final attempt's failure.

use std::future::Future;
use std::time::Duration;

use rand::distr::{Distribution, Uniform};
use tracing::{debug, warn};

use crate::core::error::{HarvestError, Result};

/// Attempt budget and delay shape for one retried step.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts, first try included. Must be at least 1.
    pub max_attempts: u32,
    /// Flat delay between attempts.
    pub base_delay: Duration,
    /// Upper bound of the uniform random jitter added to each delay. Zero
    /// disables jitter.
    pub max_jitter: Duration,
}

impl RetryPolicy {
    pub const fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_jitter: Duration::ZERO,
        }
    }

    pub const fn with_jitter(mut self, max_jitter: Duration) -> Self {
        self.max_jitter = max_jitter;
        self
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(1))
    }
}

/// Run `op` until it succeeds, fails terminally, or the budget runs out.
///
/// `label` names the step in logs. Exhaustion returns
/// [`HarvestError::RetriesExhausted`] wrapping the last attempt's error.
pub async fn retry<T, F, Fut>(policy: RetryPolicy, label: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let attempts = policy.max_attempts.max(1);
    let mut last_err: Option<HarvestError> = None;

    for attempt in 1..=attempts {
        match op().await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(label, attempt, "step succeeded after retry");
                }
                return Ok(value);
            }
            Err(e) if e.is_transient() && attempt < attempts => {
                warn!(label, attempt, error = %e, "transient failure, will retry");
                let delay = jittered_delay(&policy);
                tokio::time::sleep(delay).await;
                last_err = Some(e);
            }
            Err(e) if e.is_transient() => {
                last_err = Some(e);
            }
            Err(e) => return Err(e),
        }
    }

    Err(HarvestError::RetriesExhausted {
        attempts,
        source: Box::new(last_err.unwrap_or_else(|| {
            HarvestError::TransientUi("retry loop exhausted with no recorded error".into())
        })),
    })
}

fn jittered_delay(policy: &RetryPolicy) -> Duration {
    if policy.max_jitter.is_zero() {
        return policy.base_delay;
    }
    // Sample before any await so the RNG never crosses a suspension point.
    let jitter_ms = {
        let mut rng = rand::rng();
        let dist = Uniform::new(0, policy.max_jitter.as_millis() as u64 + 1).unwrap();
        dist.sample(&mut rng)
    };
    policy.base_delay + Duration::from_millis(jitter_ms)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn transient_failures_consume_the_whole_budget() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(4, Duration::from_secs(1));
        let err = retry(policy, "always-flaky", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(HarvestError::TransientUi("nope".into())) }
        })
        .await
        .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 4);
        match err {
            HarvestError::RetriesExhausted { attempts, source } => {
                assert_eq!(attempts, 4);
                assert!(matches!(*source, HarvestError::TransientUi(_)));
            }
            other => panic!("expected RetriesExhausted, got {other}"),
        }
    }

    #[tokio::test]
    async fn terminal_errors_abort_on_first_attempt() {
        let calls = AtomicU32::new(0);
        let err = retry(RetryPolicy::default(), "bad-creds", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async {
                Err::<(), _>(HarvestError::InvalidCredentials {
                    service: "roster".into(),
                })
            }
        })
        .await
        .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(err, HarvestError::InvalidCredentials { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_partway_through_the_budget() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(5, Duration::from_millis(200));
        let value = retry(policy, "eventually", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(HarvestError::TransientUi("rendering".into()))
                } else {
                    Ok(42)
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(value, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let policy =
            RetryPolicy::new(3, Duration::from_secs(1)).with_jitter(Duration::from_millis(500));
        for _ in 0..50 {
            let d = jittered_delay(&policy);
            assert!(d >= Duration::from_secs(1));
            assert!(d <= Duration::from_millis(1500));
        }
        let flat = RetryPolicy::new(3, Duration::from_secs(2));
        assert_eq!(jittered_delay(&flat), Duration::from_secs(2));
    }
}
