use std::future::Future;
use std::time::Duration;

use rand::Rng;

use crate::error::Error;

/// Bounded exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub min_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            min_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Delay before the retry that follows `attempt` (1-indexed), without jitter.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.min_backoff
            .saturating_mul(1 << exponent)
            .min(self.max_backoff)
    }

    /// `backoff` plus up to half of `min_backoff` of random jitter.
    pub fn backoff_with_jitter(&self, attempt: u32) -> Duration {
        let jitter_ceiling = (self.min_backoff.as_millis() / 2) as u64;
        let jitter = if jitter_ceiling == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=jitter_ceiling)
        };

        self.backoff(attempt) + Duration::from_millis(jitter)
    }

    pub fn is_exhausted(&self, attempt: u32) -> bool {
        attempt >= self.max_attempts
    }
}

/// Runs `op` until it succeeds or the policy is exhausted, sleeping between attempts.
pub async fn with_backoff<T, F, Fut>(policy: &RetryPolicy, name: &str, mut op: F) -> Result<T, Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, Error>>,
{
    let mut attempt = 1;

    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if policy.is_exhausted(attempt) => {
                tracing::warn!(%err, attempt, "{} failed, retries exhausted", name);
                return Err(err);
            }
            Err(err) => {
                let delay = policy.backoff_with_jitter(attempt);
                tracing::warn!(%err, attempt, ?delay, "{} failed, retrying", name);
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

#[test]
fn backoff_doubles_until_capped() {
    let policy = RetryPolicy {
        max_attempts: 6,
        min_backoff: Duration::from_millis(100),
        max_backoff: Duration::from_millis(500),
    };

    assert_eq!(policy.backoff(1), Duration::from_millis(100));
    assert_eq!(policy.backoff(2), Duration::from_millis(200));
    assert_eq!(policy.backoff(3), Duration::from_millis(400));
    assert_eq!(policy.backoff(4), Duration::from_millis(500));
    assert_eq!(policy.backoff(40), Duration::from_millis(500));
}

#[test]
fn jitter_stays_within_half_the_base() {
    let policy = RetryPolicy {
        max_attempts: 3,
        min_backoff: Duration::from_millis(100),
        max_backoff: Duration::from_secs(1),
    };

    for _ in 0..50 {
        let delay = policy.backoff_with_jitter(2);
        assert!(delay >= Duration::from_millis(200));
        assert!(delay <= Duration::from_millis(250));
    }
}

#[test]
fn with_backoff_gives_up_after_max_attempts() {
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio_test::block_on;

    let policy = RetryPolicy {
        max_attempts: 3,
        min_backoff: Duration::from_millis(1),
        max_backoff: Duration::from_millis(2),
    };
    let calls = AtomicU32::new(0);

    let result: Result<(), Error> = block_on(with_backoff(&policy, "flaky", || {
        calls.fetch_add(1, Ordering::SeqCst);
        async { Err(crate::error::upstream_error()) }
    }));

    assert!(result.is_err());
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}
