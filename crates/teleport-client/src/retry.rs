use std::time::Duration;

use rand::Rng;
use tracing::warn;

use crate::error::ClientError;

/// Header carrying a server-supplied retry delay on 429 responses.
pub const RETRY_AFTER_HEADER: &str = "X-Rate-Limit-Retry-After-Seconds";

/// A 429 whose body carries this marker is a concurrency limit, not a rate
/// limit; it is retried after a uniform random delay in [0, 10) seconds so
/// that colliding agents de-synchronize.
pub const CONCURRENT_429_MARKER: &str = "Too many concurrent requests";

const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(2);
const MAX_RETRY_AFTER: Duration = Duration::from_secs(60);
const CONCURRENT_RETRY_SPREAD_SECS: f64 = 10.0;

/// Outcome of a single attempt inside [`with_retry`].
pub enum Attempt<T> {
    Done(T),
    /// Try again. `delay: None` falls back to the policy schedule.
    Retry {
        delay: Option<Duration>,
        reason: String,
    },
    /// Permanent failure; no further attempts.
    Fail(ClientError),
}

/// Exponential backoff shared by every retryable control-plane call site.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// Schedule delay for a zero-based attempt index: 1 s, 2 s, 4 s, 8 s,
    /// 16 s, … capped at `max_delay`.
    pub fn delay_for(&self, attempt: usize) -> Duration {
        let factor = 1u32 << attempt.min(16) as u32;
        (self.base_delay * factor).min(self.max_delay)
    }
}

/// Run `op` until it reports `Done` or `Fail`, sleeping between attempts.
/// All waits go through the scheduler; the hosting task is never blocked.
pub async fn with_retry<T, F, Fut>(
    name: &'static str,
    policy: &RetryPolicy,
    mut op: F,
) -> Result<T, ClientError>
where
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = Attempt<T>>,
{
    for attempt in 0..policy.max_attempts {
        match op(attempt).await {
            Attempt::Done(value) => return Ok(value),
            Attempt::Fail(err) => return Err(err),
            Attempt::Retry { delay, reason } => {
                let wait = delay
                    .unwrap_or_else(|| policy.delay_for(attempt))
                    .min(policy.max_delay);
                warn!(
                    call = name,
                    attempt = attempt + 1,
                    delay_ms = wait.as_millis() as u64,
                    "retrying: {reason}"
                );
                tokio::time::sleep(wait).await;
            }
        }
    }
    Err(ClientError::RetriesExhausted {
        name,
        attempts: policy.max_attempts,
    })
}

/// Delay to apply for a 429 response, given the retry-after header value and
/// the response body.
pub fn delay_for_429(retry_after_secs: Option<i64>, body: &str) -> Duration {
    if body.contains(CONCURRENT_429_MARKER) {
        let secs = rand::thread_rng().gen_range(0.0..CONCURRENT_RETRY_SPREAD_SECS);
        return Duration::from_secs_f64(secs);
    }
    match retry_after_secs {
        Some(secs) if secs < 0 => DEFAULT_RETRY_AFTER,
        Some(secs) => Duration::from_secs(secs as u64).min(MAX_RETRY_AFTER),
        None => DEFAULT_RETRY_AFTER,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn schedule_doubles_and_caps() {
        let policy = RetryPolicy::default();
        let delays: Vec<u64> = (0..5).map(|n| policy.delay_for(n).as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16]);
        assert_eq!(policy.delay_for(10).as_secs(), 60);
    }

    #[test]
    fn negative_retry_after_uses_default() {
        assert_eq!(delay_for_429(Some(-1), ""), Duration::from_secs(2));
    }

    #[test]
    fn excessive_retry_after_is_capped() {
        assert_eq!(delay_for_429(Some(9999), ""), Duration::from_secs(60));
    }

    #[test]
    fn valid_retry_after_is_honored() {
        assert_eq!(delay_for_429(Some(5), ""), Duration::from_secs(5));
    }

    #[test]
    fn concurrent_marker_yields_bounded_random_delay() {
        for _ in 0..100 {
            let delay = delay_for_429(Some(30), "Too many concurrent requests");
            assert!(delay < Duration::from_secs(10));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_transient_attempts() {
        let calls = AtomicUsize::new(0);
        let result = with_retry("test", &RetryPolicy::default(), |_| {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Attempt::Retry {
                        delay: None,
                        reason: "transient".into(),
                    }
                } else {
                    Attempt::Done(n)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausts_after_max_attempts() {
        let policy = RetryPolicy {
            max_attempts: 3,
            ..Default::default()
        };
        let result: Result<(), _> = with_retry("test", &policy, |_| async {
            Attempt::Retry {
                delay: Some(Duration::from_millis(1)),
                reason: "always busy".into(),
            }
        })
        .await;
        assert!(matches!(
            result.unwrap_err(),
            ClientError::RetriesExhausted { attempts: 3, .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_failure_stops_immediately() {
        let calls = AtomicUsize::new(0);
        let result: Result<(), _> = with_retry("test", &RetryPolicy::default(), |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async {
                Attempt::Fail(ClientError::Status {
                    endpoint: "put-result",
                    status: 400,
                    body: String::new(),
                })
            }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
