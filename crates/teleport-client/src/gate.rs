use std::collections::VecDeque;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tracing::debug;

use crate::error::ClientError;

/// How often a blocked caller re-checks the sliding window.
const THROTTLE_POLL: Duration = Duration::from_millis(500);

/// Hard ceiling on concurrent in-flight control-plane calls, across the
/// whole process. Matches the server-side concurrent-request limit.
const CEILING_PERMITS: usize = 2;

/// How long an admission may wait on the concurrency ceiling before giving
/// up; guarantees a release path even when an HTTP call hangs.
const CEILING_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(60);

/// Sliding-window throttle over outbound control-plane calls.
///
/// `allow` is non-blocking; `throttle` polls it, yielding between tries.
/// Limits can be rewritten at runtime (`rateLimitPerMin` from
/// `globalConfig`) and the window is cleared on watchdog restart.
pub struct RateLimiter {
    inner: Mutex<WindowState>,
}

struct WindowState {
    request_limit: usize,
    time_window: Duration,
    admissions: VecDeque<Instant>,
}

impl RateLimiter {
    pub fn new(request_limit: usize, time_window: Duration) -> Self {
        Self {
            inner: Mutex::new(WindowState {
                request_limit,
                time_window,
                admissions: VecDeque::new(),
            }),
        }
    }

    /// Try to admit one call now. Records the admission on success.
    pub fn allow(&self) -> bool {
        let mut state = self.inner.lock().expect("rate limiter lock poisoned");
        let now = Instant::now();

        while let Some(&oldest) = state.admissions.front() {
            if now.duration_since(oldest) >= state.time_window {
                state.admissions.pop_front();
            } else {
                break;
            }
        }

        if state.admissions.len() < state.request_limit {
            state.admissions.push_back(now);
            true
        } else {
            false
        }
    }

    /// Wait until the window admits a call. Never busy-spins.
    pub async fn throttle(&self) {
        while !self.allow() {
            tokio::time::sleep(THROTTLE_POLL).await;
        }
    }

    pub fn set_limits(&self, request_limit: usize, time_window: Duration) {
        let mut state = self.inner.lock().expect("rate limiter lock poisoned");
        state.request_limit = request_limit;
        state.time_window = time_window;
    }

    /// Forget all recorded admissions.
    pub fn reset(&self) {
        let mut state = self.inner.lock().expect("rate limiter lock poisoned");
        state.admissions.clear();
    }
}

/// Control-plane admission in one place: the sliding window plus the small semaphore that caps
/// in-flight control-plane calls. Every outbound control-plane call passes
/// through `admit` and holds the returned permit for the duration.
pub struct CallGate {
    limiter: RateLimiter,
    ceiling: RwLock<Arc<Semaphore>>,
    acquire_timeout: Duration,
}

impl CallGate {
    /// Startup defaults: 25 admissions per 15 s, ceiling of 2.
    pub fn new() -> Self {
        Self::with_acquire_timeout(CEILING_ACQUIRE_TIMEOUT)
    }

    pub fn with_acquire_timeout(acquire_timeout: Duration) -> Self {
        Self {
            limiter: RateLimiter::new(25, Duration::from_secs(15)),
            ceiling: RwLock::new(Arc::new(Semaphore::new(CEILING_PERMITS))),
            acquire_timeout,
        }
    }

    /// Wait for the sliding window, then for a ceiling permit. The permit
    /// must be held for the lifetime of the HTTP call.
    pub async fn admit(&self) -> Result<OwnedSemaphorePermit, ClientError> {
        self.limiter.throttle().await;
        let sem = Arc::clone(&self.ceiling.read().expect("gate lock poisoned"));
        match tokio::time::timeout(self.acquire_timeout, sem.acquire_owned()).await {
            Ok(Ok(permit)) => Ok(permit),
            // A closed or timed-out semaphore both mean the call must not
            // proceed; the caller surfaces this as a transient failure.
            Ok(Err(_)) | Err(_) => Err(ClientError::GateTimeout),
        }
    }

    pub fn set_rate_per_min(&self, request_limit: u32) {
        self.limiter
            .set_limits(request_limit as usize, Duration::from_secs(60));
    }

    /// Clear the window and replace the ceiling. Permits held against the
    /// old semaphore die with it; in-flight calls are unaffected.
    pub fn reset(&self) {
        self.limiter.reset();
        let mut ceiling = self.ceiling.write().expect("gate lock poisoned");
        *ceiling = Arc::new(Semaphore::new(CEILING_PERMITS));
        debug!("call gate reset");
    }
}

impl Default for CallGate {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn window_admits_up_to_limit() {
        let limiter = RateLimiter::new(2, Duration::from_secs(15));
        assert!(limiter.allow());
        assert!(limiter.allow());
        assert!(!limiter.allow());
    }

    #[tokio::test(start_paused = true)]
    async fn window_slides_over_time() {
        let limiter = RateLimiter::new(1, Duration::from_secs(15));
        assert!(limiter.allow());
        assert!(!limiter.allow());

        tokio::time::advance(Duration::from_secs(16)).await;
        assert!(limiter.allow());
    }

    #[tokio::test(start_paused = true)]
    async fn reset_clears_admissions() {
        let limiter = RateLimiter::new(1, Duration::from_secs(60));
        assert!(limiter.allow());
        assert!(!limiter.allow());
        limiter.reset();
        assert!(limiter.allow());
    }

    #[tokio::test(start_paused = true)]
    async fn throttle_waits_for_a_free_slot() {
        let limiter = RateLimiter::new(1, Duration::from_secs(1));
        assert!(limiter.allow());

        let start = Instant::now();
        limiter.throttle().await;
        assert!(start.elapsed() >= Duration::from_millis(500));
    }

    #[tokio::test(start_paused = true)]
    async fn ceiling_caps_concurrent_permits() {
        let gate = CallGate::with_acquire_timeout(Duration::from_millis(100));
        let _a = gate.admit().await.unwrap();
        let _b = gate.admit().await.unwrap();

        let err = gate.admit().await.unwrap_err();
        assert!(matches!(err, ClientError::GateTimeout));
    }

    #[tokio::test(start_paused = true)]
    async fn reset_restores_ceiling_capacity() {
        let gate = CallGate::with_acquire_timeout(Duration::from_millis(100));
        let _a = gate.admit().await.unwrap();
        let _b = gate.admit().await.unwrap();

        gate.reset();
        // Old permits are still held but belong to the retired semaphore.
        let _c = gate.admit().await.unwrap();
        let _d = gate.admit().await.unwrap();
    }
}
