use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

use teleport_model::SharedConfig;

/// Timestamps the fetcher and workers write and the watchdog reads. A
/// timestamp that was never set counts as "elapsed = process uptime", so a
/// young process is not immediately considered stale.
pub struct Liveness {
    started_at: Instant,
    last_get_task: Mutex<Option<Instant>>,
    last_task_received: Mutex<Option<Instant>>,
    last_task_completed: Mutex<Option<Instant>>,
}

impl Liveness {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            last_get_task: Mutex::new(None),
            last_task_received: Mutex::new(None),
            last_task_completed: Mutex::new(None),
        }
    }

    pub fn get_task_called(&self) {
        *self.last_get_task.lock().expect("liveness lock poisoned") = Some(Instant::now());
    }

    pub fn task_received(&self) {
        *self
            .last_task_received
            .lock()
            .expect("liveness lock poisoned") = Some(Instant::now());
    }

    pub fn task_completed(&self) {
        *self
            .last_task_completed
            .lock()
            .expect("liveness lock poisoned") = Some(Instant::now());
    }

    pub fn since_get_task(&self) -> Duration {
        Self::elapsed_or_uptime(&self.last_get_task, self.started_at)
    }

    pub fn since_task_received(&self) -> Duration {
        Self::elapsed_or_uptime(&self.last_task_received, self.started_at)
    }

    pub fn since_task_completed(&self) -> Duration {
        Self::elapsed_or_uptime(&self.last_task_completed, self.started_at)
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Stamp everything to now. Called after a restart so it does not
    /// immediately re-trigger.
    pub fn reset_to_now(&self) {
        let now = Instant::now();
        *self.last_get_task.lock().expect("liveness lock poisoned") = Some(now);
        *self
            .last_task_received
            .lock()
            .expect("liveness lock poisoned") = Some(now);
        *self
            .last_task_completed
            .lock()
            .expect("liveness lock poisoned") = Some(now);
    }

    fn elapsed_or_uptime(slot: &Mutex<Option<Instant>>, started_at: Instant) -> Duration {
        match *slot.lock().expect("liveness lock poisoned") {
            Some(instant) => instant.elapsed(),
            None => started_at.elapsed(),
        }
    }
}

impl Default for Liveness {
    fn default() -> Self {
        Self::new()
    }
}

/// Health predicate over the liveness signals. The process is stalled only
/// when *both* the get-task and the task-received thresholds have elapsed.
pub struct Watchdog {
    liveness: std::sync::Arc<Liveness>,
    config: SharedConfig,
}

impl Watchdog {
    pub fn new(liveness: std::sync::Arc<Liveness>, config: SharedConfig) -> Self {
        Self { liveness, config }
    }

    pub fn is_stalled(&self) -> bool {
        let cfg = self.config.snapshot();
        let get_task_stale =
            self.liveness.since_get_task() > Duration::from_secs(cfg.get_task_stale_threshold);
        let received_stale = self.liveness.since_task_received()
            > Duration::from_secs(cfg.task_received_stale_threshold);
        get_task_stale && received_stale
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use teleport_model::RuntimeConfig;

    fn watchdog(get_task_secs: u64, received_secs: u64) -> (Arc<Liveness>, Watchdog) {
        let mut cfg = RuntimeConfig::new("http://cp", "key");
        cfg.get_task_stale_threshold = get_task_secs;
        cfg.task_received_stale_threshold = received_secs;
        let liveness = Arc::new(Liveness::new());
        let dog = Watchdog::new(Arc::clone(&liveness), SharedConfig::new(cfg));
        (liveness, dog)
    }

    #[tokio::test(start_paused = true)]
    async fn young_process_is_healthy() {
        let (_liveness, dog) = watchdog(3600, 43200);
        assert!(!dog.is_stalled());
    }

    #[tokio::test(start_paused = true)]
    async fn never_set_timestamps_count_from_start() {
        let (_liveness, dog) = watchdog(60, 120);
        tokio::time::advance(Duration::from_secs(121)).await;
        assert!(dog.is_stalled());
    }

    #[tokio::test(start_paused = true)]
    async fn one_fresh_signal_keeps_the_process_healthy() {
        let (liveness, dog) = watchdog(60, 120);
        tokio::time::advance(Duration::from_secs(121)).await;
        liveness.get_task_called();
        // get-task is fresh, so the conjunction fails.
        assert!(!dog.is_stalled());
    }

    #[tokio::test(start_paused = true)]
    async fn reset_clears_the_stall() {
        let (liveness, dog) = watchdog(60, 120);
        tokio::time::advance(Duration::from_secs(200)).await;
        assert!(dog.is_stalled());

        liveness.reset_to_now();
        assert!(!dog.is_stalled());
        assert!(liveness.since_get_task() < Duration::from_secs(1));
    }
}
