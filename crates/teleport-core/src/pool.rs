use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::{Semaphore, mpsc, oneshot};
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use teleport_model::Task;
use teleport_observe::MetricsSink;

use crate::executor::{Executor, effective_deadline};
use crate::uploader::ResultUploader;
use crate::watchdog::Liveness;

/// Extra headroom the worker-side deadline gets over the target read
/// timeout, so a clean read-timeout error surfaces before the worker is
/// cut off.
const WORKER_DEADLINE_GRACE: Duration = Duration::from_secs(30);

/// Resizable worker-slot source. `globalConfig.poolSize` swaps in a fresh
/// semaphore; in-flight workers keep permits of the retired one, which dies
/// once they finish.
#[derive(Clone)]
pub struct PoolSlots {
    sem: Arc<RwLock<Arc<Semaphore>>>,
    size: Arc<AtomicUsize>,
}

impl PoolSlots {
    pub fn new(size: usize) -> Self {
        Self {
            sem: Arc::new(RwLock::new(Arc::new(Semaphore::new(size.max(1))))),
            size: Arc::new(AtomicUsize::new(size.max(1))),
        }
    }

    pub fn semaphore(&self) -> Arc<Semaphore> {
        Arc::clone(&self.sem.read().expect("pool slots lock poisoned"))
    }

    pub fn size(&self) -> usize {
        self.size.load(Ordering::Relaxed)
    }

    pub fn resize(&self, size: usize) {
        let size = size.max(1);
        if self.size.swap(size, Ordering::Relaxed) != size {
            *self.sem.write().expect("pool slots lock poisoned") = Arc::new(Semaphore::new(size));
            info!(size, "worker pool resized");
        }
    }
}

struct InFlight {
    task_id: String,
    started_at: Instant,
    deadline_at: Instant,
    abort: AbortHandle,
}

/// Registry of running executions, keyed by a monotonic id. The watchdog
/// sweeps it every tick and forcibly terminates anything past its deadline.
pub struct ExecRegistry {
    inner: Mutex<HashMap<u64, InFlight>>,
    next_id: AtomicU64,
}

impl ExecRegistry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    fn register(&self, task_id: String, deadline_at: Instant, abort: AbortHandle) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.lock().expect("registry lock poisoned").insert(
            id,
            InFlight {
                task_id,
                started_at: Instant::now(),
                deadline_at,
                abort,
            },
        );
        id
    }

    fn complete(&self, id: u64) {
        self.inner.lock().expect("registry lock poisoned").remove(&id);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("registry lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Abort every execution past its deadline and reclaim the entries.
    /// Returns the task ids that were terminated.
    pub fn sweep_expired(&self) -> Vec<String> {
        let now = Instant::now();
        let mut inner = self.inner.lock().expect("registry lock poisoned");
        let expired: Vec<u64> = inner
            .iter()
            .filter(|(_, entry)| entry.deadline_at <= now)
            .map(|(id, _)| *id)
            .collect();
        expired
            .into_iter()
            .filter_map(|id| {
                inner.remove(&id).map(|entry| {
                    entry.abort.abort();
                    warn!(
                        task_id = %entry.task_id,
                        ran_for_secs = entry.started_at.elapsed().as_secs(),
                        "forcibly terminated execution past its deadline"
                    );
                    entry.task_id
                })
            })
            .collect()
    }

    /// Abort everything. Used on watchdog restart and final shutdown.
    pub fn abort_all(&self) -> usize {
        let mut inner = self.inner.lock().expect("registry lock poisoned");
        let count = inner.len();
        for (_, entry) in inner.drain() {
            entry.abort.abort();
        }
        count
    }
}

impl Default for ExecRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Fixed-size worker pool over the bounded task handoff. FIFO, no
/// priorities, no retries at this layer; a slot is held from spawn until
/// the worker posts its result (or is terminated).
pub struct WorkerPool {
    tasks: mpsc::Receiver<Task>,
    slots: PoolSlots,
    registry: Arc<ExecRegistry>,
    executor: Arc<Executor>,
    uploader: Arc<ResultUploader>,
    liveness: Arc<Liveness>,
    metrics: MetricsSink,
    cancel: CancellationToken,
}

impl WorkerPool {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        tasks: mpsc::Receiver<Task>,
        slots: PoolSlots,
        registry: Arc<ExecRegistry>,
        executor: Arc<Executor>,
        uploader: Arc<ResultUploader>,
        liveness: Arc<Liveness>,
        metrics: MetricsSink,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            tasks,
            slots,
            registry,
            executor,
            uploader,
            liveness,
            metrics,
            cancel,
        }
    }

    /// Consume the handoff until cancelled. Hands the receiver back so the
    /// caller can drain and count whatever was still queued.
    pub async fn run(mut self) -> mpsc::Receiver<Task> {
        loop {
            let task = tokio::select! {
                _ = self.cancel.cancelled() => break,
                maybe = self.tasks.recv() => match maybe {
                    Some(task) => task,
                    None => break,
                },
            };
            if !self.dispatch(task).await {
                break;
            }
        }
        self.tasks
    }

    /// Wait for a free slot and spawn the worker. Returns false when
    /// cancelled while waiting.
    async fn dispatch(&self, task: Task) -> bool {
        let sem = self.slots.semaphore();
        let permit = tokio::select! {
            _ = self.cancel.cancelled() => {
                warn!(task_id = %task.task_id, "dropping task: pool shutting down");
                return false;
            }
            acquired = sem.acquire_owned() => match acquired {
                Ok(permit) => permit,
                // The semaphore was swapped out by a resize; retry with the
                // current one on the next loop iteration.
                Err(_) => {
                    warn!(task_id = %task.task_id, "dropping task: pool slots closed");
                    return true;
                }
            },
        };

        let deadline = effective_deadline(task.expiry_ts_ms) + WORKER_DEADLINE_GRACE;
        let task_id = task.task_id.clone();
        let executor = Arc::clone(&self.executor);
        let uploader = Arc::clone(&self.uploader);
        let liveness = Arc::clone(&self.liveness);
        let metrics = self.metrics.clone();
        let registry = Arc::clone(&self.registry);

        let (id_tx, id_rx) = oneshot::channel();
        let handle = tokio::spawn(async move {
            let _permit = permit;
            let id = id_rx.await.unwrap_or_default();
            run_worker(executor, uploader, liveness, metrics, task, deadline).await;
            registry.complete(id);
        });
        let id = self
            .registry
            .register(task_id, Instant::now() + deadline, handle.abort_handle());
        let _ = id_tx.send(id);
        true
    }
}

/// Drive one task to its single posted result: normal execution, timeout,
/// or a synthesized agent-side error if the executor panics.
async fn run_worker(
    executor: Arc<Executor>,
    uploader: Arc<ResultUploader>,
    liveness: Arc<Liveness>,
    metrics: MetricsSink,
    task: Task,
    deadline: Duration,
) {
    let fallback = task.clone();
    let execution = std::panic::AssertUnwindSafe(executor.process(task)).catch_unwind();

    match tokio::time::timeout(deadline, execution).await {
        Ok(Ok(Some(result))) => {
            uploader.post_result(&result).await;
            metrics.record("task_completed", 1.0, &[("taskId", &result.task_id)]);
        }
        Ok(Ok(None)) => {
            metrics.record("task_completed", 1.0, &[("taskId", &fallback.task_id)]);
        }
        Ok(Err(_panic)) => {
            error!(task_id = %fallback.task_id, "worker panicked while processing task");
            let mut result = fallback.clone();
            result.set_agent_error("Error: worker panicked");
            uploader.post_result(&result).await;
            metrics.record("task_failed", 1.0, &[("taskId", &fallback.task_id)]);
        }
        Err(_elapsed) => {
            warn!(
                task_id = %fallback.task_id,
                deadline_secs = deadline.as_secs(),
                "task exceeded its deadline"
            );
            let mut result = fallback.clone();
            result.set_agent_error(format!(
                "Error: task deadline of {}s exceeded",
                deadline.as_secs()
            ));
            uploader.post_result(&result).await;
            metrics.record("task_timed_out", 1.0, &[("taskId", &fallback.task_id)]);
        }
    }
    liveness.task_completed();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn registry_sweeps_only_expired_entries() {
        let registry = ExecRegistry::new();
        let stuck = tokio::spawn(async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        });
        let fresh = tokio::spawn(async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        });

        registry.register(
            "expired".into(),
            Instant::now() + Duration::from_secs(1),
            stuck.abort_handle(),
        );
        registry.register(
            "running".into(),
            Instant::now() + Duration::from_secs(600),
            fresh.abort_handle(),
        );

        tokio::time::advance(Duration::from_secs(2)).await;
        let swept = registry.sweep_expired();
        assert_eq!(swept, vec!["expired".to_string()]);
        assert_eq!(registry.len(), 1);

        assert!(stuck.await.unwrap_err().is_cancelled());
        fresh.abort();
    }

    #[tokio::test]
    async fn abort_all_clears_the_registry() {
        let registry = ExecRegistry::new();
        let worker = tokio::spawn(async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        });
        registry.register(
            "t1".into(),
            Instant::now() + Duration::from_secs(600),
            worker.abort_handle(),
        );

        assert_eq!(registry.abort_all(), 1);
        assert!(registry.is_empty());
        assert!(worker.await.unwrap_err().is_cancelled());
    }

    #[test]
    fn resize_swaps_the_semaphore() {
        let slots = PoolSlots::new(2);
        let before = slots.semaphore();
        slots.resize(4);
        let after = slots.semaphore();
        assert_eq!(after.available_permits(), 4);
        assert!(!Arc::ptr_eq(&before, &after));
        assert_eq!(slots.size(), 4);
    }

    #[test]
    fn resize_to_same_size_is_a_no_op() {
        let slots = PoolSlots::new(2);
        let before = slots.semaphore();
        slots.resize(2);
        assert!(Arc::ptr_eq(&before, &slots.semaphore()));
    }
}
