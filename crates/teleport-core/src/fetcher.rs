use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use teleport_client::{ControlPlaneClient, FetchOutcome};
use teleport_model::{SharedConfig, Task};
use teleport_observe::MetricsSink;

use crate::error::CoreError;
use crate::watchdog::Liveness;

/// Authoritative outer deadline on one get-task poll. The HTTP client's own
/// 25 s timeout is only a secondary safety net.
const OUTER_FETCH_DEADLINE: Duration = Duration::from_secs(30);

/// Idle wait after an empty poll or an unexpected status.
const IDLE_WAIT: Duration = Duration::from_secs(5);

/// Longer wait after a network-level failure.
const NETWORK_WAIT: Duration = Duration::from_secs(10);

const MIN_BACKOFF: Duration = Duration::from_secs(5);
const MAX_BACKOFF: Duration = Duration::from_secs(600);

/// The single long-lived poll loop. Pulls tasks from the control plane
/// and pushes them into the bounded handoff; backs off exponentially on
/// server errors and never exits except through its cancellation token.
pub struct TaskFetcher {
    control: Arc<ControlPlaneClient>,
    config: SharedConfig,
    liveness: Arc<Liveness>,
    metrics: MetricsSink,
    tasks: mpsc::Sender<Task>,
    cancel: CancellationToken,
}

impl TaskFetcher {
    pub fn new(
        control: Arc<ControlPlaneClient>,
        config: SharedConfig,
        liveness: Arc<Liveness>,
        metrics: MetricsSink,
        tasks: mpsc::Sender<Task>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            control,
            config,
            liveness,
            metrics,
            tasks,
            cancel,
        }
    }

    pub async fn run(self) {
        let agent_version = self.config.snapshot().agent_version;
        let mut backoff = MIN_BACKOFF;

        while !self.cancel.is_cancelled() {
            debug!("requesting task");
            self.liveness.get_task_called();
            self.metrics.record("get_task_called", 1.0, &[]);

            match self.fetch_once().await {
                Some(Ok(FetchOutcome::Task(task))) => {
                    backoff = MIN_BACKOFF;
                    let mut task = *task;
                    task.version = Some(agent_version.clone());
                    info!(task_id = %task.task_id, "received task");
                    self.liveness.task_received();
                    self.metrics
                        .record("task_received", 1.0, &[("taskId", &task.task_id)]);
                    if self.tasks.send(task).await.is_err() {
                        // Pool side of the handoff is gone; this generation
                        // is being torn down.
                        break;
                    }
                }
                Some(Ok(FetchOutcome::Empty)) => {
                    backoff = MIN_BACKOFF;
                    debug!("no task available, waiting");
                    self.wait(IDLE_WAIT).await;
                }
                Some(Ok(FetchOutcome::ServerError(status))) => {
                    error!(status, "get-task server error, backing off");
                    self.wait(backoff).await;
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
                Some(Ok(FetchOutcome::Other(status))) => {
                    error!(status, "unexpected get-task response");
                    self.wait(IDLE_WAIT).await;
                }
                Some(Err(e)) => {
                    error!("get-task failed: {e}");
                    self.wait(NETWORK_WAIT).await;
                }
                // Cancelled mid-poll.
                None => break,
            }
        }
        info!("task fetcher stopped");
    }

    /// One poll under the outer deadline. The HTTP call runs in a child
    /// task so a hung socket can be terminated from outside; `None` means
    /// the fetcher itself was cancelled.
    async fn fetch_once(&self) -> Option<Result<FetchOutcome, CoreError>> {
        let control = Arc::clone(&self.control);
        let mut call = tokio::spawn(async move { control.get_task().await });

        tokio::select! {
            joined = &mut call => Some(match joined {
                Ok(outcome) => outcome.map_err(CoreError::Client),
                Err(e) => Err(CoreError::Worker(format!("get-task call aborted: {e}"))),
            }),
            _ = tokio::time::sleep(OUTER_FETCH_DEADLINE) => {
                call.abort();
                warn!("get-task exceeded the outer deadline, terminated");
                Some(Err(CoreError::FetchDeadline))
            }
            _ = self.cancel.cancelled() => {
                call.abort();
                None
            }
        }
    }

    async fn wait(&self, duration: Duration) {
        tokio::select! {
            _ = tokio::time::sleep(duration) => {}
            _ = self.cancel.cancelled() => {}
        }
    }
}
