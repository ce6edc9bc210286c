use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use teleport_client::{CallGate, ControlPlaneClient, TargetClient};
use teleport_model::{AgentPaths, SharedConfig, Task};
use teleport_observe::{LevelHandle, MetricsSink};

use crate::applier::ConfigApplier;
use crate::error::CoreError;
use crate::executor::Executor;
use crate::fetcher::TaskFetcher;
use crate::pool::{ExecRegistry, PoolSlots, WorkerPool};
use crate::uploader::ResultUploader;
use crate::watchdog::{Liveness, Watchdog};

const WATCHDOG_TICK: Duration = Duration::from_secs(60);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// Whole-process lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    Init,
    Running,
    Restarting,
    ShuttingDown,
    Exited,
}

impl fmt::Display for AgentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AgentState::Init => "INIT",
            AgentState::Running => "RUNNING",
            AgentState::Restarting => "RESTARTING",
            AgentState::ShuttingDown => "SHUTTING_DOWN",
            AgentState::Exited => "EXITED",
        };
        f.write_str(name)
    }
}

/// One fetcher + pool incarnation. The watchdog tears the whole thing down
/// and builds a fresh one on stall.
struct Generation {
    cancel: CancellationToken,
    registry: Arc<ExecRegistry>,
    fetcher: JoinHandle<()>,
    pool: JoinHandle<mpsc::Receiver<Task>>,
}

impl Generation {
    /// Kill fetcher, workers and the handoff; count what was still queued.
    async fn teardown(self) -> usize {
        self.cancel.cancel();
        self.fetcher.abort();
        let _ = self.fetcher.await;

        let aborted = self.registry.abort_all();
        if aborted > 0 {
            warn!(aborted, "terminated in-flight executions");
        }

        let mut dropped = 0;
        if let Ok(mut handoff) = self.pool.await {
            handoff.close();
            while let Ok(task) = handoff.try_recv() {
                warn!(task_id = %task.task_id, "dropping queued task");
                dropped += 1;
            }
        }
        dropped
    }
}

/// The assembled agent: owns the shared collaborators and drives the
/// watchdog loop that supervises fetcher and pool generations.
pub struct Agent {
    config: SharedConfig,
    gate: Arc<CallGate>,
    control: Arc<ControlPlaneClient>,
    metrics: MetricsSink,
    liveness: Arc<Liveness>,
    slots: PoolSlots,
    executor: Arc<Executor>,
    uploader: Arc<ResultUploader>,
    watchdog: Watchdog,
    watchdog_tick: Duration,
    shutdown_grace: Duration,
}

impl Agent {
    pub fn new(
        config: SharedConfig,
        paths: AgentPaths,
        metrics: MetricsSink,
        level: Option<LevelHandle>,
    ) -> Result<Self, CoreError> {
        let snapshot = config.snapshot();

        let gate = Arc::new(CallGate::new());
        gate.set_rate_per_min(snapshot.rate_limit_per_min);

        let control = Arc::new(ControlPlaneClient::new(&snapshot, Arc::clone(&gate))?);
        let target = Arc::new(TargetClient::new(&snapshot)?);
        let slots = PoolSlots::new(snapshot.pool_size);

        let applier = Arc::new(ConfigApplier::new(
            config.clone(),
            Arc::clone(&gate),
            slots.clone(),
            Arc::clone(&control),
            Arc::clone(&target),
            level,
        ));
        let uploader = Arc::new(ResultUploader::new(
            Arc::clone(&control),
            config.clone(),
            metrics.clone(),
        ));
        let executor = Arc::new(Executor::new(
            target,
            Arc::clone(&control),
            Arc::clone(&uploader),
            applier,
            paths,
            metrics.clone(),
        ));

        let liveness = Arc::new(Liveness::new());
        let watchdog = Watchdog::new(Arc::clone(&liveness), config.clone());

        Ok(Self {
            config,
            gate,
            control,
            metrics,
            liveness,
            slots,
            executor,
            uploader,
            watchdog,
            watchdog_tick: WATCHDOG_TICK,
            shutdown_grace: SHUTDOWN_GRACE,
        })
    }

    /// Shorter supervision intervals, used by tests.
    pub fn with_timings(mut self, watchdog_tick: Duration, shutdown_grace: Duration) -> Self {
        self.watchdog_tick = watchdog_tick;
        self.shutdown_grace = shutdown_grace;
        self
    }

    /// Run until the shutdown token fires: spawn the first generation, then
    /// tick the watchdog, sweeping expired executions and rebuilding the
    /// worker state on stall.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), CoreError> {
        let mut state = AgentState::Init;
        let metrics_writer = self.metrics.spawn_writer(shutdown.child_token());

        let mut generation = self.spawn_generation();
        transition(&mut state, AgentState::Running);

        let mut ticker = tokio::time::interval(self.watchdog_tick);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    transition(&mut state, AgentState::ShuttingDown);
                    self.shutdown(generation).await;
                    if let Some(writer) = metrics_writer {
                        let _ = writer.await;
                    }
                    self.metrics.flush();
                    transition(&mut state, AgentState::Exited);
                    return Ok(());
                }
                _ = ticker.tick() => {
                    for task_id in generation.registry.sweep_expired() {
                        self.metrics.record("execution_swept", 1.0, &[("taskId", &task_id)]);
                    }

                    if self.watchdog.is_stalled() {
                        transition(&mut state, AgentState::Restarting);
                        self.metrics.record("watchdog_restart", 1.0, &[]);
                        self.metrics.flush();

                        let dropped = generation.teardown().await;
                        if dropped > 0 {
                            warn!(dropped, "dropped queued tasks during restart");
                        }
                        self.gate.reset();
                        self.liveness.reset_to_now();

                        generation = self.spawn_generation();
                        transition(&mut state, AgentState::Running);
                    }
                }
            }
        }
    }

    fn spawn_generation(&self) -> Generation {
        let snapshot = self.config.snapshot();
        let (tx, rx) = mpsc::channel(snapshot.pool_size.max(1) * 2);
        let cancel = CancellationToken::new();
        let registry = Arc::new(ExecRegistry::new());

        let fetcher = TaskFetcher::new(
            Arc::clone(&self.control),
            self.config.clone(),
            Arc::clone(&self.liveness),
            self.metrics.clone(),
            tx,
            cancel.child_token(),
        );
        let pool = WorkerPool::new(
            rx,
            self.slots.clone(),
            Arc::clone(&registry),
            Arc::clone(&self.executor),
            Arc::clone(&self.uploader),
            Arc::clone(&self.liveness),
            self.metrics.clone(),
            cancel.child_token(),
        );

        info!(pool_size = snapshot.pool_size, "spawning fetcher and worker pool");
        Generation {
            cancel,
            registry,
            fetcher: tokio::spawn(fetcher.run()),
            pool: tokio::spawn(pool.run()),
        }
    }

    /// Stop fetching, give in-flight tasks the grace period, then terminate
    /// what is left and flush metrics.
    async fn shutdown(&self, generation: Generation) {
        info!(
            grace_secs = self.shutdown_grace.as_secs(),
            "shutdown requested; draining in-flight tasks"
        );
        generation.cancel.cancel();
        generation.fetcher.abort();
        let _ = generation.fetcher.await;

        let deadline = tokio::time::Instant::now() + self.shutdown_grace;
        while !generation.registry.is_empty() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(500)).await;
        }

        let leftover = generation.registry.abort_all();
        if leftover > 0 {
            warn!(leftover, "terminated in-flight executions at shutdown");
        }
        if let Ok(mut handoff) = generation.pool.await {
            handoff.close();
            let mut dropped = 0;
            while handoff.try_recv().is_ok() {
                dropped += 1;
            }
            if dropped > 0 {
                warn!(dropped, "dropped queued tasks at shutdown");
            }
        }
    }
}

fn transition(state: &mut AgentState, next: AgentState) {
    info!(from = %state, to = %next, "agent state transition");
    *state = next;
}
