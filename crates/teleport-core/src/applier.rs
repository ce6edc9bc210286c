use std::sync::Arc;

use tracing::{info, warn};

use teleport_client::{CallGate, ControlPlaneClient, TargetClient};
use teleport_model::{GlobalConfig, SharedConfig};
use teleport_observe::LevelHandle;

use crate::pool::PoolSlots;

/// Applies a `globalConfig` patch and fans the delta out to the parts that
/// hold derived state: log level, HTTP clients, pool slots, rate limiter.
/// The policy lives here so workers never mutate ambient state directly.
pub struct ConfigApplier {
    config: SharedConfig,
    gate: Arc<CallGate>,
    slots: PoolSlots,
    control: Arc<ControlPlaneClient>,
    target: Arc<TargetClient>,
    level: Option<LevelHandle>,
}

impl ConfigApplier {
    pub fn new(
        config: SharedConfig,
        gate: Arc<CallGate>,
        slots: PoolSlots,
        control: Arc<ControlPlaneClient>,
        target: Arc<TargetClient>,
        level: Option<LevelHandle>,
    ) -> Self {
        Self {
            config,
            gate,
            slots,
            control,
            target,
            level,
        }
    }

    pub fn apply(&self, patch: &GlobalConfig) {
        let delta = self.config.apply_global(patch);
        if delta.is_empty() {
            return;
        }
        let snapshot = self.config.snapshot();
        info!(?delta, "applying globalConfig from control plane");

        if delta.debug_mode
            && let Some(level) = &self.level
        {
            level.set_debug(snapshot.debug_mode);
        }
        if delta.verify_cert {
            if let Err(e) = self.control.set_verify(snapshot.verify_cert) {
                warn!("failed to rebuild control-plane client: {e}");
            }
            if let Err(e) = self.target.set_verify(snapshot.verify_cert) {
                warn!("failed to rebuild target client: {e}");
            }
        }
        if delta.pool_size {
            self.slots.resize(snapshot.pool_size);
        }
        if delta.rate_limit {
            self.gate.set_rate_per_min(snapshot.rate_limit_per_min);
        }
    }
}
