use std::sync::{Arc, RwLock};

use serde::Deserialize;

use crate::task::GlobalConfigPatch;

/// Proxy endpoints for one direction of traffic, split by target scheme the
/// way the CLI exposes them (`--…ProxyHttp` / `--…ProxyHttps`).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProxyConfig {
    pub http: Option<String>,
    pub https: Option<String>,
}

impl ProxyConfig {
    pub fn is_empty(&self) -> bool {
        self.http.is_none() && self.https.is_none()
    }
}

/// Runtime configuration of the agent process.
///
/// Written at startup and on `globalConfig` application, read everywhere.
/// Held behind [`SharedConfig`]; no ambient mutation from inside a worker.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub server_url: String,
    pub api_key: String,
    pub agent_id: String,
    pub agent_version: String,
    pub env_name: Option<String>,

    pub verify_cert: bool,
    pub debug_mode: bool,
    pub inward_proxy: ProxyConfig,
    pub outgoing_proxy: ProxyConfig,

    pub pool_size: usize,
    pub rate_limit_per_min: u32,
    pub upload_to_ac: bool,
    pub timeout_secs: u64,
    pub metrics_retention_days: u32,

    /// Watchdog staleness thresholds, in seconds.
    pub get_task_stale_threshold: u64,
    pub task_received_stale_threshold: u64,
}

impl RuntimeConfig {
    /// Defaults for everything except the two required fields.
    pub fn new(server_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            api_key: api_key.into(),
            agent_id: String::new(),
            agent_version: String::new(),
            env_name: None,
            verify_cert: false,
            debug_mode: false,
            inward_proxy: ProxyConfig::default(),
            outgoing_proxy: ProxyConfig::default(),
            pool_size: 5,
            rate_limit_per_min: 250,
            upload_to_ac: true,
            timeout_secs: 30,
            metrics_retention_days: 7,
            get_task_stale_threshold: 3600,
            task_received_stale_threshold: 43200,
        }
    }

    pub fn metrics_enabled(&self) -> bool {
        self.metrics_retention_days > 0
    }
}

/// The subset of runtime configuration the control plane may rewrite through
/// a task's `globalConfig`. Absent keys leave the current value untouched.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GlobalConfig {
    #[serde(default)]
    pub debug_mode: Option<bool>,
    #[serde(default)]
    pub verify_cert: Option<bool>,
    #[serde(default)]
    pub pool_size: Option<usize>,
    #[serde(default, alias = "uploadToAC")]
    pub upload_to_ac: Option<bool>,
    #[serde(default)]
    pub rate_limit_per_min: Option<u32>,
}

impl GlobalConfig {
    /// Parse the raw map embedded in a task, ignoring keys outside the
    /// rewritable subset.
    pub fn from_patch(patch: &GlobalConfigPatch) -> Self {
        serde_json::from_value(serde_json::to_value(patch).unwrap_or_default()).unwrap_or_default()
    }
}

/// What changed during a `globalConfig` application, so collaborators
/// (rate limiter, pool, HTTP clients, log level) can react.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConfigDelta {
    pub debug_mode: bool,
    pub verify_cert: bool,
    pub pool_size: bool,
    pub upload_to_ac: bool,
    pub rate_limit: bool,
}

impl ConfigDelta {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Shared, read-mostly view of [`RuntimeConfig`].
#[derive(Clone)]
pub struct SharedConfig {
    inner: Arc<RwLock<RuntimeConfig>>,
}

impl SharedConfig {
    pub fn new(config: RuntimeConfig) -> Self {
        Self {
            inner: Arc::new(RwLock::new(config)),
        }
    }

    /// Clone of the current configuration. Cheap enough for per-task use and
    /// keeps readers out of the writer's way.
    pub fn snapshot(&self) -> RuntimeConfig {
        self.inner.read().expect("config lock poisoned").clone()
    }

    /// Apply a `globalConfig` patch atomically and report what changed.
    /// Applying the same patch twice yields an empty delta the second time.
    pub fn apply_global(&self, patch: &GlobalConfig) -> ConfigDelta {
        let mut cfg = self.inner.write().expect("config lock poisoned");
        let mut delta = ConfigDelta::default();

        if let Some(debug) = patch.debug_mode
            && cfg.debug_mode != debug
        {
            cfg.debug_mode = debug;
            delta.debug_mode = true;
        }
        if let Some(verify) = patch.verify_cert
            && cfg.verify_cert != verify
        {
            cfg.verify_cert = verify;
            delta.verify_cert = true;
        }
        if let Some(size) = patch.pool_size
            && size > 0
            && cfg.pool_size != size
        {
            cfg.pool_size = size;
            delta.pool_size = true;
        }
        if let Some(upload) = patch.upload_to_ac
            && cfg.upload_to_ac != upload
        {
            cfg.upload_to_ac = upload;
            delta.upload_to_ac = true;
        }
        if let Some(limit) = patch.rate_limit_per_min
            && limit > 0
            && cfg.rate_limit_per_min != limit
        {
            cfg.rate_limit_per_min = limit;
            delta.rate_limit = true;
        }

        delta
    }
}
