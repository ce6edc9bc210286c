mod task;
pub use task::{
    AGENT_ERROR_PREFIX, GetTaskEnvelope, GlobalConfigPatch, MAX_INLINE_BYTES, Task,
    UploadUrlEnvelope, UploadUrls,
};

mod config;
pub use config::{ConfigDelta, GlobalConfig, ProxyConfig, RuntimeConfig, SharedConfig};

mod paths;
pub use paths::AgentPaths;
