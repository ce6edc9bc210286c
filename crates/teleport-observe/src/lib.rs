mod logger;
pub use logger::{LevelHandle, LogHandle, LoggerConfig, LoggerError, logger_init};

mod metrics;
pub use metrics::{MetricEvent, MetricsConfig, MetricsSink};

mod retention;
pub use retention::prune_rotated_files;
