use std::sync::Arc;

use time::{UtcOffset, format_description::well_known::Rfc3339};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    EnvFilter, Registry, fmt, fmt::time::OffsetTime, layer::SubscriberExt, reload,
    util::SubscriberInitExt,
};

use crate::logger::{config::LoggerConfig, error::LoggerError};

/// Keeps the non-blocking writer alive and exposes the runtime level toggle.
/// Dropping this flushes and stops the background log writer.
pub struct LogHandle {
    level: LevelHandle,
    _guard: WorkerGuard,
}

impl LogHandle {
    pub fn level(&self) -> LevelHandle {
        self.level.clone()
    }
}

/// Cheap clone of the reloadable filter, handed to whoever applies
/// `globalConfig.debugMode` at runtime.
#[derive(Clone)]
pub struct LevelHandle {
    handle: reload::Handle<EnvFilter, Registry>,
    base: Arc<str>,
}

impl LevelHandle {
    pub fn set_debug(&self, debug: bool) {
        let directive = if debug { "debug" } else { self.base.as_ref() };
        if let Ok(filter) = EnvFilter::try_new(directive)
            && let Err(e) = self.handle.reload(filter)
        {
            tracing::warn!("failed to reload log filter: {e}");
        }
    }
}

/// Install the global subscriber: a daily-rotated file under the log
/// directory, optionally mirrored to stdout, with a reloadable level filter.
pub fn logger_init(cfg: &LoggerConfig) -> Result<LogHandle, LoggerError> {
    std::fs::create_dir_all(&cfg.dir)
        .map_err(|e| LoggerError::InitializationFailed(format!("log dir: {e}")))?;

    let filter = EnvFilter::try_new(&cfg.level)
        .map_err(|_| LoggerError::InvalidLogLevel(cfg.level.clone()))?;
    let (filter, handle) = reload::Layer::new(filter);

    let appender = tracing_appender::rolling::daily(&cfg.dir, &cfg.file_prefix);
    let (writer, guard) = tracing_appender::non_blocking(appender);

    let file_layer = fmt::layer()
        .with_ansi(false)
        .with_target(cfg.with_targets)
        .with_timer(mk_timer())
        .with_writer(writer);

    let stdout_layer = cfg.stdout.then(|| {
        fmt::layer()
            .with_target(cfg.with_targets)
            .with_timer(mk_timer())
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(file_layer)
        .with(stdout_layer)
        .try_init()
        .map_err(as_error)?;

    Ok(LogHandle {
        level: LevelHandle {
            handle,
            base: Arc::from(cfg.level.as_str()),
        },
        _guard: guard,
    })
}

fn mk_timer() -> OffsetTime<Rfc3339> {
    let offset = UtcOffset::current_local_offset().unwrap_or(UtcOffset::UTC);
    OffsetTime::new(offset, Rfc3339)
}

fn as_error(e: impl std::fmt::Display) -> LoggerError {
    let s = e.to_string();
    if s.contains("SetGlobalDefaultError") {
        LoggerError::AlreadyInitialized
    } else {
        LoggerError::InitializationFailed(s)
    }
}
