use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::Serialize;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use tracing_appender::rolling::RollingFileAppender;

/// One metric sample, written as a single JSON line. The shipper sidecar
/// tails these files out of process.
#[derive(Debug, Clone, Serialize)]
pub struct MetricEvent {
    #[serde(rename = "@timestamp")]
    pub timestamp: i64,
    pub metric_name: String,
    pub value: f64,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub tags: HashMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct MetricsConfig {
    /// Directory for the rotated metric files.
    pub dir: PathBuf,
    /// Base file name; rotation appends `.YYYY-MM-DD` at UTC midnight.
    pub file_prefix: String,
    /// Buffered events before an early flush is requested.
    pub max_buffer: usize,
    /// Periodic flush interval of the writer task.
    pub flush_interval: Duration,
}

impl MetricsConfig {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            file_prefix: "metrics.json".to_string(),
            max_buffer: 1000,
            flush_interval: Duration::from_secs(10),
        }
    }
}

/// Buffered, append-only JSONL metric writer.
///
/// `record` never blocks on I/O: events land in a memory buffer that an
/// independent task drains every `flush_interval`, or earlier once
/// `max_buffer` is reached. A disabled sink accepts records and drops them;
/// callers never branch on whether metrics are enabled.
#[derive(Clone)]
pub struct MetricsSink {
    inner: Option<Arc<SinkInner>>,
}

struct SinkInner {
    buf: Mutex<Vec<MetricEvent>>,
    writer: Mutex<RollingFileAppender>,
    max_buffer: usize,
    flush_interval: Duration,
    kick: Notify,
}

impl MetricsSink {
    /// No-op sink: `record` and `flush` do nothing.
    pub fn disabled() -> Self {
        Self { inner: None }
    }

    pub fn new(cfg: &MetricsConfig) -> std::io::Result<Self> {
        std::fs::create_dir_all(&cfg.dir)?;
        let appender = tracing_appender::rolling::daily(&cfg.dir, &cfg.file_prefix);
        Ok(Self {
            inner: Some(Arc::new(SinkInner {
                buf: Mutex::new(Vec::with_capacity(cfg.max_buffer)),
                writer: Mutex::new(appender),
                max_buffer: cfg.max_buffer,
                flush_interval: cfg.flush_interval,
                kick: Notify::new(),
            })),
        })
    }

    pub fn record(&self, name: &str, value: f64, tags: &[(&str, &str)]) {
        let Some(inner) = &self.inner else { return };

        let event = MetricEvent {
            timestamp: epoch_ms(),
            metric_name: name.to_string(),
            value,
            tags: tags
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        };

        let len = {
            let mut buf = inner.buf.lock().expect("metrics buffer poisoned");
            buf.push(event);
            buf.len()
        };
        if len >= inner.max_buffer {
            inner.kick.notify_one();
        }
    }

    /// Drain the buffer and write synchronously. Called by the writer task,
    /// on watchdog restart, and on shutdown.
    pub fn flush(&self) {
        let Some(inner) = &self.inner else { return };

        // Swap-and-drain keeps the record() hold time minimal.
        let drained = {
            let mut buf = inner.buf.lock().expect("metrics buffer poisoned");
            std::mem::take(&mut *buf)
        };
        if drained.is_empty() {
            return;
        }

        let mut writer = inner.writer.lock().expect("metrics writer poisoned");
        for event in &drained {
            match serde_json::to_string(event) {
                Ok(line) => {
                    if let Err(e) = writeln!(writer, "{line}") {
                        warn!("failed to write metric event: {e}");
                        return;
                    }
                }
                Err(e) => warn!("failed to serialize metric event: {e}"),
            }
        }
        if let Err(e) = writer.flush() {
            warn!("failed to flush metric file: {e}");
        }
        debug!(count = drained.len(), "flushed metric events");
    }

    /// Spawn the independent writer task. Returns `None` for a disabled sink.
    pub fn spawn_writer(&self, cancel: CancellationToken) -> Option<JoinHandle<()>> {
        let inner = Arc::clone(self.inner.as_ref()?);
        let sink = self.clone();
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(inner.flush_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        sink.flush();
                        break;
                    }
                    _ = ticker.tick() => sink.flush(),
                    _ = inner.kick.notified() => sink.flush(),
                }
            }
        }))
    }
}

fn epoch_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_metric_lines(dir: &std::path::Path) -> Vec<serde_json::Value> {
        let mut lines = Vec::new();
        for entry in std::fs::read_dir(dir).unwrap() {
            let path = entry.unwrap().path();
            if path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with("metrics.json"))
            {
                for line in std::fs::read_to_string(&path).unwrap().lines() {
                    lines.push(serde_json::from_str(line).unwrap());
                }
            }
        }
        lines
    }

    #[test]
    fn flush_writes_one_event_per_line() {
        let dir = tempfile::tempdir().unwrap();
        let sink = MetricsSink::new(&MetricsConfig::new(dir.path())).unwrap();

        sink.record("task_completed", 1.0, &[("taskId", "t1")]);
        sink.record("task_completed", 1.0, &[("taskId", "t2")]);
        sink.flush();

        let lines = read_metric_lines(dir.path());
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["metric_name"], "task_completed");
        assert!(lines[0]["@timestamp"].as_i64().unwrap() > 0);
        assert_eq!(lines[0]["tags"]["taskId"], "t1");
    }

    #[test]
    fn disabled_sink_is_a_no_op() {
        let sink = MetricsSink::disabled();
        sink.record("anything", 1.0, &[]);
        sink.flush();
    }

    #[test]
    fn flush_is_idempotent_on_empty_buffer() {
        let dir = tempfile::tempdir().unwrap();
        let sink = MetricsSink::new(&MetricsConfig::new(dir.path())).unwrap();
        sink.flush();
        sink.flush();
        assert!(read_metric_lines(dir.path()).is_empty());
    }
}
