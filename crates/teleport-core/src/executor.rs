use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde_json::Value;
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::{debug, error, info, warn};

use teleport_client::{ClientError, ControlPlaneClient, TargetClient, TargetRequest};
use teleport_model::{AgentPaths, GlobalConfig, MAX_INLINE_BYTES, Task};
use teleport_observe::MetricsSink;

use crate::applier::ConfigApplier;
use crate::spool::{TaskSpool, archive_dir_gz};
use crate::uploader::{ArtifactOutcome, ResultUploader};

/// Floor for the per-task deadline even when `expiryTsMs` is already past.
const MIN_TASK_DEADLINE: Duration = Duration::from_secs(5);

/// Fallback when the task carries no expiry.
const DEFAULT_TASK_DEADLINE: Duration = Duration::from_secs(3600);

/// Spool write buffering: chunked transfer gets the smaller buffer.
const CHUNKED_BUF: usize = 1024 * 100;
const WHOLE_BUF: usize = 1024 * 500;

/// Targets hosting this path require form-encoded token requests whatever
/// the task says.
const CX_TOKEN_PATH: &str = "/cxrestapi/auth/identity/connect/token";

/// Per-task deadline: whatever `expiryTsMs` leaves, floored at five
/// seconds; an hour flat when the task has no expiry.
pub fn effective_deadline(expiry_ts_ms: Option<i64>) -> Duration {
    match expiry_ts_ms {
        None => DEFAULT_TASK_DEADLINE,
        Some(expiry) => {
            let now_ms = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis() as i64)
                .unwrap_or_default();
            let remaining_secs = (expiry - now_ms) / 1000;
            let remaining = if remaining_secs > 0 {
                Duration::from_secs(remaining_secs as u64)
            } else {
                Duration::ZERO
            };
            remaining.max(MIN_TASK_DEADLINE)
        }
    }
}

/// The algorithmic heart: issues the target call, streams the body to a
/// per-task spool, and routes the result inline or out of band.
pub struct Executor {
    target: Arc<TargetClient>,
    control: Arc<ControlPlaneClient>,
    uploader: Arc<ResultUploader>,
    applier: Arc<ConfigApplier>,
    paths: AgentPaths,
    metrics: MetricsSink,
}

impl Executor {
    pub fn new(
        target: Arc<TargetClient>,
        control: Arc<ControlPlaneClient>,
        uploader: Arc<ResultUploader>,
        applier: Arc<ConfigApplier>,
        paths: AgentPaths,
        metrics: MetricsSink,
    ) -> Self {
        Self {
            target,
            control,
            uploader,
            applier,
            paths,
            metrics,
        }
    }

    /// Execute one task. `Some(task)` still needs an inline post by the
    /// caller; `None` means nothing further goes out (fetch-logs, or the
    /// artifact already travelled with upload-result).
    pub async fn process(&self, mut task: Task) -> Option<Task> {
        if let Some(patch) = &task.global_config {
            let config = GlobalConfig::from_patch(patch);
            self.applier.apply(&config);
        }

        if task.is_fetch_logs() {
            self.ship_logs(&mut task).await;
            return None;
        }

        let deadline = effective_deadline(task.expiry_ts_ms);
        info!(
            task_id = %task.task_id,
            method = %task.method,
            url = %task.url,
            deadline_secs = deadline.as_secs(),
            "processing task"
        );

        match self.call_target(&mut task, deadline).await {
            Ok(ArtifactOutcome::PendingPost) => Some(task),
            Ok(ArtifactOutcome::Posted) => None,
            Ok(ArtifactOutcome::Abandoned) => {
                warn!(task_id = %task.task_id, "artifact upload abandoned; result dropped");
                None
            }
            Err(err) => {
                match &err {
                    ClientError::Transport(e) => {
                        error!(task_id = %task.task_id, "network error processing task: {e}");
                        task.set_agent_error(format!("Network error: {e}"));
                    }
                    other => {
                        error!(task_id = %task.task_id, "error processing task: {other}");
                        task.set_agent_error(format!("Error: {other}"));
                    }
                }
                self.metrics
                    .record("task_failed", 1.0, &[("taskId", &task.task_id)]);
                Some(task)
            }
        }
    }

    /// Issue the target request and spool the body. Non-2xx bodies are
    /// spooled too; only transport-level failures surface as errors.
    async fn call_target(
        &self,
        task: &mut Task,
        deadline: Duration,
    ) -> Result<ArtifactOutcome, ClientError> {
        let mut headers = task.request_headers.clone();
        fix_content_type(&mut headers, &task.url);
        let body = encode_input(task.input.as_ref());

        let spool = TaskSpool::create(&self.paths.output_dir(), &task.task_id)?;

        let mut response = self
            .target
            .execute(TargetRequest {
                method: task.method.clone(),
                url: task.url.clone(),
                headers,
                body,
                read_timeout: deadline,
            })
            .await?;

        let status = response.status().as_u16();
        let chunked = response
            .headers()
            .get("transfer-encoding")
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.contains("chunked"));
        debug!(task_id = %task.task_id, status, chunked, "target responded");

        task.status_code = Some(status);
        task.response_headers = Some(header_snapshot(response.headers()));

        let buf_size = if chunked { CHUNKED_BUF } else { WHOLE_BUF };
        let file = tokio::fs::File::create(spool.raw_path()).await?;
        let mut writer = BufWriter::with_capacity(buf_size, file);
        while let Some(chunk) = response.chunk().await? {
            writer.write_all(&chunk).await?;
        }
        writer.flush().await?;

        let size = spool.raw_size()?;
        debug!(task_id = %task.task_id, size, "response body spooled");
        self.metrics
            .record("response_bytes", size as f64, &[("taskId", &task.task_id)]);

        if size == 0 {
            return Ok(ArtifactOutcome::PendingPost);
        }
        if size <= MAX_INLINE_BYTES {
            let body = spool.read_raw()?;
            task.set_inline_output(BASE64.encode(body));
            return Ok(ArtifactOutcome::PendingPost);
        }

        self.uploader.upload_artifact(task, &spool).await
    }

    /// Special path: bundle the log directory and ship it. Nothing further
    /// is posted for these tasks, whatever the upload outcome.
    async fn ship_logs(&self, task: &mut Task) {
        info!(task_id = %task.task_id, "collecting agent logs");
        let log_dir = self.paths.log_dir();
        let output_dir = self.paths.output_dir();

        let archive = match tempfile::Builder::new()
            .prefix(&format!("logs_{}", task.task_id))
            .suffix(".tar.gz")
            .tempfile_in(&output_dir)
        {
            Ok(archive) => archive,
            Err(e) => {
                error!(task_id = %task.task_id, "failed to create log archive file: {e}");
                return;
            }
        };

        let src = log_dir.clone();
        let dest = archive.path().to_path_buf();
        let packed =
            tokio::task::spawn_blocking(move || archive_dir_gz(&src, &dest)).await;
        match packed {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!(task_id = %task.task_id, "failed to archive log directory: {e}");
                return;
            }
            Err(e) => {
                error!(task_id = %task.task_id, "log archiving task failed: {e}");
                return;
            }
        }

        task.response_zipped = Some(true);
        let archive_name = format!("{}_{}.tar.gz", task.task_id, uuid::Uuid::new_v4().simple());
        if let Err(e) = self
            .control
            .upload_logs(task, archive.path(), &archive_name)
            .await
        {
            error!(task_id = %task.task_id, "failed to upload agent logs: {e}");
        }
        self.metrics
            .record("logs_shipped", 1.0, &[("taskId", &task.task_id)]);
    }
}

/// Checkmarx token endpoints only accept form-encoded bodies; the override
/// is applied regardless of what the task carried.
fn fix_content_type(headers: &mut HashMap<String, String>, url: &str) {
    if url.contains(CX_TOKEN_PATH) {
        headers.retain(|name, _| !name.eq_ignore_ascii_case("content-type"));
        headers.insert(
            "Content-Type".to_string(),
            "application/x-www-form-urlencoded".to_string(),
        );
    }
}

/// Strings go out UTF-8 encoded, anything else is serialized as-is with a
/// warning (the control plane should not be sending structured bodies).
fn encode_input(input: Option<&Value>) -> Option<Vec<u8>> {
    match input {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s.clone().into_bytes()),
        Some(other) => {
            warn!("task input is neither string nor bytes; passing serialized value");
            serde_json::to_vec(other).ok()
        }
    }
}

fn header_snapshot(headers: &reqwest::header::HeaderMap) -> HashMap<String, String> {
    let mut map = HashMap::with_capacity(headers.len());
    for (name, value) in headers {
        if let Ok(value) = value.to_str() {
            map.insert(name.as_str().to_string(), value.to_string());
        }
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deadline_floors_expired_tasks_at_five_seconds() {
        let past = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_millis() as i64
            - 60_000;
        assert_eq!(effective_deadline(Some(past)), Duration::from_secs(5));
    }

    #[test]
    fn deadline_defaults_to_an_hour_without_expiry() {
        assert_eq!(effective_deadline(None), Duration::from_secs(3600));
    }

    #[test]
    fn deadline_is_tightened_by_expiry() {
        let now_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_millis() as i64;
        let deadline = effective_deadline(Some(now_ms + 120_000));
        assert!(deadline <= Duration::from_secs(120));
        assert!(deadline >= Duration::from_secs(118));
    }

    #[test]
    fn deadline_tracks_expiry_beyond_an_hour() {
        let now_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_millis() as i64;
        let deadline = effective_deadline(Some(now_ms + 2 * 3600 * 1000));
        assert!(deadline <= Duration::from_secs(7200));
        assert!(deadline >= Duration::from_secs(7198));
    }

    #[test]
    fn cx_token_url_forces_form_encoding() {
        let mut headers = HashMap::new();
        headers.insert("content-type".to_string(), "application/json".to_string());
        fix_content_type(
            &mut headers,
            "https://cx.internal/cxrestapi/auth/identity/connect/token",
        );
        assert_eq!(headers.len(), 1);
        assert_eq!(
            headers.get("Content-Type").map(String::as_str),
            Some("application/x-www-form-urlencoded")
        );
    }

    #[test]
    fn other_urls_keep_their_content_type() {
        let mut headers = HashMap::new();
        headers.insert("Content-Type".to_string(), "application/json".to_string());
        fix_content_type(&mut headers, "https://svc.internal/api/v1/things");
        assert_eq!(
            headers.get("Content-Type").map(String::as_str),
            Some("application/json")
        );
    }

    #[test]
    fn string_input_is_utf8_encoded() {
        let input = Value::String("héllo".to_string());
        assert_eq!(encode_input(Some(&input)), Some("héllo".as_bytes().to_vec()));
    }

    #[test]
    fn absent_input_sends_no_body() {
        assert_eq!(encode_input(None), None);
        assert_eq!(encode_input(Some(&Value::Null)), None);
    }

    #[test]
    fn structured_input_is_serialized() {
        let input = serde_json::json!({"a": 1});
        assert_eq!(encode_input(Some(&input)), Some(b"{\"a\":1}".to_vec()));
    }
}
