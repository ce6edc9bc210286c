use std::sync::Arc;

use tracing::{error, info, warn};
use uuid::Uuid;

use teleport_client::{ClientError, ControlPlaneClient};
use teleport_model::{SharedConfig, Task};
use teleport_observe::MetricsSink;

use crate::spool::{TaskSpool, gzip_file};

/// What became of a large response body.
pub enum ArtifactOutcome {
    /// The result travelled with the artifact (upload-result); nothing
    /// further goes out.
    Posted,
    /// The task still needs an inline put-result post.
    PendingPost,
    /// Upload retries were exhausted; the result is dropped and logged.
    Abandoned,
}

/// Posts inline results and moves artifacts, either straight to the
/// control plane or through pre-signed object storage.
pub struct ResultUploader {
    control: Arc<ControlPlaneClient>,
    config: SharedConfig,
    metrics: MetricsSink,
}

impl ResultUploader {
    pub fn new(
        control: Arc<ControlPlaneClient>,
        config: SharedConfig,
        metrics: MetricsSink,
    ) -> Self {
        Self {
            control,
            config,
            metrics,
        }
    }

    /// Inline path. Transient failures are retried inside the client; a
    /// permanent 4xx or exhausted retries drop the result with a log line
    /// carrying the task id.
    pub async fn post_result(&self, task: &Task) {
        match self.control.put_result(task).await {
            Ok(()) => {
                self.metrics
                    .record("result_posted", 1.0, &[("taskId", &task.task_id)]);
            }
            Err(ClientError::Status { status, .. }) => {
                warn!(
                    task_id = %task.task_id,
                    status,
                    "dropping result after permanent control-plane response"
                );
                self.metrics
                    .record("result_dropped", 1.0, &[("taskId", &task.task_id)]);
            }
            Err(e) => {
                error!(task_id = %task.task_id, "failed to post result: {e}");
                self.metrics
                    .record("result_dropped", 1.0, &[("taskId", &task.task_id)]);
            }
        }
    }

    /// Large-body path, selected by `uploadToAc`. The spool stays alive for
    /// the duration of the upload and is deleted by the caller's scope.
    pub async fn upload_artifact(
        &self,
        task: &mut Task,
        spool: &TaskSpool,
    ) -> Result<ArtifactOutcome, ClientError> {
        let gzipped = compress(spool).await;
        task.response_zipped = Some(gzipped);
        // The body travels as the file part, never inside the task JSON.
        task.output = None;
        task.response_base64 = None;

        if self.config.snapshot().upload_to_ac {
            self.upload_to_control_plane(task, spool, gzipped).await
        } else {
            Ok(self.upload_to_object_storage(task, spool, gzipped).await)
        }
    }

    async fn upload_to_control_plane(
        &self,
        task: &mut Task,
        spool: &TaskSpool,
        gzipped: bool,
    ) -> Result<ArtifactOutcome, ClientError> {
        let (path, ext, mime) = if gzipped {
            (spool.gz_path(), "zip", "application/zip")
        } else {
            (spool.raw_path(), "txt", "text/plain")
        };
        let file_name = format!("{}_{}.{ext}", task.task_id, Uuid::new_v4().simple());

        match self
            .control
            .upload_result(task, path, &file_name, mime)
            .await
        {
            Ok(()) => {
                self.metrics
                    .record("artifact_uploaded", 1.0, &[("taskId", &task.task_id)]);
                Ok(ArtifactOutcome::Posted)
            }
            // Spool-side IO problems are agent errors and still produce a
            // posted result upstream.
            Err(e @ ClientError::Io(_)) => Err(e),
            Err(e) => {
                error!(task_id = %task.task_id, "unable to upload artifact: {e}");
                self.metrics
                    .record("result_dropped", 1.0, &[("taskId", &task.task_id)]);
                Ok(ArtifactOutcome::Abandoned)
            }
        }
    }

    /// Pre-signed flow: fetch a PUT/GET pair, PUT the file, hand the GET
    /// URL back in the result. Any failure converts the task into the
    /// documented s3-failure result; the inline post still happens.
    async fn upload_to_object_storage(
        &self,
        task: &mut Task,
        spool: &TaskSpool,
        gzipped: bool,
    ) -> ArtifactOutcome {
        let file_name = format!("{}{}", task.task_id, Uuid::new_v4().simple());

        let urls = match self.control.upload_url(&file_name).await {
            Ok(urls) => urls,
            Err(e) => {
                error!(task_id = %task.task_id, "failed to get pre-signed upload url: {e}");
                return s3_failure(task);
            }
        };

        let path = if gzipped {
            spool.gz_path()
        } else {
            spool.raw_path()
        };
        let content_type = response_header(task, "content-type").map(str::to_owned);
        let content_encoding = response_header(task, "content-encoding").map(str::to_owned);

        match self
            .control
            .put_object(
                &urls.put_url,
                path,
                content_type.as_deref(),
                content_encoding.as_deref(),
            )
            .await
        {
            Ok(()) => {
                info!(task_id = %task.task_id, "artifact uploaded to object storage");
                task.set_artifact_url(urls.get_url);
                self.metrics
                    .record("artifact_uploaded", 1.0, &[("taskId", &task.task_id)]);
                ArtifactOutcome::PendingPost
            }
            Err(e) => {
                error!(task_id = %task.task_id, "failed to upload artifact to object storage: {e}");
                s3_failure(task)
            }
        }
    }
}

fn s3_failure(task: &mut Task) -> ArtifactOutcome {
    task.status_code = Some(500);
    task.output = Some("Error: failed to upload result to s3".to_string());
    task.response_base64 = None;
    task.s3_url = None;
    ArtifactOutcome::PendingPost
}

async fn compress(spool: &TaskSpool) -> bool {
    let src = spool.raw_path().to_path_buf();
    let dest = spool.gz_path().to_path_buf();
    let root = spool.root().to_path_buf();
    match tokio::task::spawn_blocking(move || gzip_file(&src, &dest, &root)).await {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            warn!("unable to zip file: {e}");
            false
        }
        Err(e) => {
            warn!("compression task failed: {e}");
            false
        }
    }
}

/// Case-insensitive lookup in the recorded target response headers.
fn response_header<'a>(task: &'a Task, name: &str) -> Option<&'a str> {
    task.response_headers
        .as_ref()?
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .map(|(_, value)| value.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn s3_failure_sets_the_documented_result() {
        let mut task = Task {
            task_id: "t3".into(),
            ..Default::default()
        };
        task.set_inline_output("should be cleared".into());
        s3_failure(&mut task);
        assert_eq!(task.status_code, Some(500));
        assert_eq!(
            task.output.as_deref(),
            Some("Error: failed to upload result to s3")
        );
        assert!(task.s3_url.is_none());
        assert!(task.response_base64.is_none());
    }

    #[test]
    fn response_headers_are_matched_case_insensitively() {
        let mut task = Task::default();
        task.response_headers = Some(
            [
                ("Content-Type".to_string(), "text/csv".to_string()),
                ("CONTENT-ENCODING".to_string(), "gzip".to_string()),
            ]
            .into_iter()
            .collect(),
        );
        assert_eq!(response_header(&task, "content-type"), Some("text/csv"));
        assert_eq!(response_header(&task, "content-encoding"), Some("gzip"));
        assert_eq!(response_header(&task, "etag"), None);
    }
}
