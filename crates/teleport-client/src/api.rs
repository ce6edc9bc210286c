use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use reqwest::header::{CONTENT_ENCODING, CONTENT_LENGTH, CONTENT_TYPE};
use reqwest::multipart::{Form, Part};
use tokio_util::io::ReaderStream;
use tracing::{debug, info, warn};

use teleport_model::{GetTaskEnvelope, RuntimeConfig, Task, UploadUrlEnvelope, UploadUrls};

use crate::error::ClientError;
use crate::gate::CallGate;
use crate::retry::{Attempt, RETRY_AFTER_HEADER, RetryPolicy, delay_for_429, with_retry};

const GET_TASK_TIMEOUT: Duration = Duration::from_secs(25);
const PUT_RESULT_TIMEOUT: Duration = Duration::from_secs(30);
const UPLOAD_RESULT_TIMEOUT: Duration = Duration::from_secs(300);
const UPLOAD_URL_TIMEOUT: Duration = Duration::from_secs(25);
const OBJECT_PUT_TIMEOUT: Duration = Duration::from_secs(120);

/// What a single get-task poll produced.
#[derive(Debug)]
pub enum FetchOutcome {
    Task(Box<Task>),
    /// 200 with null data or 204: nothing queued.
    Empty,
    /// 5xx; the fetcher backs off exponentially.
    ServerError(u16),
    /// Anything else; logged, short wait.
    Other(u16),
}

/// HTTP client for the ArmorCode control plane.
///
/// Every call carries the bearer token and the `Ac-Agent` version header,
/// goes out through the outgoing proxy, and passes the call gate (sliding
/// window + concurrency ceiling) before hitting the wire.
pub struct ControlPlaneClient {
    http: RwLock<reqwest::Client>,
    verify_cert: Mutex<bool>,
    base_url: String,
    api_key: String,
    agent_id: String,
    agent_version: String,
    env_name: Option<String>,
    outgoing_proxy: teleport_model::ProxyConfig,
    gate: Arc<CallGate>,
    policy: RetryPolicy,
}

impl ControlPlaneClient {
    pub fn new(cfg: &RuntimeConfig, gate: Arc<CallGate>) -> Result<Self, ClientError> {
        let http = build_http(cfg.verify_cert, &cfg.outgoing_proxy, None)?;
        Ok(Self {
            http: RwLock::new(http),
            verify_cert: Mutex::new(cfg.verify_cert),
            base_url: cfg.server_url.trim_end_matches('/').to_string(),
            api_key: cfg.api_key.clone(),
            agent_id: cfg.agent_id.clone(),
            agent_version: cfg.agent_version.clone(),
            env_name: cfg.env_name.clone(),
            outgoing_proxy: cfg.outgoing_proxy.clone(),
            gate,
            policy: RetryPolicy::default(),
        })
    }

    /// Rebuild the underlying client when `globalConfig` flips certificate
    /// verification. No-op when the value is unchanged.
    pub fn set_verify(&self, verify: bool) -> Result<(), ClientError> {
        let mut current = self.verify_cert.lock().expect("verify lock poisoned");
        if *current == verify {
            return Ok(());
        }
        let rebuilt = build_http(verify, &self.outgoing_proxy, None)?;
        *self.http.write().expect("http lock poisoned") = rebuilt;
        *current = verify;
        Ok(())
    }

    fn http(&self) -> reqwest::Client {
        self.http.read().expect("http lock poisoned").clone()
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/http-teleport/{path}", self.base_url)
    }

    fn authorized(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        req.bearer_auth(&self.api_key)
            .header("Ac-Agent", format!("ArmorCode/{}", self.agent_version))
    }

    /// Long-poll the control plane for the next task. The request timeout
    /// here is the inner 25 s; the caller wraps the call in the
    /// authoritative outer deadline.
    pub async fn get_task(&self) -> Result<FetchOutcome, ClientError> {
        let _permit = self.gate.admit().await?;

        let mut req = self
            .authorized(self.http().get(self.url("get-task")))
            .header(CONTENT_TYPE, "application/json")
            .query(&[
                ("agentId", self.agent_id.as_str()),
                ("agentVersion", self.agent_version.as_str()),
            ])
            .timeout(GET_TASK_TIMEOUT);
        if let Some(env) = &self.env_name {
            req = req.query(&[("envName", env.as_str())]);
        }

        let resp = req.send().await?;
        let status = resp.status().as_u16();
        match status {
            200 => {
                let envelope: GetTaskEnvelope = resp.json().await?;
                Ok(match envelope.data {
                    Some(task) => FetchOutcome::Task(Box::new(task)),
                    None => FetchOutcome::Empty,
                })
            }
            204 => Ok(FetchOutcome::Empty),
            s if s >= 500 => Ok(FetchOutcome::ServerError(s)),
            s => Ok(FetchOutcome::Other(s)),
        }
    }

    /// Post an inline result. Retries 429/504 and network failures; any
    /// other non-200 is permanent and surfaces as `Status` for the caller
    /// to log and drop.
    pub async fn put_result(&self, task: &Task) -> Result<(), ClientError> {
        with_retry("put-result", &self.policy, |_| async move {
            let _permit = match self.gate.admit().await {
                Ok(permit) => permit,
                Err(e) => {
                    return Attempt::Retry {
                        delay: None,
                        reason: e.to_string(),
                    };
                }
            };
            let send = self
                .authorized(self.http().post(self.url("put-result")))
                .json(task)
                .timeout(PUT_RESULT_TIMEOUT)
                .send()
                .await;
            match send {
                Ok(resp) => classify("put-result", resp).await,
                Err(e) => Attempt::Retry {
                    delay: None,
                    reason: format!("network error: {e}"),
                },
            }
        })
        .await?;
        debug!(task_id = %task.task_id, "result posted");
        Ok(())
    }

    /// Upload a large response body directly to the control plane: a `file`
    /// part streaming from disk plus the result JSON as the `task` part.
    pub async fn upload_result(
        &self,
        task: &Task,
        file_path: &std::path::Path,
        file_name: &str,
        mime: &'static str,
    ) -> Result<(), ClientError> {
        let task_json = serde_json::to_string(task)?;
        with_retry("upload-result", &self.policy, |_| {
            let task_json = task_json.clone();
            async move {
                let _permit = match self.gate.admit().await {
                    Ok(permit) => permit,
                    Err(e) => {
                        return Attempt::Retry {
                            delay: None,
                            reason: e.to_string(),
                        };
                    }
                };
                let form = match multipart_with_file(file_path, file_name, mime, task_json).await {
                    Ok(form) => form,
                    Err(e) => return Attempt::Fail(e),
                };
                let send = self
                    .authorized(self.http().post(self.url("upload-result")))
                    .multipart(form)
                    .timeout(UPLOAD_RESULT_TIMEOUT)
                    .send()
                    .await;
                match send {
                    Ok(resp) => classify("upload-result", resp).await,
                    Err(e) => Attempt::Retry {
                        delay: None,
                        reason: format!("network error: {e}"),
                    },
                }
            }
        })
        .await?;
        info!(task_id = %task.task_id, file = file_name, "artifact uploaded");
        Ok(())
    }

    /// Ask for a pre-signed PUT/GET pair for an out-of-band artifact.
    pub async fn upload_url(&self, file_name: &str) -> Result<UploadUrls, ClientError> {
        with_retry("upload-url", &self.policy, |_| async move {
            let _permit = match self.gate.admit().await {
                Ok(permit) => permit,
                Err(e) => {
                    return Attempt::Retry {
                        delay: None,
                        reason: e.to_string(),
                    };
                }
            };
            let send = self
                .authorized(self.http().get(self.url("upload-url")))
                .header(CONTENT_TYPE, "application/json")
                .query(&[("fileName", file_name)])
                .timeout(UPLOAD_URL_TIMEOUT)
                .send()
                .await;
            let resp = match send {
                Ok(resp) => resp,
                Err(e) => {
                    return Attempt::Retry {
                        delay: None,
                        reason: format!("network error: {e}"),
                    };
                }
            };
            match classify_status("upload-url", resp).await {
                Ok(resp) => match resp.json::<UploadUrlEnvelope>().await {
                    Ok(envelope) => match envelope.data {
                        Some(urls) => Attempt::Done(urls),
                        None => Attempt::Fail(ClientError::InvalidResponse {
                            endpoint: "upload-url",
                            detail: "no data in response".into(),
                        }),
                    },
                    Err(e) => Attempt::Fail(e.into()),
                },
                Err(attempt) => attempt,
            }
        })
        .await
    }

    /// Ship the zipped log directory. Nothing further is posted for a
    /// fetch-logs task, whatever the upload outcome.
    pub async fn upload_logs(
        &self,
        task: &Task,
        archive_path: &std::path::Path,
        archive_name: &str,
    ) -> Result<(), ClientError> {
        let task_json = serde_json::to_string(task)?;
        let mut url = self.url("upload-logs");
        if let Some(env) = &self.env_name {
            url = format!("{url}?envName={env}");
        }
        with_retry("upload-logs", &self.policy, |_| {
            let url = url.clone();
            let task_json = task_json.clone();
            async move {
                let _permit = match self.gate.admit().await {
                    Ok(permit) => permit,
                    Err(e) => {
                        return Attempt::Retry {
                            delay: None,
                            reason: e.to_string(),
                        };
                    }
                };
                let form = match multipart_with_file(
                    archive_path,
                    archive_name,
                    "application/gzip",
                    task_json,
                )
                .await
                {
                    Ok(form) => form,
                    Err(e) => return Attempt::Fail(e),
                };
                let send = self
                    .authorized(self.http().post(&url))
                    .multipart(form)
                    .timeout(UPLOAD_RESULT_TIMEOUT)
                    .send()
                    .await;
                match send {
                    Ok(resp) => classify("upload-logs", resp).await,
                    Err(e) => Attempt::Retry {
                        delay: None,
                        reason: format!("network error: {e}"),
                    },
                }
            }
        })
        .await
    }

    /// PUT an artifact to a pre-signed object URL. No bearer auth, no call
    /// gate: this is object storage, not the control plane. Content type
    /// and encoding are passed through from the target response.
    pub async fn put_object(
        &self,
        put_url: &str,
        file_path: &std::path::Path,
        content_type: Option<&str>,
        content_encoding: Option<&str>,
    ) -> Result<(), ClientError> {
        let file = tokio::fs::File::open(file_path).await?;
        let len = file.metadata().await?.len();

        let mut req = self
            .http()
            .put(put_url)
            .header(CONTENT_LENGTH, len)
            .body(reqwest::Body::wrap_stream(ReaderStream::new(file)))
            .timeout(OBJECT_PUT_TIMEOUT);
        if let Some(ct) = content_type {
            req = req.header(CONTENT_TYPE, ct);
        }
        if let Some(ce) = content_encoding {
            req = req.header(CONTENT_ENCODING, ce);
        }

        let resp = req.send().await?;
        if resp.status().is_success() {
            info!("file uploaded to object storage");
            Ok(())
        } else {
            Err(ClientError::Status {
                endpoint: "object-put",
                status: resp.status().as_u16(),
                body: resp.text().await.unwrap_or_default(),
            })
        }
    }
}

/// Build a client for the control-plane side: outgoing proxy, optional
/// certificate verification, rustls.
pub(crate) fn build_http(
    verify: bool,
    proxy: &teleport_model::ProxyConfig,
    connect_timeout: Option<Duration>,
) -> Result<reqwest::Client, ClientError> {
    let mut builder = reqwest::Client::builder().danger_accept_invalid_certs(!verify);
    if let Some(timeout) = connect_timeout {
        builder = builder.connect_timeout(timeout);
    }
    if let Some(url) = &proxy.http {
        builder = builder.proxy(reqwest::Proxy::http(url)?);
    }
    if let Some(url) = &proxy.https {
        builder = builder.proxy(reqwest::Proxy::https(url)?);
    }
    Ok(builder.build()?)
}

pub(crate) use build_http as build_http_client;

async fn multipart_with_file(
    path: &std::path::Path,
    file_name: &str,
    mime: &'static str,
    task_json: String,
) -> Result<Form, ClientError> {
    let file = tokio::fs::File::open(path).await?;
    let len = file.metadata().await?.len();
    let stream = reqwest::Body::wrap_stream(ReaderStream::new(file));
    let file_part = Part::stream_with_length(stream, len)
        .file_name(file_name.to_string())
        .mime_str(mime)?;
    let task_part = Part::text(task_json).mime_str("application/json")?;
    Ok(Form::new().part("file", file_part).part("task", task_part))
}

/// Shared response classification for the retryable call sites: 200 done,
/// 429/504 retry (with header/marker-driven delays for 429), anything else
/// permanent.
async fn classify(endpoint: &'static str, resp: reqwest::Response) -> Attempt<()> {
    match classify_status(endpoint, resp).await {
        Ok(_) => Attempt::Done(()),
        Err(attempt) => attempt,
    }
}

/// Like [`classify`] but hands the 200 response back to the caller for body
/// parsing. `Err` carries the retry/fail decision.
async fn classify_status<T>(
    endpoint: &'static str,
    resp: reqwest::Response,
) -> Result<reqwest::Response, Attempt<T>> {
    let status = resp.status().as_u16();
    match status {
        200 => Ok(resp),
        429 => {
            let retry_after = resp
                .headers()
                .get(RETRY_AFTER_HEADER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<i64>().ok());
            let body = resp.text().await.unwrap_or_default();
            let delay = delay_for_429(retry_after, &body);
            Err(Attempt::Retry {
                delay: Some(delay),
                reason: format!("{endpoint} rate limited (429)"),
            })
        }
        504 => Err(Attempt::Retry {
            delay: None,
            reason: format!("{endpoint} gateway timeout (504)"),
        }),
        s => {
            let body = resp.text().await.unwrap_or_default();
            warn!(endpoint, status = s, "permanent control-plane error");
            Err(Attempt::Fail(ClientError::Status {
                endpoint,
                status: s,
                body,
            }))
        }
    }
}
