use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Bodies at or below this size travel base64-encoded inside the result
/// JSON; anything larger is uploaded out of band as an artifact.
pub const MAX_INLINE_BYTES: u64 = 1024 * 500;

/// Prefix the control plane uses to classify agent-side failures without
/// parsing free-form text.
pub const AGENT_ERROR_PREFIX: &str = "Agent Side Error: ";

/// An HTTP request descriptor pulled from the control plane.
///
/// The same value is mutated into the result: the executor fills the
/// response fields and the whole object is posted back. `task_id` is never
/// rewritten. Fields the agent does not interpret are kept in `extra` and
/// travel back to the control plane untouched.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub task_id: String,
    #[serde(default)]
    pub method: String,
    #[serde(default)]
    pub url: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub request_headers: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiry_ts_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub global_config: Option<GlobalConfigPatch>,
    /// Agent version, stamped on receipt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    // Response side, filled during execution.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_headers: Option<HashMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_base64: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_zipped: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub s3_url: Option<String>,

    #[serde(flatten)]
    pub extra: HashMap<String, Value>,
}

/// Raw `globalConfig` payload as it appears inside a task. Parsed into a
/// typed [`crate::GlobalConfig`] before application.
pub type GlobalConfigPatch = HashMap<String, Value>;

impl Task {
    /// Attach a small body inline. Clears any artifact URL so the two body
    /// carriers stay mutually exclusive.
    pub fn set_inline_output(&mut self, base64_body: String) {
        self.output = Some(base64_body);
        self.response_base64 = Some(true);
        self.s3_url = None;
    }

    /// Point the result at a pre-signed object URL. Clears the inline body.
    pub fn set_artifact_url(&mut self, get_url: String) {
        self.s3_url = Some(get_url);
        self.output = None;
        self.response_base64 = None;
    }

    /// Convert the task into an agent-side error result. The prefix lets the
    /// control plane classify the failure without parsing the message.
    pub fn set_agent_error(&mut self, detail: impl std::fmt::Display) {
        self.status_code = Some(500);
        self.output = Some(format!("{AGENT_ERROR_PREFIX}{detail}"));
        self.response_base64 = None;
        self.response_zipped = None;
        self.s3_url = None;
    }

    /// Log-collection tasks are recognized by both the URL and the task id.
    pub fn is_fetch_logs(&self) -> bool {
        self.url.contains("agent/fetch-logs") && self.task_id.contains("fetchLogs")
    }
}

/// `GET get-task` response body.
#[derive(Debug, Clone, Deserialize)]
pub struct GetTaskEnvelope {
    #[serde(default)]
    pub data: Option<Task>,
}

/// `GET upload-url` response body.
#[derive(Debug, Clone, Deserialize)]
pub struct UploadUrlEnvelope {
    #[serde(default)]
    pub data: Option<UploadUrls>,
}

/// Pre-signed object-storage URL pair: one-shot PUT plus the GET URL that is
/// handed back to the control plane in the result.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadUrls {
    pub put_url: String,
    pub get_url: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserializes_wire_task() {
        let raw = r#"{
            "taskId": "t1",
            "method": "GET",
            "url": "http://svc/x",
            "requestHeaders": {"Accept": "application/json"},
            "expiryTsMs": 1700000000000,
            "tenant": "acme"
        }"#;
        let task: Task = serde_json::from_str(raw).expect("valid task");
        assert_eq!(task.task_id, "t1");
        assert_eq!(task.method, "GET");
        assert_eq!(task.expiry_ts_ms, Some(1_700_000_000_000));
        // Unknown fields survive the round trip.
        assert_eq!(task.extra.get("tenant"), Some(&Value::from("acme")));
    }

    #[test]
    fn result_fields_are_omitted_until_set() {
        let task = Task {
            task_id: "t1".into(),
            method: "GET".into(),
            url: "http://svc/x".into(),
            ..Default::default()
        };
        let json = serde_json::to_value(&task).unwrap();
        assert!(json.get("output").is_none());
        assert!(json.get("statusCode").is_none());
        assert!(json.get("responseBase64").is_none());
    }

    #[test]
    fn inline_and_artifact_carriers_are_exclusive() {
        let mut task = Task::default();
        task.set_inline_output("b2s=".into());
        task.set_artifact_url("https://bucket/obj".into());
        assert!(task.output.is_none());
        assert!(task.response_base64.is_none());
        assert_eq!(task.s3_url.as_deref(), Some("https://bucket/obj"));

        task.set_inline_output("b2s=".into());
        assert!(task.s3_url.is_none());
        assert_eq!(task.response_base64, Some(true));
    }

    #[test]
    fn agent_error_keeps_task_id_and_sets_prefix() {
        let mut task = Task {
            task_id: "t9".into(),
            ..Default::default()
        };
        task.set_agent_error("Network error: connection refused");
        assert_eq!(task.task_id, "t9");
        assert_eq!(task.status_code, Some(500));
        assert!(
            task.output
                .as_deref()
                .unwrap()
                .starts_with("Agent Side Error: Network error: ")
        );
    }

    #[test]
    fn fetch_logs_requires_both_markers() {
        let mut task = Task {
            task_id: "fetchLogs-1".into(),
            url: "http://cp/agent/fetch-logs".into(),
            ..Default::default()
        };
        assert!(task.is_fetch_logs());
        task.task_id = "t1".into();
        assert!(!task.is_fetch_logs());
    }
}
