use std::collections::HashMap;
use std::sync::{Mutex, RwLock};
use std::time::Duration;

use reqwest::Method;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use tracing::warn;

use teleport_model::RuntimeConfig;

use crate::api::build_http_client;
use crate::error::ClientError;

/// Connect timeout for target requests; the read timeout is the per-task
/// deadline and travels with each request.
const TARGET_CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// One target call as the executor issues it.
#[derive(Debug)]
pub struct TargetRequest {
    pub method: String,
    pub url: String,
    pub headers: HashMap<String, String>,
    pub body: Option<Vec<u8>>,
    pub read_timeout: Duration,
}

/// HTTP client for the "inward" side: the internal endpoints only this
/// agent can reach. Routed through the inward proxy and rebuilt when
/// `globalConfig` flips certificate verification.
pub struct TargetClient {
    http: RwLock<reqwest::Client>,
    verify_cert: Mutex<bool>,
    inward_proxy: teleport_model::ProxyConfig,
}

impl TargetClient {
    pub fn new(cfg: &RuntimeConfig) -> Result<Self, ClientError> {
        let http = build_http_client(
            cfg.verify_cert,
            &cfg.inward_proxy,
            Some(TARGET_CONNECT_TIMEOUT),
        )?;
        Ok(Self {
            http: RwLock::new(http),
            verify_cert: Mutex::new(cfg.verify_cert),
            inward_proxy: cfg.inward_proxy.clone(),
        })
    }

    pub fn set_verify(&self, verify: bool) -> Result<(), ClientError> {
        let mut current = self.verify_cert.lock().expect("verify lock poisoned");
        if *current == verify {
            return Ok(());
        }
        let rebuilt = build_http_client(verify, &self.inward_proxy, Some(TARGET_CONNECT_TIMEOUT))?;
        *self.http.write().expect("http lock poisoned") = rebuilt;
        *current = verify;
        Ok(())
    }

    /// Issue the call in streaming mode: the response body is consumed
    /// chunk by chunk by the caller.
    pub async fn execute(&self, request: TargetRequest) -> Result<reqwest::Response, ClientError> {
        let method = Method::from_bytes(request.method.to_uppercase().as_bytes())
            .map_err(|_| ClientError::Config(format!("invalid method: {}", request.method)))?;

        let http = self.http.read().expect("http lock poisoned").clone();
        let mut req = http
            .request(method, &request.url)
            .headers(header_map(&request.headers))
            .timeout(request.read_timeout);
        if let Some(body) = request.body {
            req = req.body(body);
        }

        Ok(req.send().await?)
    }
}

/// Pass-through header conversion. Headers that are not representable on
/// the wire are skipped with a warning rather than failing the task.
fn header_map(headers: &HashMap<String, String>) -> HeaderMap {
    let mut map = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                map.insert(name, value);
            }
            _ => warn!(header = %name, "skipping unrepresentable request header"),
        }
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_map_skips_invalid_names() {
        let mut headers = HashMap::new();
        headers.insert("Accept".to_string(), "application/json".to_string());
        headers.insert("bad header\n".to_string(), "x".to_string());
        let map = header_map(&headers);
        assert_eq!(map.len(), 1);
        assert_eq!(map.get("accept").unwrap(), "application/json");
    }
}
