use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("http transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("unexpected status {status} from {endpoint}: {body}")]
    Status {
        endpoint: &'static str,
        status: u16,
        body: String,
    },

    #[error("invalid response from {endpoint}: {detail}")]
    InvalidResponse {
        endpoint: &'static str,
        detail: String,
    },

    #[error("{name} exhausted after {attempts} attempts")]
    RetriesExhausted {
        name: &'static str,
        attempts: usize,
    },

    #[error("control-plane concurrency gate timed out")]
    GateTimeout,

    #[error("invalid client configuration: {0}")]
    Config(String),

    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
