use thiserror::Error;

use teleport_client::ClientError;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Client(#[from] ClientError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("get-task deadline exceeded")]
    FetchDeadline,

    #[error("worker task failed: {0}")]
    Worker(String),
}
