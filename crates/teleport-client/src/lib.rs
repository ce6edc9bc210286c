mod error;
pub use error::ClientError;

mod gate;
pub use gate::{CallGate, RateLimiter};

mod retry;
pub use retry::{Attempt, CONCURRENT_429_MARKER, RETRY_AFTER_HEADER, RetryPolicy, with_retry};

mod api;
pub use api::{ControlPlaneClient, FetchOutcome};

mod target;
pub use target::{TargetClient, TargetRequest};
