mod error;
pub use error::CoreError;

mod spool;
pub use spool::{TaskSpool, archive_dir_gz};

mod applier;
pub use applier::ConfigApplier;

mod executor;
pub use executor::{Executor, effective_deadline};

mod uploader;
pub use uploader::{ArtifactOutcome, ResultUploader};

mod fetcher;
pub use fetcher::TaskFetcher;

mod pool;
pub use pool::{ExecRegistry, PoolSlots, WorkerPool};

mod watchdog;
pub use watchdog::{Liveness, Watchdog};

mod agent;
pub use agent::{Agent, AgentState};
