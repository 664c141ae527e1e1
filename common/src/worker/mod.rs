// Worker side of the refresh pipeline

pub mod executor;
pub mod pool;
pub mod reconcile;
pub mod supervisor;

pub use executor::{RefreshExecutor, RefreshOutcome};
pub use pool::{WorkerPool, WorkerPoolConfig};
pub use supervisor::{AttemptReport, Supervisor};
