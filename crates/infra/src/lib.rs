//! Infrastructure layer: in-memory adapters for the resilience engine's
//! ports and the job executor that drives them.

pub mod alerting;
pub mod jobs;
pub mod store;

pub use alerting::{AdminAlerting, RecordingAlerting};
pub use jobs::{InMemoryJobQueue, JobExecutor, JobExecutorConfig, JobResult};
pub use store::InMemoryResilienceStore;
