//! Background jobs: an in-memory queue and an executor that hands every
//! outcome to the resilience engine.
//!
//! - `InMemoryJobQueue`: implements the engine's `JobQueue` port, plus
//!   claiming, pausing and status bookkeeping for local runs
//! - `JobExecutor`: runs handlers by job name, reports success/failure

pub mod executor;
pub mod queue;
pub mod types;

pub use executor::{ExecutionOutcome, ExecutorStats, JobExecutor, JobExecutorConfig, JobExecutorHandle, JobHandler};
pub use queue::InMemoryJobQueue;
pub use types::{JobAttemptRecord, JobResult, QueuedJob, QueuedJobStatus};
