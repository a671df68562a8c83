//! `angelhub-resilience`
//!
//! **Responsibility:** what happens after an asynchronous job fails.
//!
//! - Classify the failure ([`classification`])
//! - Pick a retry strategy and backoff delay ([`strategy`])
//! - Consult the queue's circuit breaker ([`circuit_breaker`])
//! - Retry, or demote to the dead-letter store and re-drive later ([`dead_letter`])
//!
//! The engine depends only on the collaborator traits in [`ports`]; queues,
//! storage and alert delivery are supplied by the caller.

pub mod circuit_breaker;
pub mod classification;
pub mod config;
pub mod dead_letter;
pub mod engine;
pub mod error;
pub mod ports;
pub mod strategy;
pub mod workers;

pub use circuit_breaker::{
    BreakerConfig, BreakerSweepReport, CircuitBreakerRegistry, CircuitBreakerState, CircuitState,
};
pub use classification::{ErrorCategory, ErrorContext, ErrorSeverity, FailureContext, classify, severity};
pub use config::{ConfigError, ResilienceConfig};
pub use dead_letter::{DeadLetterJob, DeadLetterPatch, DeadLetterPolicy, DeadLetterStatus};
pub use engine::{DeadLetterSweepReport, ResilienceEngine};
pub use error::ResilienceError;
pub use ports::{
    AlertError, Alerting, BackoffHint, EnqueueOptions, FailedJob, JobErrorRecord, JobQueue, PersistentStore,
    QueueCounts, QueueError, StoreError,
};
pub use strategy::{
    BackoffKind, FixedJitter, JitterSource, RetryStrategy, RetryStrategyPatch, RetryStrategyTable,
    ThreadRngJitter, compute_delay, queues,
};
pub use workers::{ResilienceWorkers, WorkerHandle, WorkerSpawnError};
