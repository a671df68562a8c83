//! Collaborator boundaries consumed by the engine.
//!
//! The engine never talks to a broker, database or mail provider directly.
//! Callers inject implementations of these traits (the infra crate ships
//! in-memory ones for tests and local runs).

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use angelhub_core::{DeadLetterId, JobId};

use crate::classification::ErrorContext;
use crate::dead_letter::{DeadLetterJob, DeadLetterPatch};
use crate::strategy::{BackoffKind, RetryStrategy};

/// A job execution that just failed, as handed over by the job runner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedJob {
    pub id: JobId,
    pub queue: String,
    pub name: String,
    pub payload: JsonValue,
    /// Attempts made so far, including the one that just failed.
    pub attempts_made: u32,
    /// When the job was first created (drives dead-letter age checks).
    pub created_at: DateTime<Utc>,
    /// Total attempts this job may make, counted like `attempts_made`.
    /// `None` leaves the queue's retry strategy as the only limit.
    pub attempt_budget: Option<u32>,
}

impl FailedJob {
    pub fn new(
        id: JobId,
        queue: impl Into<String>,
        name: impl Into<String>,
        payload: JsonValue,
        attempts_made: u32,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            queue: queue.into(),
            name: name.into(),
            payload,
            attempts_made,
            created_at,
            attempt_budget: None,
        }
    }

    pub fn with_attempt_budget(mut self, budget: u32) -> Self {
        self.attempt_budget = Some(budget);
        self
    }
}

/// Backoff hint forwarded to the queue so its own retry bookkeeping matches ours.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffHint {
    pub kind: BackoffKind,
    pub delay: Duration,
}

impl From<&RetryStrategy> for BackoffHint {
    fn from(strategy: &RetryStrategy) -> Self {
        Self {
            kind: strategy.backoff,
            delay: strategy.initial_delay,
        }
    }
}

/// Options for [`JobQueue::enqueue`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnqueueOptions {
    /// Attempt budget for the new job (>= 1).
    pub attempts: u32,
    pub backoff: Option<BackoffHint>,
    /// Delay before the job becomes runnable.
    pub delay: Duration,
    /// Attempts already spent by the job this one replaces.
    pub prior_attempts: u32,
    /// Creation time of the job this one replaces; the queue keeps it as the
    /// new job's `created_at` so age limits span retries and re-drives.
    pub origin: Option<DateTime<Utc>>,
}

impl EnqueueOptions {
    pub fn attempts(attempts: u32) -> Self {
        Self {
            attempts: attempts.max(1),
            backoff: None,
            delay: Duration::ZERO,
            prior_attempts: 0,
            origin: None,
        }
    }

    pub fn with_backoff(mut self, backoff: BackoffHint) -> Self {
        self.backoff = Some(backoff);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_prior_attempts(mut self, prior_attempts: u32) -> Self {
        self.prior_attempts = prior_attempts;
        self
    }

    pub fn with_origin(mut self, created_at: DateTime<Utc>) -> Self {
        self.origin = Some(created_at);
        self
    }
}

/// Per-queue job counts (diagnostics only).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounts {
    pub waiting: usize,
    pub active: usize,
    pub completed: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum QueueError {
    #[error("unknown queue: {0}")]
    UnknownQueue(String),
    #[error("queue is paused: {0}")]
    Paused(String),
    #[error("queue backend error: {0}")]
    Backend(String),
}

/// Job queue the engine re-enqueues onto.
pub trait JobQueue: Send + Sync {
    fn enqueue(
        &self,
        queue: &str,
        job_name: &str,
        payload: JsonValue,
        options: EnqueueOptions,
    ) -> Result<JobId, QueueError>;

    fn is_paused(&self, queue: &str) -> Result<bool, QueueError>;

    fn counts(&self, queue: &str) -> Result<QueueCounts, QueueError>;
}

/// One recorded failure (retried or not).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobErrorRecord {
    pub id: Uuid,
    pub job_id: JobId,
    pub queue: String,
    pub job_name: String,
    pub error: String,
    pub context: ErrorContext,
    pub attempt: u32,
    pub will_retry: bool,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub recorded_at: DateTime<Utc>,
}

impl JobErrorRecord {
    pub fn new(
        job: &FailedJob,
        error: &str,
        context: &ErrorContext,
        next_retry_at: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            job_id: job.id,
            queue: job.queue.clone(),
            job_name: job.name.clone(),
            error: error.to_string(),
            context: context.clone(),
            attempt: job.attempts_made,
            will_retry: next_retry_at.is_some(),
            next_retry_at,
            recorded_at: context.timestamp,
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("dead-letter job not found: {0}")]
    NotFound(DeadLetterId),
    #[error("dead-letter job already exists: {0}")]
    AlreadyExists(DeadLetterId),
    #[error("storage error: {0}")]
    Storage(String),
}

/// Durable storage for failure records and dead-letter jobs.
///
/// The store is the source of truth for dead letters; the engine only caches
/// retriable entries in memory.
pub trait PersistentStore: Send + Sync {
    fn save_job_error(&self, record: &JobErrorRecord) -> Result<(), StoreError>;

    fn save_dead_letter_job(&self, job: &DeadLetterJob) -> Result<(), StoreError>;

    fn update_dead_letter_job(&self, id: DeadLetterId, patch: &DeadLetterPatch) -> Result<(), StoreError>;

    /// Most recent first.
    fn list_dead_letter_jobs(&self, limit: usize) -> Result<Vec<DeadLetterJob>, StoreError>;

    /// Pending entries with `can_retry` set, oldest demotion first.
    fn list_pending_dead_letter_jobs(&self, limit: usize) -> Result<Vec<DeadLetterJob>, StoreError>;

    fn find_dead_letter_job(&self, id: DeadLetterId) -> Result<Option<DeadLetterJob>, StoreError>;
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("alert delivery failed: {0}")]
pub struct AlertError(pub String);

/// Outbound alerting for critical failures. Best effort: errors are logged by
/// the engine and never propagated.
pub trait Alerting: Send + Sync {
    fn notify_critical(&self, context: &ErrorContext) -> Result<(), AlertError>;
}
