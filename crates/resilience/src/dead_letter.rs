//! Dead-letter records, eligibility rules and the in-memory working set.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use angelhub_core::{DeadLetterId, JobId};

use crate::classification::{ErrorCategory, ErrorContext, ErrorSeverity};
use crate::ports::FailedJob;

/// Lifecycle of a dead-letter record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeadLetterStatus {
    /// Waiting for a sweep or an operator.
    #[default]
    Pending,
    /// Re-enqueued; `retried_job_id` points at the new job.
    Retried,
    /// Gave up after too many failed re-enqueues.
    Exhausted,
}

/// A job that ran out of retries or was blocked by its circuit breaker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterJob {
    pub id: DeadLetterId,
    pub original_job_id: JobId,
    pub queue: String,
    pub job_name: String,
    pub payload: JsonValue,
    /// Creation time of the original job; re-drives carry it forward.
    pub job_created_at: DateTime<Utc>,
    pub error: String,
    pub context: ErrorContext,
    /// Attempts the original job made.
    pub retry_count: u32,
    /// Attempt budget of the original job's strategy.
    pub max_retries: u32,
    pub dead_lettered_at: DateTime<Utc>,
    pub can_retry: bool,
    pub retry_after: Option<DateTime<Utc>>,
    pub status: DeadLetterStatus,
    pub retried_job_id: Option<JobId>,
    pub retried_at: Option<DateTime<Utc>>,
    pub retry_failed_at: Option<DateTime<Utc>>,
    pub retry_error: Option<String>,
    /// Failed sweep re-enqueues so far.
    pub sweep_attempts: u32,
}

impl DeadLetterJob {
    /// Attempt budget for the re-enqueued job: `max(1, max_retries - retry_count)`.
    pub fn redrive_attempts(&self) -> u32 {
        self.max_retries.saturating_sub(self.retry_count).max(1)
    }

    /// Still waiting and eligible for an automatic re-drive.
    pub fn is_pending_retriable(&self) -> bool {
        self.status == DeadLetterStatus::Pending && self.can_retry
    }

    /// Due for an automatic re-drive at `now`?
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.is_pending_retriable() && self.retry_after.is_some_and(|at| at <= now)
    }

    pub fn apply(&mut self, patch: &DeadLetterPatch) {
        if let Some(status) = patch.status {
            self.status = status;
        }
        if let Some(id) = patch.retried_job_id {
            self.retried_job_id = Some(id);
        }
        if let Some(at) = patch.retried_at {
            self.retried_at = Some(at);
        }
        if let Some(at) = patch.retry_failed_at {
            self.retry_failed_at = Some(at);
        }
        if let Some(err) = &patch.retry_error {
            self.retry_error = Some(err.clone());
        }
        if let Some(n) = patch.sweep_attempts {
            self.sweep_attempts = n;
        }
    }
}

/// Partial update of a persisted dead-letter record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterPatch {
    pub status: Option<DeadLetterStatus>,
    pub retried_job_id: Option<JobId>,
    pub retried_at: Option<DateTime<Utc>>,
    pub retry_failed_at: Option<DateTime<Utc>>,
    pub retry_error: Option<String>,
    pub sweep_attempts: Option<u32>,
}

impl DeadLetterPatch {
    pub fn retried(job_id: JobId, at: DateTime<Utc>) -> Self {
        Self {
            status: Some(DeadLetterStatus::Retried),
            retried_job_id: Some(job_id),
            retried_at: Some(at),
            ..Default::default()
        }
    }

    pub fn retry_failed(error: impl Into<String>, at: DateTime<Utc>, sweep_attempts: u32) -> Self {
        Self {
            retry_failed_at: Some(at),
            retry_error: Some(error.into()),
            sweep_attempts: Some(sweep_attempts),
            ..Default::default()
        }
    }

    pub fn exhausted(mut self) -> Self {
        self.status = Some(DeadLetterStatus::Exhausted);
        self
    }
}

/// Rules deciding whether (and when) a demoted job may be re-driven.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeadLetterPolicy {
    /// Jobs older than this are never re-driven automatically.
    pub max_job_age: Duration,
}

impl Default for DeadLetterPolicy {
    fn default() -> Self {
        Self {
            max_job_age: Duration::from_secs(24 * 60 * 60),
        }
    }
}

impl DeadLetterPolicy {
    /// Validation failures and critical system failures are never retried,
    /// nor is anything older than `max_job_age`.
    pub fn can_retry(&self, context: &ErrorContext, job_created_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        if context.category == ErrorCategory::Validation {
            return false;
        }
        if context.category == ErrorCategory::System && context.severity == ErrorSeverity::Critical {
            return false;
        }

        let age = (now - job_created_at).to_std().unwrap_or(Duration::ZERO);
        age <= self.max_job_age
    }

    /// Category base delay, doubled for critical failures.
    pub fn retry_delay(&self, context: &ErrorContext) -> Duration {
        let minutes = match context.category {
            ErrorCategory::Network => 5,
            ErrorCategory::ExternalService => 10,
            ErrorCategory::Database => 2,
            _ => 15,
        };
        let factor = if context.severity == ErrorSeverity::Critical { 2 } else { 1 };
        Duration::from_secs(minutes * 60 * factor)
    }

    /// Build the dead-letter record for `job`.
    pub fn demote(
        &self,
        job: &FailedJob,
        error: &str,
        context: ErrorContext,
        max_retries: u32,
        now: DateTime<Utc>,
    ) -> DeadLetterJob {
        let can_retry = self.can_retry(&context, job.created_at, now);
        let retry_after = can_retry.then(|| {
            now + chrono::Duration::from_std(self.retry_delay(&context)).unwrap_or_default()
        });

        DeadLetterJob {
            id: DeadLetterId::new(),
            original_job_id: job.id,
            queue: job.queue.clone(),
            job_name: job.name.clone(),
            payload: job.payload.clone(),
            job_created_at: job.created_at,
            error: error.to_string(),
            context,
            retry_count: job.attempts_made,
            max_retries,
            dead_lettered_at: now,
            can_retry,
            retry_after,
            status: DeadLetterStatus::Pending,
            retried_job_id: None,
            retried_at: None,
            retry_failed_at: None,
            retry_error: None,
            sweep_attempts: 0,
        }
    }
}

/// In-memory cache of retriable pending dead letters, shared by the demotion
/// path and the sweep.
#[derive(Debug, Default)]
pub struct DeadLetterWorkingSet {
    entries: Mutex<HashMap<DeadLetterId, DeadLetterJob>>,
}

impl DeadLetterWorkingSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, job: DeadLetterJob) {
        self.lock().insert(job.id, job);
    }

    pub fn get(&self, id: DeadLetterId) -> Option<DeadLetterJob> {
        self.lock().get(&id).cloned()
    }

    pub fn remove(&self, id: DeadLetterId) -> Option<DeadLetterJob> {
        self.lock().remove(&id)
    }

    /// Apply `patch` to the cached copy, if present.
    pub fn apply(&self, id: DeadLetterId, patch: &DeadLetterPatch) {
        if let Some(job) = self.lock().get_mut(&id) {
            job.apply(patch);
        }
    }

    /// Entries due at `now`, oldest demotion first.
    pub fn due(&self, now: DateTime<Utc>) -> Vec<DeadLetterJob> {
        let mut due: Vec<_> = self.lock().values().filter(|j| j.is_due(now)).cloned().collect();
        due.sort_by_key(|j| j.dead_lettered_at);
        due
    }

    /// Replace the whole cache (used when hydrating from the store).
    pub fn replace_all(&self, jobs: impl IntoIterator<Item = DeadLetterJob>) {
        let mut entries = self.lock();
        entries.clear();
        entries.extend(jobs.into_iter().map(|j| (j.id, j)));
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<DeadLetterId, DeadLetterJob>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}
