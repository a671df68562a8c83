//! Queued job types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use angelhub_core::JobId;
use angelhub_resilience::{BackoffHint, FailedJob, FailureContext};

/// Job execution status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueuedJobStatus {
    /// Queued, waiting to be picked up
    Waiting,
    /// Currently being executed
    Active,
    /// Completed successfully
    Completed,
    /// Last execution failed; recovery is up to the resilience engine
    Failed { error: String },
}

impl QueuedJobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, QueuedJobStatus::Completed | QueuedJobStatus::Failed { .. })
    }
}

/// A job held by the in-memory queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedJob {
    pub id: JobId,
    pub queue: String,
    /// Job name, used to route to a handler
    pub name: String,
    pub payload: JsonValue,
    pub status: QueuedJobStatus,
    /// Attempt budget granted at enqueue time
    pub attempts: u32,
    /// Attempts already spent by the jobs this one replaces
    pub prior_attempts: u32,
    /// Attempts made so far, including `prior_attempts`
    pub attempts_made: u32,
    pub backoff: Option<BackoffHint>,
    /// Creation time of the original job (kept across retries and re-drives)
    pub created_at: DateTime<Utc>,
    pub enqueued_at: DateTime<Utc>,
    /// Earliest time the job may run
    pub run_at: DateTime<Utc>,
    pub history: Vec<JobAttemptRecord>,
}

/// Record of one execution attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobAttemptRecord {
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub success: bool,
    pub error: Option<String>,
    pub duration_ms: u64,
}

impl QueuedJob {
    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.status == QueuedJobStatus::Waiting && self.run_at <= now
    }

    pub(crate) fn mark_active(&mut self) {
        self.status = QueuedJobStatus::Active;
        self.attempts_made += 1;
    }

    pub(crate) fn record_attempt(&mut self, started_at: DateTime<Utc>, finished_at: DateTime<Utc>, error: Option<String>) {
        self.history.push(JobAttemptRecord {
            attempt: self.attempts_made,
            started_at,
            finished_at,
            success: error.is_none(),
            error: error.clone(),
            duration_ms: (finished_at - started_at).num_milliseconds().max(0) as u64,
        });
        self.status = match error {
            None => QueuedJobStatus::Completed,
            Some(error) => QueuedJobStatus::Failed { error },
        };
    }

    /// Highest `attempts_made` this job may reach.
    pub fn attempt_budget(&self) -> u32 {
        self.prior_attempts.saturating_add(self.attempts)
    }

    /// View of this job as handed to the resilience engine after a failure.
    pub fn as_failed(&self) -> FailedJob {
        FailedJob::new(
            self.id,
            self.queue.clone(),
            self.name.clone(),
            self.payload.clone(),
            self.attempts_made,
            self.created_at,
        )
        .with_attempt_budget(self.attempt_budget())
    }
}

/// Result of running a job handler.
#[derive(Debug)]
pub enum JobResult {
    /// Job completed successfully
    Success,
    /// Job failed; the optional context carries correlation ids for the engine
    Failure {
        error: String,
        context: Option<FailureContext>,
    },
}

impl JobResult {
    pub fn failure(error: impl Into<String>) -> Self {
        Self::Failure {
            error: error.into(),
            context: None,
        }
    }

    pub fn failure_with(error: impl Into<String>, context: FailureContext) -> Self {
        Self::Failure {
            error: error.into(),
            context: Some(context),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn job(now: DateTime<Utc>) -> QueuedJob {
        QueuedJob {
            id: JobId::new(),
            queue: "email".to_string(),
            name: "welcome-email".to_string(),
            payload: serde_json::json!({"to": "investor@example.com"}),
            status: QueuedJobStatus::Waiting,
            attempts: 3,
            prior_attempts: 1,
            attempts_made: 1,
            backoff: None,
            created_at: now - Duration::hours(2),
            enqueued_at: now,
            run_at: now + Duration::seconds(5),
            history: Vec::new(),
        }
    }

    #[test]
    fn readiness_respects_run_at() {
        let now = Utc::now();
        let j = job(now);
        assert!(!j.is_ready(now));
        assert!(j.is_ready(now + Duration::seconds(5)));
    }

    #[test]
    fn attempt_lifecycle() {
        let now = Utc::now();
        let mut j = job(now);

        j.mark_active();
        assert_eq!(j.attempts_made, 2);
        assert!(!j.is_ready(now + Duration::hours(1)));

        j.record_attempt(now, now + Duration::milliseconds(40), Some("smtp timeout".to_string()));
        assert!(j.status.is_terminal());
        assert_eq!(j.history[0].duration_ms, 40);
        assert!(!j.history[0].success);

        let failed = j.as_failed();
        assert_eq!(failed.attempts_made, 2);
        assert_eq!(failed.queue, "email");
        assert_eq!(failed.attempt_budget, Some(4));
        assert_eq!(failed.created_at, now - Duration::hours(2));
    }
}
