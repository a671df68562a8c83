//! In-memory job queue for tests and local runs.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use tracing::{debug, info};

use angelhub_core::{Clock, JobId, SystemClock};
use angelhub_resilience::{EnqueueOptions, JobQueue, QueueCounts, QueueError};

use super::types::{QueuedJob, QueuedJobStatus};

#[derive(Debug)]
pub struct InMemoryJobQueue {
    clock: Arc<dyn Clock>,
    jobs: RwLock<HashMap<JobId, QueuedJob>>,
    paused: RwLock<HashSet<String>>,
    /// When set, only these queue names accept jobs.
    known_queues: Option<HashSet<String>>,
    /// When set, every enqueue fails with this backend error.
    enqueue_failure: RwLock<Option<String>>,
    enqueue_calls: AtomicU64,
}

impl InMemoryJobQueue {
    pub fn new() -> Self {
        Self {
            clock: Arc::new(SystemClock),
            jobs: RwLock::new(HashMap::new()),
            paused: RwLock::new(HashSet::new()),
            known_queues: None,
            enqueue_failure: RwLock::new(None),
            enqueue_calls: AtomicU64::new(0),
        }
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Reject enqueues onto any queue not listed here.
    pub fn with_queues<I, S>(mut self, queues: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.known_queues = Some(queues.into_iter().map(Into::into).collect());
        self
    }

    pub fn pause(&self, queue: &str) {
        self.paused.write().unwrap_or_else(|e| e.into_inner()).insert(queue.to_string());
        info!(queue, "queue paused");
    }

    pub fn resume(&self, queue: &str) {
        self.paused.write().unwrap_or_else(|e| e.into_inner()).remove(queue);
        info!(queue, "queue resumed");
    }

    /// Make every subsequent enqueue fail (`Some`) or succeed again (`None`).
    pub fn set_enqueue_failure(&self, error: Option<String>) {
        *self.enqueue_failure.write().unwrap_or_else(|e| e.into_inner()) = error;
    }

    /// Total enqueue calls, including rejected ones.
    pub fn enqueue_calls(&self) -> u64 {
        self.enqueue_calls.load(Ordering::SeqCst)
    }

    pub fn get(&self, id: JobId) -> Option<QueuedJob> {
        self.jobs.read().unwrap_or_else(|e| e.into_inner()).get(&id).cloned()
    }

    /// Jobs on `queue`, oldest first.
    pub fn jobs_in(&self, queue: &str) -> Vec<QueuedJob> {
        let jobs = self.jobs.read().unwrap_or_else(|e| e.into_inner());
        let mut result: Vec<_> = jobs.values().filter(|j| j.queue == queue).cloned().collect();
        result.sort_by_key(|j| (j.enqueued_at, j.id));
        result
    }

    /// Claim the oldest ready job, optionally restricted to one queue.
    /// Paused queues are never claimed from.
    pub fn claim_next(&self, queue: Option<&str>) -> Option<QueuedJob> {
        let now = self.clock.now();
        let paused = self.paused.read().unwrap_or_else(|e| e.into_inner());
        let mut jobs = self.jobs.write().unwrap_or_else(|e| e.into_inner());

        let next_id = jobs
            .values()
            .filter(|j| {
                j.is_ready(now) && !paused.contains(&j.queue) && queue.is_none_or(|q| j.queue == q)
            })
            .min_by_key(|j| (j.run_at, j.enqueued_at, j.id))
            .map(|j| j.id)?;

        let job = jobs.get_mut(&next_id)?;
        job.mark_active();
        Some(job.clone())
    }

    /// Record the outcome of an active job.
    pub fn finish(&self, id: JobId, started_at: DateTime<Utc>, error: Option<String>) {
        let finished_at = self.clock.now();
        let mut jobs = self.jobs.write().unwrap_or_else(|e| e.into_inner());
        if let Some(job) = jobs.get_mut(&id) {
            job.record_attempt(started_at, finished_at, error);
        }
    }

    fn check_queue(&self, queue: &str) -> Result<(), QueueError> {
        match &self.known_queues {
            Some(known) if !known.contains(queue) => Err(QueueError::UnknownQueue(queue.to_string())),
            _ => Ok(()),
        }
    }
}

impl Default for InMemoryJobQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl JobQueue for InMemoryJobQueue {
    fn enqueue(
        &self,
        queue: &str,
        job_name: &str,
        payload: JsonValue,
        options: EnqueueOptions,
    ) -> Result<JobId, QueueError> {
        self.enqueue_calls.fetch_add(1, Ordering::SeqCst);
        self.check_queue(queue)?;
        if let Some(error) = self.enqueue_failure.read().unwrap_or_else(|e| e.into_inner()).clone() {
            return Err(QueueError::Backend(error));
        }

        let now = self.clock.now();
        let job = QueuedJob {
            id: JobId::new(),
            queue: queue.to_string(),
            name: job_name.to_string(),
            payload,
            status: QueuedJobStatus::Waiting,
            attempts: options.attempts,
            prior_attempts: options.prior_attempts,
            attempts_made: options.prior_attempts,
            backoff: options.backoff,
            created_at: options.origin.unwrap_or(now),
            enqueued_at: now,
            run_at: now + chrono::Duration::from_std(options.delay).unwrap_or_default(),
            history: Vec::new(),
        };
        let id = job.id;

        self.jobs.write().unwrap_or_else(|e| e.into_inner()).insert(id, job);
        debug!(queue, job_name, job_id = %id, delay_ms = options.delay.as_millis() as u64, "job enqueued");
        Ok(id)
    }

    fn is_paused(&self, queue: &str) -> Result<bool, QueueError> {
        self.check_queue(queue)?;
        Ok(self.paused.read().unwrap_or_else(|e| e.into_inner()).contains(queue))
    }

    fn counts(&self, queue: &str) -> Result<QueueCounts, QueueError> {
        self.check_queue(queue)?;
        let jobs = self.jobs.read().unwrap_or_else(|e| e.into_inner());

        let mut counts = QueueCounts::default();
        for job in jobs.values().filter(|j| j.queue == queue) {
            match &job.status {
                QueuedJobStatus::Waiting => counts.waiting += 1,
                QueuedJobStatus::Active => counts.active += 1,
                QueuedJobStatus::Completed => counts.completed += 1,
                QueuedJobStatus::Failed { .. } => counts.failed += 1,
            }
        }
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use angelhub_core::ManualClock;
    use std::time::Duration;

    fn queue_with_clock() -> (InMemoryJobQueue, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::starting_now());
        (InMemoryJobQueue::new().with_clock(clock.clone()), clock)
    }

    #[test]
    fn enqueue_and_claim() {
        let (queue, _) = queue_with_clock();
        let id = queue
            .enqueue("email", "welcome", serde_json::json!({}), EnqueueOptions::attempts(3))
            .unwrap();

        let claimed = queue.claim_next(None).unwrap();
        assert_eq!(claimed.id, id);
        assert_eq!(claimed.status, QueuedJobStatus::Active);
        assert_eq!(claimed.attempts_made, 1);

        // No more jobs
        assert!(queue.claim_next(None).is_none());
    }

    #[test]
    fn delayed_jobs_wait_for_their_time() {
        let (queue, clock) = queue_with_clock();
        let options = EnqueueOptions::attempts(2)
            .with_delay(Duration::from_secs(30))
            .with_prior_attempts(1);
        queue.enqueue("payments", "charge", serde_json::json!({}), options).unwrap();

        assert!(queue.claim_next(Some("payments")).is_none());
        clock.advance(chrono::Duration::seconds(30));

        let claimed = queue.claim_next(Some("payments")).unwrap();
        assert_eq!(claimed.attempts_made, 2);
    }

    #[test]
    fn replacement_jobs_keep_the_original_creation_time() {
        let (queue, clock) = queue_with_clock();
        let original = clock.now() - chrono::Duration::hours(6);
        let options = EnqueueOptions::attempts(1)
            .with_prior_attempts(3)
            .with_origin(original);
        let id = queue.enqueue("analytics", "rollup", serde_json::json!({}), options).unwrap();

        let job = queue.get(id).unwrap();
        assert_eq!(job.created_at, original);
        assert_eq!(job.enqueued_at, clock.now());
        assert_eq!(job.attempt_budget(), 4);
        assert_eq!(job.as_failed().created_at, original);
    }

    #[test]
    fn paused_queues_are_not_claimed() {
        let (queue, _) = queue_with_clock();
        queue
            .enqueue("analytics", "rollup", serde_json::json!({}), EnqueueOptions::attempts(1))
            .unwrap();

        queue.pause("analytics");
        assert!(queue.is_paused("analytics").unwrap());
        assert!(queue.claim_next(None).is_none());

        queue.resume("analytics");
        assert!(queue.claim_next(None).is_some());
    }

    #[test]
    fn unknown_queues_are_rejected() {
        let queue = InMemoryJobQueue::new().with_queues(["email"]);
        let err = queue
            .enqueue("nope", "x", serde_json::json!({}), EnqueueOptions::attempts(1))
            .unwrap_err();
        assert!(matches!(err, QueueError::UnknownQueue(q) if q == "nope"));
        assert!(queue.counts("nope").is_err());
    }

    #[test]
    fn injected_failure_rejects_enqueue() {
        let queue = InMemoryJobQueue::new();
        queue.set_enqueue_failure(Some("broker unreachable".to_string()));

        let err = queue
            .enqueue("email", "x", serde_json::json!({}), EnqueueOptions::attempts(1))
            .unwrap_err();
        assert!(matches!(err, QueueError::Backend(_)));
        assert_eq!(queue.enqueue_calls(), 1);

        queue.set_enqueue_failure(None);
        assert!(queue.enqueue("email", "x", serde_json::json!({}), EnqueueOptions::attempts(1)).is_ok());
    }

    #[test]
    fn counts_track_status() {
        let (queue, _) = queue_with_clock();
        for i in 0..4 {
            queue
                .enqueue("email", "digest", serde_json::json!({"i": i}), EnqueueOptions::attempts(1))
                .unwrap();
        }

        let a = queue.claim_next(None).unwrap();
        let b = queue.claim_next(None).unwrap();
        queue.finish(a.id, Utc::now(), None);
        queue.finish(b.id, Utc::now(), Some("bounced".to_string()));
        queue.claim_next(None).unwrap();

        let counts = queue.counts("email").unwrap();
        assert_eq!(
            counts,
            QueueCounts {
                waiting: 1,
                active: 1,
                completed: 1,
                failed: 1,
            }
        );
    }
}
