//! Resilience engine: the single owner of strategies, breakers and dead letters.
//!
//! Construct one per process, wrap it in an `Arc`, hand it to every job runner
//! and start the sweep workers with [`ResilienceEngine::start`].

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Value as JsonValue, json};
use tracing::{debug, error, info, warn};

use angelhub_core::{Clock, CoreResult, DeadLetterId, JobId, SystemClock};

use crate::circuit_breaker::{BreakerSweepReport, CircuitBreakerRegistry, CircuitBreakerState, CircuitState};
use crate::classification::{ErrorContext, FailureContext};
use crate::config::ResilienceConfig;
use crate::dead_letter::{
    DeadLetterJob, DeadLetterPatch, DeadLetterPolicy, DeadLetterStatus, DeadLetterWorkingSet,
};
use crate::error::ResilienceError;
use crate::ports::{Alerting, BackoffHint, EnqueueOptions, FailedJob, JobErrorRecord, JobQueue, PersistentStore};
use crate::strategy::{
    JitterSource, RetryStrategy, RetryStrategyPatch, RetryStrategyTable, ThreadRngJitter, compute_delay,
};
use crate::workers::{ResilienceWorkers, WorkerSpawnError};

/// Outcome of one dead-letter sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeadLetterSweepReport {
    /// Entries re-enqueued.
    pub retried: usize,
    /// Entries whose re-enqueue failed and stay cached for a later sweep.
    pub failed: usize,
    /// Entries given up on after too many failed re-enqueues.
    pub exhausted: usize,
    /// Due entries skipped because their queue is paused.
    pub skipped_paused: usize,
    /// Entries still cached after the sweep.
    pub remaining: usize,
}

impl DeadLetterSweepReport {
    pub fn is_noop(&self) -> bool {
        self.retried == 0 && self.failed == 0 && self.exhausted == 0
    }
}

/// How a failure was resolved.
enum Resolution {
    Retried,
    DeadLettered,
}

pub struct ResilienceEngine {
    config: ResilienceConfig,
    queue: Arc<dyn JobQueue>,
    store: Arc<dyn PersistentStore>,
    alerts: Arc<dyn Alerting>,
    clock: Arc<dyn Clock>,
    jitter: Arc<dyn JitterSource>,
    strategies: RetryStrategyTable,
    breakers: CircuitBreakerRegistry,
    policy: DeadLetterPolicy,
    dead_letters: DeadLetterWorkingSet,
    /// Serializes re-drives (sweep and manual) so an entry is re-enqueued once.
    redrive: Mutex<()>,
}

impl std::fmt::Debug for ResilienceEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResilienceEngine")
            .field("config", &self.config)
            .field("breakers", &self.breakers)
            .field("dead_letters", &self.dead_letters.len())
            .finish_non_exhaustive()
    }
}

impl ResilienceEngine {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        store: Arc<dyn PersistentStore>,
        alerts: Arc<dyn Alerting>,
        config: ResilienceConfig,
    ) -> Self {
        Self {
            breakers: CircuitBreakerRegistry::new(config.breaker()),
            policy: config.dead_letter_policy(),
            config,
            queue,
            store,
            alerts,
            clock: Arc::new(SystemClock),
            jitter: Arc::new(ThreadRngJitter),
            strategies: RetryStrategyTable::with_defaults(),
            dead_letters: DeadLetterWorkingSet::new(),
            redrive: Mutex::new(()),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_jitter(mut self, jitter: Arc<dyn JitterSource>) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn with_strategies(mut self, strategies: RetryStrategyTable) -> Self {
        self.strategies = strategies;
        self
    }

    pub fn config(&self) -> &ResilienceConfig {
        &self.config
    }

    /// Start the breaker-recovery and dead-letter sweep workers.
    pub fn start(self: &Arc<Self>) -> Result<ResilienceWorkers, WorkerSpawnError> {
        ResilienceWorkers::spawn(Arc::clone(self))
    }

    /// Reload cached dead letters from the store (pending and retriable only).
    pub fn hydrate(&self) -> Result<usize, ResilienceError> {
        let pending: Vec<_> = self
            .store
            .list_pending_dead_letter_jobs(self.config.hydrate_limit)?
            .into_iter()
            .filter(DeadLetterJob::is_pending_retriable)
            .collect();
        let count = pending.len();
        self.dead_letters.replace_all(pending);
        info!(count, "hydrated dead-letter working set");
        Ok(count)
    }

    /// Handle a failed job execution.
    ///
    /// Returns `true` when a retry was scheduled, `false` when the job was
    /// dead-lettered or the recovery path itself failed. Never panics and never
    /// returns an error: a broken recovery path must not take down the runner.
    pub fn handle_job_failure(&self, job: &FailedJob, error: &str, context: Option<FailureContext>) -> bool {
        let now = self.clock.now();

        let mut failure = context.unwrap_or_default();
        failure
            .metadata
            .insert("attempts_made".to_string(), json!(job.attempts_made));
        self.attach_queue_diagnostics(&job.queue, &mut failure.metadata);

        let ctx = ErrorContext::capture(job.id, &job.queue, &job.name, error, failure, now);

        match self.resolve_failure(job, error, ctx, now) {
            Ok(Resolution::Retried) => true,
            Ok(Resolution::DeadLettered) => false,
            Err(err) => {
                error!(
                    queue = %job.queue,
                    job_id = %job.id,
                    error = %err,
                    "failure recovery path failed; job not retried"
                );
                false
            }
        }
    }

    /// Feed a successful execution into the queue's breaker.
    pub fn handle_job_success(&self, queue: &str) -> Option<CircuitState> {
        self.breakers.record_success(queue)
    }

    fn resolve_failure(
        &self,
        job: &FailedJob,
        error: &str,
        ctx: ErrorContext,
        now: DateTime<Utc>,
    ) -> Result<Resolution, ResilienceError> {
        let strategy = self.strategies.strategy_for(&job.queue);
        let attempt_limit = job
            .attempt_budget
            .map_or(strategy.max_attempts, |budget| budget.min(strategy.max_attempts));

        // Check before recording so a queue's first-ever failure never blocks.
        let breaker_allows = self.breakers.allow(&job.queue, now);
        self.breakers.record_failure(&job.queue, now);

        if !breaker_allows || job.attempts_made >= attempt_limit {
            debug!(
                queue = %job.queue,
                job_id = %job.id,
                breaker_allows,
                attempts_made = job.attempts_made,
                attempt_limit,
                "retry not allowed; demoting"
            );
            self.record_job_error(job, error, &ctx, None);
            self.demote(job, error, ctx)?;
            return Ok(Resolution::DeadLettered);
        }

        let delay = compute_delay(&strategy, job.attempts_made, self.jitter.as_ref());
        let next_retry_at = now + chrono::Duration::from_std(delay).unwrap_or_default();

        let options = EnqueueOptions::attempts(attempt_limit - job.attempts_made)
            .with_backoff(BackoffHint::from(&strategy))
            .with_delay(delay)
            .with_prior_attempts(job.attempts_made)
            .with_origin(job.created_at);

        match self.queue.enqueue(&job.queue, &job.name, job.payload.clone(), options) {
            Ok(retry_id) => {
                self.record_job_error(job, error, &ctx, Some(next_retry_at));
                info!(
                    queue = %job.queue,
                    job_id = %job.id,
                    retry_job_id = %retry_id,
                    category = %ctx.category,
                    severity = %ctx.severity,
                    delay_ms = delay.as_millis() as u64,
                    "job failure scheduled for retry"
                );
                Ok(Resolution::Retried)
            }
            Err(err) => {
                warn!(
                    queue = %job.queue,
                    job_id = %job.id,
                    error = %err,
                    "retry could not be enqueued; dead-lettering instead"
                );
                self.record_job_error(job, error, &ctx, None);
                self.demote(job, error, ctx)?;
                Ok(Resolution::DeadLettered)
            }
        }
    }

    /// Failure records are an audit trail: a failed write is logged and the
    /// job is still retried or dead-lettered.
    fn record_job_error(
        &self,
        job: &FailedJob,
        error: &str,
        ctx: &ErrorContext,
        next_retry_at: Option<DateTime<Utc>>,
    ) {
        let record = JobErrorRecord::new(job, error, ctx, next_retry_at);
        if let Err(err) = self.store.save_job_error(&record) {
            error!(queue = %job.queue, job_id = %job.id, error = %err, "could not record job failure");
        }
    }

    /// Move `job` to the dead-letter store.
    ///
    /// Retriable entries are also cached for the sweep. Critical failures are
    /// reported to the alerting collaborator (best effort).
    pub fn demote(&self, job: &FailedJob, error: &str, ctx: ErrorContext) -> Result<DeadLetterJob, ResilienceError> {
        let now = self.clock.now();
        let max_retries = self.strategies.strategy_for(&job.queue).max_attempts;
        let dead = self.policy.demote(job, error, ctx, max_retries, now);

        self.store.save_dead_letter_job(&dead)?;
        if dead.can_retry {
            self.dead_letters.insert(dead.clone());
        }

        if dead.context.is_critical() {
            error!(
                queue = %dead.queue,
                job_id = %dead.original_job_id,
                dead_letter_id = %dead.id,
                category = %dead.context.category,
                "critical job failure dead-lettered"
            );
            if let Err(err) = self.alerts.notify_critical(&dead.context) {
                warn!(dead_letter_id = %dead.id, error = %err, "critical alert could not be delivered");
            }
        } else {
            warn!(
                queue = %dead.queue,
                job_id = %dead.original_job_id,
                dead_letter_id = %dead.id,
                category = %dead.context.category,
                severity = %dead.context.severity,
                can_retry = dead.can_retry,
                "job dead-lettered"
            );
        }

        Ok(dead)
    }

    /// Most recent dead letters from the store.
    pub fn get_dead_letter_jobs(&self, limit: usize) -> Result<Vec<DeadLetterJob>, ResilienceError> {
        Ok(self.store.list_dead_letter_jobs(limit)?)
    }

    /// Operator re-drive of a single dead letter.
    ///
    /// Works on any pending entry (eligibility and `retry_after` are automatic
    /// sweep rules, not operator rules). Returns `false` when the entry is
    /// unknown, already handled, or the re-enqueue failed.
    pub fn retry_dead_letter_job_by_id(&self, id: DeadLetterId) -> bool {
        let _guard = self.redrive_lock();

        match self.redrive_by_id(id) {
            Ok(retried) => retried,
            Err(err) => {
                error!(dead_letter_id = %id, error = %err, "manual dead-letter retry failed");
                false
            }
        }
    }

    fn redrive_by_id(&self, id: DeadLetterId) -> Result<bool, ResilienceError> {
        let entry = match self.dead_letters.get(id) {
            Some(entry) => entry,
            None => match self.store.find_dead_letter_job(id)? {
                Some(entry) => entry,
                None => return Ok(false),
            },
        };
        if entry.status != DeadLetterStatus::Pending {
            debug!(dead_letter_id = %id, status = ?entry.status, "dead-letter job already handled");
            return Ok(false);
        }

        let now = self.clock.now();
        match self.enqueue_dead_letter(&entry) {
            Ok(job_id) => {
                self.mark_retried(&entry, job_id, now)?;
                Ok(true)
            }
            Err(err) => {
                let patch = DeadLetterPatch::retry_failed(err.to_string(), now, entry.sweep_attempts);
                self.store.update_dead_letter_job(id, &patch)?;
                self.dead_letters.apply(id, &patch);
                Err(err)
            }
        }
    }

    /// Re-drive every cached entry that is due.
    ///
    /// A run with nothing due issues no enqueue calls and changes nothing.
    pub fn sweep_dead_letters(&self) -> DeadLetterSweepReport {
        let _guard = self.redrive_lock();
        let now = self.clock.now();
        let mut report = DeadLetterSweepReport::default();

        for entry in self.dead_letters.due(now) {
            match self.queue.is_paused(&entry.queue) {
                Ok(true) => {
                    report.skipped_paused += 1;
                    continue;
                }
                Ok(false) => {}
                // Let the enqueue attempt surface the real problem.
                Err(err) => debug!(queue = %entry.queue, error = %err, "could not check pause state"),
            }

            match self.enqueue_dead_letter(&entry) {
                Ok(job_id) => match self.mark_retried(&entry, job_id, now) {
                    Ok(()) => report.retried += 1,
                    Err(err) => {
                        // Already re-enqueued: drop it from the cache regardless.
                        self.dead_letters.remove(entry.id);
                        report.retried += 1;
                        error!(dead_letter_id = %entry.id, error = %err, "could not record dead-letter retry");
                    }
                },
                Err(err) => {
                    if self.record_sweep_failure(&entry, &err, now) {
                        report.exhausted += 1;
                    } else {
                        report.failed += 1;
                    }
                }
            }
        }

        report.remaining = self.dead_letters.len();
        if report.is_noop() {
            debug!(remaining = report.remaining, "dead-letter sweep: nothing due");
        } else {
            info!(
                retried = report.retried,
                failed = report.failed,
                exhausted = report.exhausted,
                skipped_paused = report.skipped_paused,
                remaining = report.remaining,
                "dead-letter sweep finished"
            );
        }
        report
    }

    /// Move open breakers whose timeout elapsed to half-open.
    pub fn sweep_circuit_breakers(&self) -> BreakerSweepReport {
        self.breakers.sweep(self.clock.now())
    }

    pub fn get_circuit_breaker_status(&self) -> BTreeMap<String, CircuitBreakerState> {
        self.breakers.status()
    }

    pub fn reset_circuit_breaker(&self, queue: &str) -> bool {
        self.breakers.reset(queue)
    }

    pub fn get_retry_strategy(&self, queue: &str) -> Option<RetryStrategy> {
        self.strategies.get(queue)
    }

    pub fn update_retry_strategy(&self, queue: &str, patch: &RetryStrategyPatch) -> CoreResult<RetryStrategy> {
        let updated = self.strategies.update(queue, patch)?;
        info!(queue, max_attempts = updated.max_attempts, backoff = ?updated.backoff, "retry strategy updated");
        Ok(updated)
    }

    /// Number of cached dead letters awaiting a sweep.
    pub fn pending_dead_letters(&self) -> usize {
        self.dead_letters.len()
    }

    fn enqueue_dead_letter(&self, entry: &DeadLetterJob) -> Result<JobId, ResilienceError> {
        let options = EnqueueOptions::attempts(entry.redrive_attempts())
            .with_prior_attempts(entry.retry_count)
            .with_origin(entry.job_created_at);
        Ok(self
            .queue
            .enqueue(&entry.queue, &entry.job_name, entry.payload.clone(), options)?)
    }

    fn mark_retried(
        &self,
        entry: &DeadLetterJob,
        job_id: JobId,
        now: DateTime<Utc>,
    ) -> Result<(), ResilienceError> {
        self.dead_letters.remove(entry.id);
        self.store
            .update_dead_letter_job(entry.id, &DeadLetterPatch::retried(job_id, now))?;
        info!(
            queue = %entry.queue,
            dead_letter_id = %entry.id,
            retry_job_id = %job_id,
            "dead-letter job re-enqueued"
        );
        Ok(())
    }

    /// Returns `true` when the entry was given up on.
    fn record_sweep_failure(&self, entry: &DeadLetterJob, err: &ResilienceError, now: DateTime<Utc>) -> bool {
        let attempts = entry.sweep_attempts.saturating_add(1);
        let exhausted = attempts >= self.config.max_sweep_attempts;

        let mut patch = DeadLetterPatch::retry_failed(err.to_string(), now, attempts);
        if exhausted {
            patch = patch.exhausted();
            self.dead_letters.remove(entry.id);
            warn!(
                queue = %entry.queue,
                dead_letter_id = %entry.id,
                attempts,
                "dead-letter job exhausted its sweep attempts"
            );
        } else {
            self.dead_letters.apply(entry.id, &patch);
            warn!(queue = %entry.queue, dead_letter_id = %entry.id, error = %err, "dead-letter re-enqueue failed");
        }

        if let Err(store_err) = self.store.update_dead_letter_job(entry.id, &patch) {
            error!(dead_letter_id = %entry.id, error = %store_err, "could not record dead-letter retry failure");
        }
        exhausted
    }

    fn attach_queue_diagnostics(&self, queue: &str, metadata: &mut BTreeMap<String, JsonValue>) {
        if let Ok(counts) = self.queue.counts(queue) {
            metadata.insert(
                "queue_counts".to_string(),
                json!({
                    "waiting": counts.waiting,
                    "active": counts.active,
                    "completed": counts.completed,
                    "failed": counts.failed,
                }),
            );
        }
        if let Ok(paused) = self.queue.is_paused(queue) {
            metadata.insert("queue_paused".to_string(), json!(paused));
        }
    }

    fn redrive_lock(&self) -> std::sync::MutexGuard<'_, ()> {
        self.redrive.lock().unwrap_or_else(|e| e.into_inner())
    }
}
