//! Job executor that routes failures through the resilience engine.

use std::collections::HashMap;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use angelhub_resilience::ResilienceEngine;

use super::queue::InMemoryJobQueue;
use super::types::{JobResult, QueuedJob};

/// Job handler function type.
pub type JobHandler = Box<dyn Fn(&QueuedJob) -> JobResult + Send + Sync>;

/// Job executor configuration.
#[derive(Debug, Clone)]
pub struct JobExecutorConfig {
    /// How long to wait when no job is ready
    pub poll_interval: Duration,
    /// Name for logging
    pub name: String,
    /// Optional queue filter
    pub queue: Option<String>,
}

impl Default for JobExecutorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            name: "job-executor".to_string(),
            queue: None,
        }
    }
}

impl JobExecutorConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }
}

/// How one execution ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionOutcome {
    Completed,
    /// Failed; the engine scheduled a retry
    Retried,
    /// Failed; the engine dead-lettered the job (or could not recover it)
    NotRetried,
}

/// Executor runtime statistics.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct ExecutorStats {
    pub jobs_processed: u64,
    pub jobs_succeeded: u64,
    pub jobs_retried: u64,
    pub jobs_not_retried: u64,
    pub uptime_secs: u64,
}

impl ExecutorStats {
    fn record(&mut self, outcome: ExecutionOutcome) {
        self.jobs_processed += 1;
        match outcome {
            ExecutionOutcome::Completed => self.jobs_succeeded += 1,
            ExecutionOutcome::Retried => self.jobs_retried += 1,
            ExecutionOutcome::NotRetried => self.jobs_not_retried += 1,
        }
    }
}

/// Handle to control a running executor.
#[derive(Debug)]
pub struct JobExecutorHandle {
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
    stats: Arc<Mutex<ExecutorStats>>,
}

impl JobExecutorHandle {
    /// Request graceful shutdown; the job in flight finishes first.
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
    }

    /// Get current executor statistics.
    pub fn stats(&self) -> ExecutorStats {
        self.stats.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

/// Background job executor.
///
/// Claims ready jobs, runs the registered handler, and reports every outcome
/// to the resilience engine: successes feed the queue's circuit breaker,
/// failures go through retry / dead-letter handling.
pub struct JobExecutor {
    queue: Arc<InMemoryJobQueue>,
    engine: Arc<ResilienceEngine>,
    handlers: HashMap<String, JobHandler>,
}

impl JobExecutor {
    pub fn new(queue: Arc<InMemoryJobQueue>, engine: Arc<ResilienceEngine>) -> Self {
        Self {
            queue,
            engine,
            handlers: HashMap::new(),
        }
    }

    /// Register a handler for a job name. `"prefix.*"` and `"*"` patterns are
    /// consulted after exact matches.
    pub fn register_handler<F>(&mut self, name_pattern: impl Into<String>, handler: F)
    where
        F: Fn(&QueuedJob) -> JobResult + Send + Sync + 'static,
    {
        self.handlers.insert(name_pattern.into(), Box::new(handler));
    }

    fn get_handler(&self, name: &str) -> Option<&JobHandler> {
        if let Some(h) = self.handlers.get(name) {
            return Some(h);
        }

        for (pattern, handler) in &self.handlers {
            if let Some(prefix) = pattern.strip_suffix(".*") {
                if name.starts_with(prefix) {
                    return Some(handler);
                }
            }
        }

        self.handlers.get("*")
    }

    /// Run a claimed job to completion and report the outcome.
    pub fn execute(&self, job: &QueuedJob) -> ExecutionOutcome {
        let started = chrono::Utc::now();

        let result = match self.get_handler(&job.name) {
            Some(handler) => handler(job),
            None => {
                warn!(job_id = %job.id, job_name = %job.name, "no handler for job");
                JobResult::failure(format!("no handler registered for job {}", job.name))
            }
        };

        match result {
            JobResult::Success => {
                self.queue.finish(job.id, started, None);
                self.engine.handle_job_success(&job.queue);
                debug!(job_id = %job.id, queue = %job.queue, "job completed successfully");
                ExecutionOutcome::Completed
            }
            JobResult::Failure { error, context } => {
                self.queue.finish(job.id, started, Some(error.clone()));
                let failed = job.as_failed();
                if self.engine.handle_job_failure(&failed, &error, context) {
                    ExecutionOutcome::Retried
                } else {
                    ExecutionOutcome::NotRetried
                }
            }
        }
    }

    /// Claim and run the next ready job, if any.
    pub fn run_next(&self, queue: Option<&str>) -> Option<ExecutionOutcome> {
        let job = self.queue.claim_next(queue)?;
        debug!(job_id = %job.id, queue = %job.queue, job_name = %job.name, "claimed job");
        Some(self.execute(&job))
    }

    /// Spawn the executor in a background thread.
    pub fn spawn(self, config: JobExecutorConfig) -> std::io::Result<JobExecutorHandle> {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let stats = Arc::new(Mutex::new(ExecutorStats::default()));
        let stats_clone = stats.clone();

        let join = thread::Builder::new()
            .name(config.name.clone())
            .spawn(move || executor_loop(self, config, shutdown_rx, stats_clone))?;

        Ok(JobExecutorHandle {
            shutdown: shutdown_tx,
            join: Some(join),
            stats,
        })
    }
}

impl std::fmt::Debug for JobExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobExecutor")
            .field("handlers", &self.handlers.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

fn executor_loop(
    executor: JobExecutor,
    config: JobExecutorConfig,
    shutdown_rx: mpsc::Receiver<()>,
    stats: Arc<Mutex<ExecutorStats>>,
) {
    info!(executor = %config.name, "job executor started");
    let start_time = Instant::now();

    loop {
        match shutdown_rx.try_recv() {
            Ok(()) | Err(mpsc::TryRecvError::Disconnected) => break,
            Err(mpsc::TryRecvError::Empty) => {}
        }

        let outcome = executor.run_next(config.queue.as_deref());

        {
            let mut s = stats.lock().unwrap_or_else(|e| e.into_inner());
            s.uptime_secs = start_time.elapsed().as_secs();
            if let Some(outcome) = outcome {
                s.record(outcome);
            }
        }

        if outcome.is_none() {
            match shutdown_rx.recv_timeout(config.poll_interval) {
                Err(RecvTimeoutError::Timeout) => {}
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            }
        }
    }

    let s = stats.lock().unwrap_or_else(|e| e.into_inner());
    if s.jobs_not_retried > 0 {
        error!(executor = %config.name, not_retried = s.jobs_not_retried, "executor stopped with unrecovered jobs");
    }
    info!(executor = %config.name, processed = s.jobs_processed, "job executor stopped");
}
