//! `angelhub-worker`: runs the job executor and the resilience sweeps against
//! in-memory adapters until the configured run time elapses.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing::info;

use angelhub_infra::{AdminAlerting, InMemoryJobQueue, InMemoryResilienceStore, JobExecutor, JobExecutorConfig, JobResult};
use angelhub_observability::LogConfig;
use angelhub_resilience::{ResilienceConfig, ResilienceEngine};

struct WorkerSettings {
    run_for: Duration,
    poll_interval: Duration,
    admin_emails: Vec<String>,
}

impl WorkerSettings {
    fn from_env() -> anyhow::Result<Self> {
        let run_for = env_u64("ANGELHUB_WORKER_RUN_SECS", 60)?;
        let poll_ms = env_u64("ANGELHUB_WORKER_POLL_MS", 100)?;
        let admin_emails = std::env::var("ANGELHUB_ADMIN_EMAILS")
            .map(|v| {
                v.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            run_for: Duration::from_secs(run_for),
            poll_interval: Duration::from_millis(poll_ms),
            admin_emails,
        })
    }
}

fn env_u64(key: &str, default: u64) -> anyhow::Result<u64> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("{key} must be a non-negative integer, got {raw:?}")),
        Err(_) => Ok(default),
    }
}

fn main() -> anyhow::Result<()> {
    match std::env::var("ANGELHUB_LOG_FORMAT").as_deref() {
        Ok("pretty") => angelhub_observability::init_with(LogConfig::pretty()),
        _ => angelhub_observability::init(),
    }

    let config = ResilienceConfig::from_env().context("loading resilience config")?;
    let settings = WorkerSettings::from_env()?;

    let queue = InMemoryJobQueue::arc();
    let store = Arc::new(InMemoryResilienceStore::new());
    let alerts = Arc::new(AdminAlerting::new(queue.clone(), settings.admin_emails.clone()));

    let engine = Arc::new(ResilienceEngine::new(queue.clone(), store, alerts, config));
    let hydrated = engine.hydrate().context("hydrating dead-letter cache")?;

    let workers = engine.start().context("starting sweep workers")?;

    let mut executor = JobExecutor::new(queue, Arc::clone(&engine));
    executor.register_handler("*", |job| {
        info!(job_id = %job.id, queue = %job.queue, job_name = %job.name, "job received");
        JobResult::Success
    });
    let executor = executor
        .spawn(
            JobExecutorConfig::default()
                .with_name("angelhub-worker")
                .with_poll_interval(settings.poll_interval),
        )
        .context("starting job executor")?;

    info!(
        run_for_secs = settings.run_for.as_secs(),
        hydrated_dead_letters = hydrated,
        "angelhub worker running"
    );
    std::thread::sleep(settings.run_for);

    let stats = executor.stats();
    executor.shutdown();
    workers.shutdown();

    info!(
        processed = stats.jobs_processed,
        retried = stats.jobs_retried,
        not_retried = stats.jobs_not_retried,
        pending_dead_letters = engine.pending_dead_letters(),
        breakers = engine.get_circuit_breaker_status().len(),
        "angelhub worker stopped"
    );
    Ok(())
}
