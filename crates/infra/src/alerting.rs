//! Alerting adapters for critical job failures.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::json;
use tracing::error;

use angelhub_resilience::{AlertError, Alerting, EnqueueOptions, ErrorContext, JobQueue, queues};

/// Job name of the email sent for a critical failure.
pub const CRITICAL_ALERT_JOB: &str = "critical-error-alert";

/// Broadcasts to the admin log channel and enqueues an alert email per admin.
pub struct AdminAlerting {
    queue: Arc<dyn JobQueue>,
    admin_emails: Vec<String>,
}

impl AdminAlerting {
    pub fn new(queue: Arc<dyn JobQueue>, admin_emails: Vec<String>) -> Self {
        Self { queue, admin_emails }
    }
}

impl std::fmt::Debug for AdminAlerting {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdminAlerting")
            .field("admin_emails", &self.admin_emails)
            .finish_non_exhaustive()
    }
}

impl Alerting for AdminAlerting {
    fn notify_critical(&self, context: &ErrorContext) -> Result<(), AlertError> {
        error!(
            target: "admin_broadcast",
            queue = %context.queue,
            job_id = %context.job_id,
            operation = %context.operation,
            category = %context.category,
            "critical job failure"
        );

        for to in &self.admin_emails {
            let payload = json!({
                "to": to,
                "subject": format!("Critical failure on queue {}", context.queue),
                "template": CRITICAL_ALERT_JOB,
                "context": context,
            });
            self.queue
                .enqueue(queues::EMAIL, CRITICAL_ALERT_JOB, payload, EnqueueOptions::attempts(3))
                .map_err(|e| AlertError(e.to_string()))?;
        }
        Ok(())
    }
}

/// Keeps every alert in memory; optionally fails on purpose.
#[derive(Debug, Default)]
pub struct RecordingAlerting {
    alerts: Mutex<Vec<ErrorContext>>,
    failing: AtomicBool,
}

impl RecordingAlerting {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records alerts but reports every delivery as failed.
    pub fn failing() -> Self {
        Self {
            failing: AtomicBool::new(true),
            ..Self::default()
        }
    }

    pub fn alerts(&self) -> Vec<ErrorContext> {
        self.alerts.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl Alerting for RecordingAlerting {
    fn notify_critical(&self, context: &ErrorContext) -> Result<(), AlertError> {
        self.alerts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(context.clone());
        if self.failing.load(Ordering::SeqCst) {
            return Err(AlertError("alert channel down".to_string()));
        }
        Ok(())
    }
}
