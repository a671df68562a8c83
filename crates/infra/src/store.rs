//! In-memory persistent store for failure records and dead letters.

use std::collections::HashMap;
use std::sync::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};

use angelhub_core::DeadLetterId;
use angelhub_resilience::{DeadLetterJob, DeadLetterPatch, JobErrorRecord, PersistentStore, StoreError};

#[derive(Debug, Default)]
pub struct InMemoryResilienceStore {
    job_errors: RwLock<Vec<JobErrorRecord>>,
    dead_letters: RwLock<HashMap<DeadLetterId, DeadLetterJob>>,
    unavailable: AtomicBool,
    job_errors_rejected: AtomicBool,
}

impl InMemoryResilienceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate an outage: every call fails with `StoreError::Storage`.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Fail only `save_job_error` calls, leaving dead-letter writes working.
    pub fn set_job_errors_rejected(&self, rejected: bool) {
        self.job_errors_rejected.store(rejected, Ordering::SeqCst);
    }

    pub fn job_errors(&self) -> Vec<JobErrorRecord> {
        self.job_errors.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn dead_letter_count(&self) -> usize {
        self.dead_letters.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Storage("store unavailable".to_string()));
        }
        Ok(())
    }
}

impl PersistentStore for InMemoryResilienceStore {
    fn save_job_error(&self, record: &JobErrorRecord) -> Result<(), StoreError> {
        self.check_available()?;
        if self.job_errors_rejected.load(Ordering::SeqCst) {
            return Err(StoreError::Storage("job_errors table rejected the write".to_string()));
        }
        self.job_errors
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(record.clone());
        Ok(())
    }

    fn save_dead_letter_job(&self, job: &DeadLetterJob) -> Result<(), StoreError> {
        self.check_available()?;
        let mut dls = self.dead_letters.write().unwrap_or_else(|e| e.into_inner());
        if dls.contains_key(&job.id) {
            return Err(StoreError::AlreadyExists(job.id));
        }
        dls.insert(job.id, job.clone());
        Ok(())
    }

    fn update_dead_letter_job(&self, id: DeadLetterId, patch: &DeadLetterPatch) -> Result<(), StoreError> {
        self.check_available()?;
        let mut dls = self.dead_letters.write().unwrap_or_else(|e| e.into_inner());
        let job = dls.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        job.apply(patch);
        Ok(())
    }

    fn list_dead_letter_jobs(&self, limit: usize) -> Result<Vec<DeadLetterJob>, StoreError> {
        self.check_available()?;
        let dls = self.dead_letters.read().unwrap_or_else(|e| e.into_inner());
        let mut result: Vec<_> = dls.values().cloned().collect();

        result.sort_by(|a, b| b.dead_lettered_at.cmp(&a.dead_lettered_at).then(b.id.cmp(&a.id)));
        result.truncate(limit);
        Ok(result)
    }

    fn list_pending_dead_letter_jobs(&self, limit: usize) -> Result<Vec<DeadLetterJob>, StoreError> {
        self.check_available()?;
        let dls = self.dead_letters.read().unwrap_or_else(|e| e.into_inner());
        let mut result: Vec<_> = dls.values().filter(|d| d.is_pending_retriable()).cloned().collect();

        result.sort_by(|a, b| a.dead_lettered_at.cmp(&b.dead_lettered_at).then(a.id.cmp(&b.id)));
        result.truncate(limit);
        Ok(result)
    }

    fn find_dead_letter_job(&self, id: DeadLetterId) -> Result<Option<DeadLetterJob>, StoreError> {
        self.check_available()?;
        Ok(self
            .dead_letters
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&id)
            .cloned())
    }
}
