//! Engine error type.

use thiserror::Error;

use angelhub_core::CoreError;

use crate::ports::{QueueError, StoreError};

/// Failure while recording, retrying or demoting a job.
///
/// `handle_job_failure` never surfaces these; operator-facing operations do.
#[derive(Debug, Clone, Error)]
pub enum ResilienceError {
    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Core(#[from] CoreError),
}
