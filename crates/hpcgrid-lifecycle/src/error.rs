//! Error types for the job lifecycle.

use hpcgrid_state::JobState;
use thiserror::Error;

pub type LifecycleResult<T> = Result<T, LifecycleError>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LifecycleError {
    #[error("job {job_id} already terminal ({state:?})")]
    AlreadyTerminal { job_id: String, state: JobState },

    #[error("job {job_id}: illegal transition {from:?} -> {to:?}")]
    IllegalTransition {
        job_id: String,
        from: JobState,
        to: JobState,
    },

    #[error("unrecognized {scheduler} status {status:?}")]
    UnknownStatus { scheduler: &'static str, status: String },
}
