//! Error types for accounting and disputes.

use hpcgrid_state::DisputeStatus;
use thiserror::Error;

pub type AccountingResult<T> = Result<T, AccountingError>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AccountingError {
    #[error("job {job_id}: period {start}..{end} {reason}")]
    PeriodOrder {
        job_id: String,
        start: u64,
        end: u64,
        reason: String,
    },

    #[error("job {job_id} already has a final accounting record")]
    AlreadyFinal { job_id: String },

    #[error("{address} is not a party to job {job_id}")]
    NotParticipant { address: String, job_id: String },

    #[error("record {record_id} already has an open dispute")]
    DisputeOpen { record_id: String },

    #[error("{address} is not a moderator")]
    NotModerator { address: String },

    #[error("dispute {dispute_id} is {status:?}, cannot {action}")]
    InvalidDisputeTransition {
        dispute_id: String,
        status: DisputeStatus,
        action: &'static str,
    },

    #[error("correction of {bps} bps exceeds the {max} bps limit")]
    CorrectionTooLarge { bps: u32, max: u32 },

    #[error("revised charge {revised} exceeds original charge {original}")]
    RevisedChargeTooHigh { revised: u64, original: u64 },

    #[error("content hash failed: {0}")]
    Hash(String),
}
