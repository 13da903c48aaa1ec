//! Error types for settlement.

use hpc_core::Amount;
use thiserror::Error;

pub type SettlementResult<T> = Result<T, SettlementError>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SettlementError {
    #[error("{account} holds {available}, needs {needed}")]
    InsufficientFunds {
        account: String,
        needed: Amount,
        available: Amount,
    },

    #[error("escrow {escrow_id} does not exist")]
    UnknownEscrow { escrow_id: String },

    #[error("escrow {escrow_id} is already locked")]
    AlreadyLocked { escrow_id: String },

    #[error("transfer {from} -> {to} of {amount} failed: {reason}")]
    TransferFailed {
        from: String,
        to: String,
        amount: Amount,
        reason: String,
    },

    /// Settlement failed part-way and every executed leg was reversed.
    #[error("settlement of {job_id} reverted: {cause}")]
    Reverted { job_id: String, cause: Box<SettlementError> },

    /// A reversal itself failed; escrow and ledger disagree.
    #[error("settlement of {job_id} could not be reverted: {cause}")]
    RevertFailed { job_id: String, cause: Box<SettlementError> },
}
