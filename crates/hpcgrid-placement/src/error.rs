//! Error types for the scheduling engine.

use hpcgrid_billing::BillingError;
use hpcgrid_state::StateError;
use thiserror::Error;

pub type PlacementResult<T> = Result<T, PlacementError>;

#[derive(Debug, Error)]
pub enum PlacementError {
    /// No candidate satisfies capacity, duration, and budget constraints.
    #[error("no capacity available for job {job_id} ({considered} candidates considered)")]
    NoCapacityAvailable { job_id: String, considered: usize },

    #[error("cost estimate failed: {0}")]
    Billing(#[from] BillingError),

    #[error("state error: {0}")]
    State(#[from] StateError),
}
