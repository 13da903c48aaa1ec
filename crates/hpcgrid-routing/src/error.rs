//! Error types for the routing enforcer.

use hpcgrid_placement::PlacementError;
use hpcgrid_state::StateError;
use thiserror::Error;

pub type RoutingResult<T> = Result<T, RoutingError>;

#[derive(Debug, Error)]
pub enum RoutingError {
    #[error("job {job_id} has no scheduling decision")]
    MissingDecision { job_id: String },

    #[error(
        "decision {decision_id} for job {job_id} is stale \
         ({age_blocks} blocks, {age_secs}s old)"
    )]
    StaleDecision {
        job_id: String,
        decision_id: String,
        age_blocks: u64,
        age_secs: u64,
    },

    #[error("job {job_id} scheduled on {expected}, proposed {actual}")]
    ClusterMismatch {
        job_id: String,
        expected: String,
        actual: String,
    },

    #[error("cluster {cluster_id} unavailable: {reason}")]
    ClusterUnavailable { cluster_id: String, reason: String },

    #[error("no capacity available to re-schedule job {job_id}")]
    NoCapacityAvailable { job_id: String },

    #[error("scheduling failed: {0}")]
    Placement(#[from] PlacementError),

    #[error("state error: {0}")]
    State(#[from] StateError),
}

impl RoutingError {
    /// Policy violations, as opposed to capacity or internal failures.
    pub fn is_policy_violation(&self) -> bool {
        matches!(
            self,
            RoutingError::MissingDecision { .. }
                | RoutingError::StaleDecision { .. }
                | RoutingError::ClusterMismatch { .. }
        )
    }
}
