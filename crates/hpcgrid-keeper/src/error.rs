//! Error types for the keeper.

use hpc_core::{CoinError, ParamsError};
use hpcgrid_accounting::AccountingError;
use hpcgrid_billing::BillingError;
use hpcgrid_lifecycle::LifecycleError;
use hpcgrid_placement::PlacementError;
use hpcgrid_routing::RoutingError;
use hpcgrid_settlement::SettlementError;
use hpcgrid_state::{CapacityError, StateError};
use thiserror::Error;

use crate::events::EngineEvent;

pub type KeeperResult<T> = Result<T, KeeperError>;

/// Coarse error classes callers act on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Malformed or unauthorized request. Nothing was written.
    Validation,
    /// No cluster can take the job, or the chosen one cannot.
    Capacity,
    /// Routing policy refused the placement. The audit record was kept.
    Policy,
    /// The job cannot make the requested transition.
    Lifecycle,
    /// Escrow refused a transfer.
    Settlement,
    /// Store or arithmetic failure.
    Internal,
}

#[derive(Debug, Error)]
pub enum KeeperError {
    #[error("invalid message: {0}")]
    Invalid(String),

    #[error("{sender} may not {action}")]
    Unauthorized { sender: String, action: &'static str },

    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },

    #[error("{kind} {id} already exists")]
    AlreadyExists { kind: &'static str, id: String },

    #[error("template {template_id} is not approved")]
    TemplateNotApproved { template_id: String },

    #[error("cluster {cluster_id} has {active} active jobs")]
    ClusterHasActiveJobs { cluster_id: String, active: usize },

    /// Placement was refused. The audit trail and any violation counters
    /// were committed; `events` are what that commit produced.
    #[error("routing rejected: {source}")]
    RoutingRejected {
        source: RoutingError,
        events: Vec<EngineEvent>,
    },

    #[error(transparent)]
    Routing(#[from] RoutingError),

    #[error(transparent)]
    Placement(#[from] PlacementError),

    #[error(transparent)]
    Capacity(#[from] CapacityError),

    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),

    #[error(transparent)]
    Accounting(#[from] AccountingError),

    #[error(transparent)]
    Billing(#[from] BillingError),

    #[error(transparent)]
    Settlement(#[from] SettlementError),

    #[error(transparent)]
    Params(#[from] ParamsError),

    #[error(transparent)]
    Coin(#[from] CoinError),

    #[error(transparent)]
    State(#[from] StateError),
}

fn routing_class(err: &RoutingError) -> ErrorClass {
    match err {
        RoutingError::MissingDecision { .. }
        | RoutingError::StaleDecision { .. }
        | RoutingError::ClusterMismatch { .. } => ErrorClass::Policy,
        RoutingError::ClusterUnavailable { .. } | RoutingError::NoCapacityAvailable { .. } => {
            ErrorClass::Capacity
        }
        RoutingError::Placement(PlacementError::NoCapacityAvailable { .. }) => ErrorClass::Capacity,
        RoutingError::Placement(_) | RoutingError::State(_) => ErrorClass::Internal,
    }
}

impl KeeperError {
    pub fn class(&self) -> ErrorClass {
        match self {
            KeeperError::Invalid(_)
            | KeeperError::Unauthorized { .. }
            | KeeperError::NotFound { .. }
            | KeeperError::AlreadyExists { .. }
            | KeeperError::TemplateNotApproved { .. }
            | KeeperError::ClusterHasActiveJobs { .. }
            | KeeperError::Params(_)
            | KeeperError::Coin(_) => ErrorClass::Validation,
            KeeperError::RoutingRejected { source, .. } => routing_class(source),
            KeeperError::Routing(e) => routing_class(e),
            KeeperError::Placement(PlacementError::NoCapacityAvailable { .. })
            | KeeperError::Capacity(_) => ErrorClass::Capacity,
            KeeperError::Lifecycle(LifecycleError::UnknownStatus { .. }) => ErrorClass::Validation,
            KeeperError::Lifecycle(_) => ErrorClass::Lifecycle,
            KeeperError::Accounting(AccountingError::Hash(_)) => ErrorClass::Internal,
            KeeperError::Accounting(AccountingError::InvalidDisputeTransition { .. }) => {
                ErrorClass::Lifecycle
            }
            KeeperError::Accounting(_) => ErrorClass::Validation,
            KeeperError::Settlement(_) => ErrorClass::Settlement,
            KeeperError::Placement(_) | KeeperError::Billing(_) | KeeperError::State(_) => {
                ErrorClass::Internal
            }
        }
    }

    /// Events committed before the message was refused.
    pub fn events(&self) -> &[EngineEvent] {
        match self {
            KeeperError::RoutingRejected { events, .. } => events,
            _ => &[],
        }
    }

    pub(crate) fn not_found(kind: &'static str, id: &str) -> Self {
        KeeperError::NotFound {
            kind,
            id: id.to_string(),
        }
    }
}
