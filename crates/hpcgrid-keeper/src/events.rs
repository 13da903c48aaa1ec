//! Events produced by the keeper for external consumers.
//!
//! Events never feed back into state. They are returned from every
//! handled message in the order they happened.

use serde::{Deserialize, Serialize};

use hpc_core::{Address, Amount, ClusterId, DecisionId, DisputeId, JobId, OfferingId, RecordId, TemplateId};
use hpcgrid_state::{
    ClusterStatus, DecisionOrigin, DisputeStatus, EntryStatus, JobState, RoutingStatus,
    TemplateStatus, ViolationKind,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    // ── Registry ───────────────────────────────────────────────────
    ClusterRegistered {
        cluster_id: ClusterId,
        provider: Address,
    },
    ClusterUpdated {
        cluster_id: ClusterId,
    },
    ClusterHealthUpdated {
        cluster_id: ClusterId,
        status: ClusterStatus,
        reliability_bps: u32,
    },
    ClusterDeregistered {
        cluster_id: ClusterId,
    },
    OfferingCreated {
        offering_id: OfferingId,
    },
    OfferingUpdated {
        offering_id: OfferingId,
    },
    TemplateStatusChanged {
        template_id: TemplateId,
        status: TemplateStatus,
    },

    // ── Scheduling & routing ───────────────────────────────────────
    JobSubmitted {
        job_id: JobId,
        customer: Address,
        budget: Amount,
    },
    DecisionCreated {
        job_id: JobId,
        decision_id: DecisionId,
        cluster_id: ClusterId,
        origin: DecisionOrigin,
        supersedes: Option<DecisionId>,
    },
    JobRouted {
        job_id: JobId,
        cluster_id: ClusterId,
        status: RoutingStatus,
        audit_record_id: RecordId,
    },
    JobRescheduled {
        job_id: JobId,
        decision_id: DecisionId,
        cluster_id: ClusterId,
        fallback: bool,
    },
    RoutingViolation {
        job_id: JobId,
        provider: Address,
        kind: ViolationKind,
        status: RoutingStatus,
    },
    RoutingViolationResolved {
        job_id: JobId,
    },
    ViolationThresholdExceeded {
        provider: Address,
        count: u64,
    },

    // ── Lifecycle ──────────────────────────────────────────────────
    JobStateChanged {
        job_id: JobId,
        from: JobState,
        to: JobState,
    },

    // ── Accounting ─────────────────────────────────────────────────
    AccountingRecordCreated {
        record_id: RecordId,
        job_id: JobId,
        charge: Amount,
        is_final: bool,
    },
    DisputeOpened {
        dispute_id: DisputeId,
        record_id: RecordId,
        automatic: bool,
    },
    DisputeReviewStarted {
        dispute_id: DisputeId,
        reviewer: Address,
    },
    DisputeResolved {
        dispute_id: DisputeId,
        status: DisputeStatus,
        revised_charge: Amount,
    },

    // ── Settlement ─────────────────────────────────────────────────
    CompensationRecorded {
        entry_id: RecordId,
        job_id: JobId,
        amount: Amount,
        status: EntryStatus,
    },
    RewardDistributed {
        job_id: JobId,
        reward_id: String,
        charge: Amount,
        platform_fee: Amount,
        provider_reward: Amount,
    },
    SettlementFailed {
        job_id: JobId,
        attempts: u32,
        error: String,
        abandoned: bool,
    },

    // ── Governance ─────────────────────────────────────────────────
    ParamsUpdated {
        version: u64,
        effective_height: u64,
    },
}

impl EngineEvent {
    pub fn name(&self) -> &'static str {
        match self {
            EngineEvent::ClusterRegistered { .. } => "cluster_registered",
            EngineEvent::ClusterUpdated { .. } => "cluster_updated",
            EngineEvent::ClusterHealthUpdated { .. } => "cluster_health_updated",
            EngineEvent::ClusterDeregistered { .. } => "cluster_deregistered",
            EngineEvent::OfferingCreated { .. } => "offering_created",
            EngineEvent::OfferingUpdated { .. } => "offering_updated",
            EngineEvent::TemplateStatusChanged { .. } => "template_status_changed",
            EngineEvent::JobSubmitted { .. } => "job_submitted",
            EngineEvent::DecisionCreated { .. } => "decision_created",
            EngineEvent::JobRouted { .. } => "job_routed",
            EngineEvent::JobRescheduled { .. } => "job_rescheduled",
            EngineEvent::RoutingViolation { .. } => "routing_violation",
            EngineEvent::RoutingViolationResolved { .. } => "routing_violation_resolved",
            EngineEvent::ViolationThresholdExceeded { .. } => "violation_threshold_exceeded",
            EngineEvent::JobStateChanged { .. } => "job_state_changed",
            EngineEvent::AccountingRecordCreated { .. } => "accounting_record_created",
            EngineEvent::DisputeOpened { .. } => "dispute_opened",
            EngineEvent::DisputeReviewStarted { .. } => "dispute_review_started",
            EngineEvent::DisputeResolved { .. } => "dispute_resolved",
            EngineEvent::CompensationRecorded { .. } => "compensation_recorded",
            EngineEvent::RewardDistributed { .. } => "reward_distributed",
            EngineEvent::SettlementFailed { .. } => "settlement_failed",
            EngineEvent::ParamsUpdated { .. } => "params_updated",
        }
    }
}
