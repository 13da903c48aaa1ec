//! Domain types for the HPCGrid state store.
//!
//! These are the persisted records of the engine: clusters, offerings,
//! jobs, scheduling decisions, the routing audit trail, accounting and
//! reward records, disputes, and settlement entries. All types are
//! serializable to/from JSON for storage in redb tables.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use hpc_core::{
    Address, Amount, BlockContext, ClusterId, Coin, DecCoin, DecisionId, DisputeId,
    EnforcementMode, EngineParams, JobId, OfferingId, RecordId, ResourceKind, TemplateId,
    UsageMetrics,
};

use crate::error::CapacityError;

/// Zero-padded sequence suffix so keys sort in creation order.
pub fn sequence_key(parent: &str, sequence: u64) -> String {
    format!("{parent}:{sequence:06}")
}

// ── Cluster ───────────────────────────────────────────────────────

/// Liveness of a registered cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusterStatus {
    Active,
    Unavailable,
    /// Soft-deleted. Never scheduled again.
    Deregistered,
}

/// A registered compute resource pool.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HPCCluster {
    pub id: ClusterId,
    pub provider: Address,
    pub name: String,
    /// Region used for proximity scoring (e.g. "us-east").
    pub region: String,
    /// Measured latency to customer regions, from the health feed.
    #[serde(default)]
    pub latency_ms: BTreeMap<String, u32>,
    pub total_nodes: u32,
    pub available_nodes: u32,
    pub total_gpus: u32,
    pub available_gpus: u32,
    /// Recent reliability signal (0–10_000 bps) from the health feed.
    pub reliability_bps: u32,
    /// Node operators sharing the provider reward.
    #[serde(default)]
    pub node_operators: Vec<Address>,
    pub status: ClusterStatus,
    pub created_height: u64,
    pub updated_height: u64,
}

impl HPCCluster {
    pub fn is_active(&self) -> bool {
        self.status == ClusterStatus::Active
    }

    pub fn has_capacity(&self, nodes: u32, gpus: u32) -> bool {
        self.available_nodes >= nodes && self.available_gpus >= gpus
    }

    /// `available <= total` for both nodes and GPUs.
    pub fn capacity_consistent(&self) -> bool {
        self.available_nodes <= self.total_nodes && self.available_gpus <= self.total_gpus
    }

    /// Reserve capacity for a queued job.
    pub fn allocate(&mut self, nodes: u32, gpus: u32) -> Result<(), CapacityError> {
        if !self.has_capacity(nodes, gpus) {
            return Err(CapacityError::Insufficient {
                cluster: self.id.clone(),
                nodes,
                gpus,
                available_nodes: self.available_nodes,
                available_gpus: self.available_gpus,
            });
        }
        self.available_nodes -= nodes;
        self.available_gpus -= gpus;
        Ok(())
    }

    /// Return capacity held by a job that reached a terminal state.
    pub fn release(&mut self, nodes: u32, gpus: u32) -> Result<(), CapacityError> {
        let next_nodes = self.available_nodes.saturating_add(nodes);
        let next_gpus = self.available_gpus.saturating_add(gpus);
        if next_nodes > self.total_nodes || next_gpus > self.total_gpus {
            return Err(CapacityError::InvariantViolated {
                cluster: self.id.clone(),
                available_nodes: next_nodes,
                total_nodes: self.total_nodes,
                available_gpus: next_gpus,
                total_gpus: self.total_gpus,
            });
        }
        self.available_nodes = next_nodes;
        self.available_gpus = next_gpus;
        Ok(())
    }
}

// ── Offering ──────────────────────────────────────────────────────

/// A priced resource class on a cluster.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HPCOffering {
    pub id: OfferingId,
    pub cluster_id: ClusterId,
    pub name: String,
    pub resource_type: ResourceKind,
    #[serde(default)]
    pub gpu_model: Option<String>,
    /// Price per unit-hour of `resource_type`.
    pub price_per_hour: DecCoin,
    pub min_duration_secs: u64,
    pub max_duration_secs: u64,
    pub active: bool,
    pub created_height: u64,
    pub updated_height: u64,
}

impl HPCOffering {
    /// Build the offering id for the offerings table.
    pub fn make_id(cluster_id: &str, name: &str) -> OfferingId {
        format!("{cluster_id}/{name}")
    }

    pub fn accepts_duration(&self, duration_secs: u64) -> bool {
        duration_secs >= self.min_duration_secs && duration_secs <= self.max_duration_secs
    }
}

// ── Templates ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TemplateStatus {
    Pending,
    Approved,
    Revoked,
}

/// Governance status of a workload template, as fed to the engine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkloadTemplate {
    pub id: TemplateId,
    pub status: TemplateStatus,
    pub updated_height: u64,
}

// ── Job ───────────────────────────────────────────────────────────

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Queued,
    Starting,
    Running,
    Suspended,
    Completed,
    Failed,
    Cancelled,
    Timeout,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Failed | JobState::Cancelled | JobState::Timeout
        )
    }

    /// States in which the job holds cluster capacity.
    pub fn holds_capacity(&self) -> bool {
        matches!(
            self,
            JobState::Queued | JobState::Starting | JobState::Running | JobState::Suspended
        )
    }

    pub fn label(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Queued => "queued",
            JobState::Starting => "starting",
            JobState::Running => "running",
            JobState::Suspended => "suspended",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Cancelled => "cancelled",
            JobState::Timeout => "timeout",
        }
    }
}

/// One applied state transition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobTransition {
    pub from: JobState,
    pub to: JobState,
    pub height: u64,
    pub time: u64,
    pub reason: String,
}

/// Where a job's settlement stands after it reached a terminal state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SettlementStatus {
    Unsettled,
    PendingRetry { attempts: u32, last_error: String },
    Settled { reward_id: String },
    /// Retry limit reached; needs operator action.
    Abandoned { attempts: u32, last_error: String },
}

/// A customer-submitted unit of work.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HPCJob {
    pub id: JobId,
    pub customer: Address,
    #[serde(default)]
    pub template_id: Option<TemplateId>,
    pub resource_type: ResourceKind,
    pub nodes: u32,
    pub gpus: u32,
    #[serde(default)]
    pub gpu_model: Option<String>,
    /// Duration ceiling enforced by the engine.
    pub max_duration_secs: u64,
    /// Budget ceiling, locked in escrow at submission.
    pub budget: Coin,
    /// Customer's declared region for proximity scoring.
    pub region: String,
    #[serde(default)]
    pub promo_code: Option<String>,
    pub state: JobState,
    /// The one active scheduling decision, if any.
    pub active_decision_id: Option<DecisionId>,
    /// Approved placement, set when the job is queued.
    pub cluster_id: Option<ClusterId>,
    pub offering_id: Option<OfferingId>,
    pub provider: Option<Address>,
    /// Escrow account reference.
    pub escrow_id: String,
    /// Latest cumulative usage reported by the provider.
    pub usage: UsageMetrics,
    pub usage_reported: bool,
    pub created_height: u64,
    pub created_time: u64,
    pub queued_time: Option<u64>,
    pub started_time: Option<u64>,
    pub finished_time: Option<u64>,
    pub updated_height: u64,
    #[serde(default)]
    pub history: Vec<JobTransition>,
    pub settlement: SettlementStatus,
}

impl HPCJob {
    /// Apply a state change and append it to the history.
    pub fn record_transition(&mut self, to: JobState, ctx: &BlockContext, reason: &str) {
        self.history.push(JobTransition {
            from: self.state,
            to,
            height: ctx.height,
            time: ctx.time,
            reason: reason.to_string(),
        });
        self.state = to;
        self.updated_height = ctx.height;
    }

    /// Seconds the job has been running (including suspensions).
    pub fn elapsed_run_secs(&self, now: u64) -> u64 {
        match self.started_time {
            Some(started) => {
                let end = self.finished_time.unwrap_or(now);
                end.saturating_sub(started)
            }
            None => 0,
        }
    }
}

// ── Scheduling decision ───────────────────────────────────────────

/// Why a decision was created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionOrigin {
    Submission,
    Reschedule,
    Fallback,
}

/// The engine's binding choice of cluster for a job. Never mutated.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SchedulingDecision {
    pub id: DecisionId,
    pub job_id: JobId,
    pub cluster_id: ClusterId,
    pub offering_id: OfferingId,
    pub score_bps: u64,
    pub estimated_cost: Amount,
    pub created_height: u64,
    pub created_time: u64,
    pub max_age_blocks: u64,
    pub max_age_secs: u64,
    pub origin: DecisionOrigin,
    /// The decision this one superseded.
    pub supersedes: Option<DecisionId>,
}

impl SchedulingDecision {
    /// Decision age as (blocks, seconds).
    pub fn age(&self, ctx: &BlockContext) -> (u64, u64) {
        (
            ctx.blocks_since(self.created_height),
            ctx.secs_since(self.created_time),
        )
    }

    pub fn exceeds_block_age(&self, ctx: &BlockContext) -> bool {
        ctx.blocks_since(self.created_height) > self.max_age_blocks
    }

    pub fn exceeds_time_age(&self, ctx: &BlockContext) -> bool {
        ctx.secs_since(self.created_time) > self.max_age_secs
    }
}

// ── Routing audit ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingStatus {
    Approved,
    Fallback,
    Rejected,
    Rescheduled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationKind {
    MissingDecision,
    StaleDecision,
    ClusterMismatch,
    ClusterUnavailable,
    NoCapacity,
}

impl ViolationKind {
    pub fn label(&self) -> &'static str {
        match self {
            ViolationKind::MissingDecision => "missing_decision",
            ViolationKind::StaleDecision => "stale_decision",
            ViolationKind::ClusterMismatch => "cluster_mismatch",
            ViolationKind::ClusterUnavailable => "cluster_unavailable",
            ViolationKind::NoCapacity => "no_capacity",
        }
    }
}

/// One enforcement call's outcome. Write-once.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RoutingAuditRecord {
    pub id: RecordId,
    pub job_id: JobId,
    pub sequence: u64,
    pub decision_id: Option<DecisionId>,
    pub expected_cluster: Option<ClusterId>,
    pub actual_cluster: ClusterId,
    /// Cluster the job may run on, when the call succeeded.
    pub approved_cluster: Option<ClusterId>,
    pub status: RoutingStatus,
    pub violation: Option<ViolationKind>,
    pub reason: String,
    pub is_fallback: bool,
    pub decision_age_blocks: u64,
    pub decision_age_secs: u64,
    pub provider: Address,
    pub mode: EnforcementMode,
    pub created_height: u64,
    pub created_time: u64,
}

/// Cumulative routing violations attributed to a provider.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProviderViolations {
    pub provider: Address,
    pub count: u64,
    /// Whether the alert threshold has already been signalled.
    pub alerted: bool,
    pub last_height: u64,
}

// ── Accounting ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisputeStatus {
    None,
    Flagged,
    UnderReview,
    Upheld,
    Rejected,
    PartialAdjustment,
}

impl DisputeStatus {
    pub fn is_resolved(&self) -> bool {
        matches!(
            self,
            DisputeStatus::Upheld | DisputeStatus::Rejected | DisputeStatus::PartialAdjustment
        )
    }

    pub fn is_open(&self) -> bool {
        matches!(self, DisputeStatus::Flagged | DisputeStatus::UnderReview)
    }
}

/// A per-period usage and charge snapshot for a job. Never mutated.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HPCAccountingRecord {
    pub id: RecordId,
    pub job_id: JobId,
    pub sequence: u64,
    pub cluster_id: ClusterId,
    pub provider: Address,
    pub customer: Address,
    pub period_start: u64,
    pub period_end: u64,
    pub usage: UsageMetrics,
    /// Charge before discounts, floor and cap.
    pub gross_charge: Amount,
    pub charge: Amount,
    pub is_final: bool,
    pub job_state: JobState,
    /// Hex SHA-256 over the record's canonical content.
    pub content_hash: String,
    /// Dispute status at creation. Live status is on the dispute.
    pub dispute_status: DisputeStatus,
    pub created_height: u64,
    pub created_time: u64,
}

/// Node-agent observed usage for a job period, used for reconciliation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UsageSnapshot {
    pub job_id: JobId,
    pub period_start: u64,
    pub period_end: u64,
    pub usage: UsageMetrics,
    pub source: String,
    pub recorded_height: u64,
}

impl UsageSnapshot {
    pub fn table_key(&self) -> String {
        format!("{}:{:012}", self.job_id, self.period_end)
    }
}

/// Moderator resolution of a dispute.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DisputeOutcome {
    Upheld { revised_charge: Amount },
    Rejected,
    PartialAdjustment { correction_bps: u32 },
}

/// A flagged discrepancy in an accounting record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Dispute {
    pub id: DisputeId,
    pub record_id: RecordId,
    pub job_id: JobId,
    pub raised_by: Address,
    pub reason: String,
    pub status: DisputeStatus,
    /// Raised by reconciliation rather than a principal.
    pub automatic: bool,
    /// Observed usage that triggered an automatic dispute.
    #[serde(default)]
    pub observed_usage: Option<UsageMetrics>,
    pub reviewer: Option<Address>,
    pub outcome: Option<DisputeOutcome>,
    pub created_height: u64,
    pub reviewed_height: Option<u64>,
    pub resolved_height: Option<u64>,
}

/// Resolution record produced when a dispute resolves. The disputed
/// accounting record stays untouched.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AccountingAdjustment {
    pub id: RecordId,
    pub job_id: JobId,
    pub record_id: RecordId,
    pub dispute_id: DisputeId,
    pub original_charge: Amount,
    pub revised_charge: Amount,
    pub outcome: DisputeOutcome,
    pub created_height: u64,
}

impl AccountingAdjustment {
    /// Amount owed back to the customer.
    pub fn refund(&self) -> Amount {
        self.original_charge.saturating_sub(self.revised_charge)
    }
}

// ── Settlement ────────────────────────────────────────────────────

/// How a finalized job's charge was split.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HPCRewardRecord {
    pub id: String,
    pub job_id: JobId,
    /// Accounting record the split was computed from.
    pub accounting_record_id: RecordId,
    pub provider: Address,
    pub charge: Amount,
    pub platform_fee: Amount,
    pub provider_reward: Amount,
    pub provider_share: Amount,
    pub operator_shares: BTreeMap<Address, Amount>,
    /// Deferred compensation netted out of the charge.
    pub compensation_netted: Amount,
    /// Escrow remainder released back to the customer.
    pub refunded: Amount,
    pub created_height: u64,
    pub created_time: u64,
}

impl HPCRewardRecord {
    pub fn make_id(job_id: &str) -> String {
        format!("reward/{job_id}")
    }

    pub fn operator_total(&self) -> Amount {
        self.operator_shares.values().sum()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SettlementEntryKind {
    Settlement,
    Compensation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    Executed,
    /// Recorded before settlement; netted into the final charge.
    Deferred,
    Netted,
}

/// A single fund movement.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TransferLeg {
    pub from: String,
    pub to: String,
    pub amount: Amount,
}

/// Append-only ledger of fund movements for a job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SettlementEntry {
    pub id: RecordId,
    pub job_id: JobId,
    pub kind: SettlementEntryKind,
    pub dispute_id: Option<DisputeId>,
    pub amount: Amount,
    pub legs: Vec<TransferLeg>,
    pub status: EntryStatus,
    pub created_height: u64,
}

/// Idempotency marker written exactly once per finalized job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FinalizationMarker {
    pub job_id: JobId,
    pub reward_id: String,
    pub accounting_record_id: RecordId,
    pub finalized_height: u64,
}

// ── Customers & params ────────────────────────────────────────────

/// Per-customer aggregates feeding discount eligibility.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CustomerStats {
    pub address: Address,
    pub first_seen_time: u64,
    pub cumulative_spend: Amount,
    pub jobs_submitted: u64,
}

/// A stored engine params version.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ParamsEpoch {
    pub version: u64,
    pub effective_height: u64,
    pub params: EngineParams,
}
