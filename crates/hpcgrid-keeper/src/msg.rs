//! Externally ordered messages the keeper applies.
//!
//! Amounts arrive as coin strings (`"500uve"`, `"12.5uve"`) and are
//! parsed during validation.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use hpc_core::{Address, ClusterId, DisputeId, EngineParams, JobId, OfferingId, RecordId, ResourceKind, TemplateId, UsageMetrics};
use hpcgrid_lifecycle::SchedulerKind;
use hpcgrid_state::{ClusterStatus, DisputeOutcome, JobState, TemplateStatus};

fn default_reliability() -> u32 {
    10_000
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterCluster {
    pub provider: Address,
    pub cluster_id: ClusterId,
    pub name: String,
    pub region: String,
    #[serde(default)]
    pub latency_ms: BTreeMap<String, u32>,
    pub total_nodes: u32,
    #[serde(default)]
    pub total_gpus: u32,
    #[serde(default = "default_reliability")]
    pub reliability_bps: u32,
    #[serde(default)]
    pub node_operators: Vec<Address>,
}

/// Provider-side cluster edits. Absent fields are left unchanged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UpdateCluster {
    pub provider: Address,
    pub cluster_id: ClusterId,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub latency_ms: Option<BTreeMap<String, u32>>,
    #[serde(default)]
    pub total_nodes: Option<u32>,
    #[serde(default)]
    pub total_gpus: Option<u32>,
    #[serde(default)]
    pub node_operators: Option<Vec<Address>>,
}

/// Aggregated node-agent feed for one cluster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateClusterHealth {
    pub cluster_id: ClusterId,
    #[serde(default)]
    pub status: Option<ClusterStatus>,
    #[serde(default)]
    pub reliability_bps: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateOffering {
    pub provider: Address,
    pub cluster_id: ClusterId,
    pub name: String,
    pub resource_type: ResourceKind,
    #[serde(default)]
    pub gpu_model: Option<String>,
    pub price_per_hour: String,
    pub min_duration_secs: u64,
    pub max_duration_secs: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UpdateOffering {
    pub provider: Address,
    pub offering_id: OfferingId,
    #[serde(default)]
    pub price_per_hour: Option<String>,
    #[serde(default)]
    pub min_duration_secs: Option<u64>,
    #[serde(default)]
    pub max_duration_secs: Option<u64>,
    #[serde(default)]
    pub active: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmitJob {
    pub customer: Address,
    #[serde(default)]
    pub template_id: Option<TemplateId>,
    pub resource_type: ResourceKind,
    pub nodes: u32,
    #[serde(default)]
    pub gpus: u32,
    #[serde(default)]
    pub gpu_model: Option<String>,
    pub max_duration_secs: u64,
    pub budget: String,
    pub region: String,
    #[serde(default)]
    pub promo_code: Option<String>,
}

/// A provider's status report.
///
/// Either `state` (already normalized) or `scheduler` plus `raw_status`
/// must be given. `usage` is cumulative since the job started.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReportStatus {
    pub provider: Address,
    pub job_id: JobId,
    #[serde(default)]
    pub state: Option<JobState>,
    #[serde(default)]
    pub scheduler: Option<SchedulerKind>,
    #[serde(default)]
    pub raw_status: Option<String>,
    #[serde(default)]
    pub usage: Option<UsageMetrics>,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmitAccounting {
    pub provider: Address,
    pub job_id: JobId,
    pub period_start: u64,
    pub period_end: u64,
    pub usage: UsageMetrics,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordUsageSnapshot {
    pub job_id: JobId,
    pub period_start: u64,
    pub period_end: u64,
    pub usage: UsageMetrics,
    pub source: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Msg {
    RegisterCluster(RegisterCluster),
    UpdateCluster(UpdateCluster),
    DeregisterCluster {
        provider: Address,
        cluster_id: ClusterId,
    },
    UpdateClusterHealth(UpdateClusterHealth),
    CreateOffering(CreateOffering),
    UpdateOffering(UpdateOffering),
    SetTemplateStatus {
        authority: Address,
        template_id: TemplateId,
        status: TemplateStatus,
    },
    SubmitJob(SubmitJob),
    /// Ask for a fresh decision for a pending job.
    ScheduleJob {
        sender: Address,
        job_id: JobId,
    },
    PlaceJob {
        provider: Address,
        job_id: JobId,
        cluster_id: ClusterId,
    },
    ReportStatus(ReportStatus),
    CancelJob {
        sender: Address,
        job_id: JobId,
        #[serde(default)]
        reason: Option<String>,
    },
    SubmitAccounting(SubmitAccounting),
    RecordUsageSnapshot(RecordUsageSnapshot),
    FlagDispute {
        sender: Address,
        record_id: RecordId,
        reason: String,
    },
    BeginReview {
        moderator: Address,
        dispute_id: DisputeId,
    },
    ResolveDispute {
        moderator: Address,
        dispute_id: DisputeId,
        outcome: DisputeOutcome,
    },
    UpdateParams {
        authority: Address,
        params: Box<EngineParams>,
    },
}

impl Msg {
    pub fn kind(&self) -> &'static str {
        match self {
            Msg::RegisterCluster(_) => "register_cluster",
            Msg::UpdateCluster(_) => "update_cluster",
            Msg::DeregisterCluster { .. } => "deregister_cluster",
            Msg::UpdateClusterHealth(_) => "update_cluster_health",
            Msg::CreateOffering(_) => "create_offering",
            Msg::UpdateOffering(_) => "update_offering",
            Msg::SetTemplateStatus { .. } => "set_template_status",
            Msg::SubmitJob(_) => "submit_job",
            Msg::ScheduleJob { .. } => "schedule_job",
            Msg::PlaceJob { .. } => "place_job",
            Msg::ReportStatus(_) => "report_status",
            Msg::CancelJob { .. } => "cancel_job",
            Msg::SubmitAccounting(_) => "submit_accounting",
            Msg::RecordUsageSnapshot(_) => "record_usage_snapshot",
            Msg::FlagDispute { .. } => "flag_dispute",
            Msg::BeginReview { .. } => "begin_review",
            Msg::ResolveDispute { .. } => "resolve_dispute",
            Msg::UpdateParams { .. } => "update_params",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_tagged_json() {
        let raw = r#"{"type":"submit_job","customer":"alice","resource_type":"node",
            "nodes":4,"max_duration_secs":1800,"budget":"500uve","region":"us-east"}"#;
        let msg: Msg = serde_json::from_str(raw).unwrap();
        let Msg::SubmitJob(submit) = &msg else {
            panic!("wrong variant: {msg:?}");
        };
        assert_eq!(submit.nodes, 4);
        assert_eq!(submit.gpus, 0);
        assert_eq!(msg.kind(), "submit_job");

        let raw = r#"{"type":"report_status","provider":"p","job_id":"job-000001",
            "scheduler":"slurm","raw_status":"R"}"#;
        let msg: Msg = serde_json::from_str(raw).unwrap();
        assert!(matches!(msg, Msg::ReportStatus(ReportStatus { scheduler: Some(SchedulerKind::Slurm), .. })));

        let raw = r#"{"type":"resolve_dispute","moderator":"m","dispute_id":"dispute-000001",
            "outcome":{"outcome":"partial_adjustment","correction_bps":2000}}"#;
        let msg: Msg = serde_json::from_str(raw).unwrap();
        assert!(matches!(
            msg,
            Msg::ResolveDispute {
                outcome: DisputeOutcome::PartialAdjustment { correction_bps: 2_000 },
                ..
            }
        ));
    }
}
