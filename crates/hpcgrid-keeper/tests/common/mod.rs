//! Shared fixtures for keeper integration tests.

#![allow(dead_code)]

use hpc_core::{Amount, BlockContext, EngineParams, ResourceKind, UsageMetrics};
use hpcgrid_keeper::{
    CreateOffering, EngineEvent, Keeper, Msg, RegisterCluster, ReportStatus, SubmitJob,
};
use hpcgrid_settlement::{Account, Escrow, InMemoryEscrow};
use hpcgrid_state::{JobState, StateStore};

pub const MODERATOR: &str = "mod1";

pub fn ctx(height: u64, time: u64) -> BlockContext {
    BlockContext::new(height, time)
}

pub fn test_params() -> EngineParams {
    EngineParams {
        moderators: vec![MODERATOR.to_string()],
        ..Default::default()
    }
}

pub fn test_keeper(params: &EngineParams) -> Keeper<InMemoryEscrow> {
    Keeper::new(StateStore::open_in_memory().unwrap(), InMemoryEscrow::new(), params).unwrap()
}

pub fn balance(keeper: &Keeper<InMemoryEscrow>, address: &str) -> Amount {
    keeper.escrow().balance(&Account::address(address))
}

pub fn register_cluster(
    keeper: &mut Keeper<InMemoryEscrow>,
    at: BlockContext,
    cluster_id: &str,
    provider: &str,
    total_nodes: u32,
) {
    keeper
        .apply(
            &at,
            Msg::RegisterCluster(RegisterCluster {
                provider: provider.to_string(),
                cluster_id: cluster_id.to_string(),
                name: cluster_id.to_string(),
                region: "us-east".to_string(),
                latency_ms: Default::default(),
                total_nodes,
                total_gpus: 0,
                reliability_bps: 10_000,
                node_operators: Vec::new(),
            }),
        )
        .unwrap();
}

pub fn create_offering(
    keeper: &mut Keeper<InMemoryEscrow>,
    at: BlockContext,
    cluster_id: &str,
    provider: &str,
    price: &str,
) {
    keeper
        .apply(
            &at,
            Msg::CreateOffering(CreateOffering {
                provider: provider.to_string(),
                cluster_id: cluster_id.to_string(),
                name: "std".to_string(),
                resource_type: ResourceKind::Node,
                gpu_model: None,
                price_per_hour: price.to_string(),
                min_duration_secs: 60,
                max_duration_secs: 86_400,
            }),
        )
        .unwrap();
}

/// One cluster `c1` owned by `provider1` with ten nodes.
pub fn with_cluster(params: &EngineParams, price: &str) -> Keeper<InMemoryEscrow> {
    let mut keeper = test_keeper(params);
    register_cluster(&mut keeper, ctx(1, 100), "c1", "provider1", 10);
    create_offering(&mut keeper, ctx(1, 100), "c1", "provider1", price);
    keeper
}

pub fn submit_msg(customer: &str, nodes: u32, secs: u64, budget: &str) -> Msg {
    Msg::SubmitJob(SubmitJob {
        customer: customer.to_string(),
        template_id: None,
        resource_type: ResourceKind::Node,
        nodes,
        gpus: 0,
        gpu_model: None,
        max_duration_secs: secs,
        budget: budget.to_string(),
        region: "us-east".to_string(),
        promo_code: None,
    })
}

/// Submit a job and return its id.
pub fn submit(
    keeper: &mut Keeper<InMemoryEscrow>,
    at: BlockContext,
    customer: &str,
    nodes: u32,
    secs: u64,
    budget: &str,
) -> String {
    let events = keeper.apply(&at, submit_msg(customer, nodes, secs, budget)).unwrap();
    match &events[0] {
        EngineEvent::JobSubmitted { job_id, .. } => job_id.clone(),
        other => panic!("unexpected first event {other:?}"),
    }
}

pub fn place_msg(provider: &str, job_id: &str, cluster_id: &str) -> Msg {
    Msg::PlaceJob {
        provider: provider.to_string(),
        job_id: job_id.to_string(),
        cluster_id: cluster_id.to_string(),
    }
}

pub fn report_msg(provider: &str, job_id: &str, state: JobState, usage: Option<UsageMetrics>) -> Msg {
    Msg::ReportStatus(ReportStatus {
        provider: provider.to_string(),
        job_id: job_id.to_string(),
        state: Some(state),
        scheduler: None,
        raw_status: None,
        usage,
        reason: None,
    })
}

pub fn report(
    keeper: &mut Keeper<InMemoryEscrow>,
    at: BlockContext,
    provider: &str,
    job_id: &str,
    state: JobState,
    usage: Option<UsageMetrics>,
) -> Vec<EngineEvent> {
    keeper.apply(&at, report_msg(provider, job_id, state, usage)).unwrap()
}

pub fn node_usage(nodes: u64, secs: u64) -> UsageMetrics {
    UsageMetrics {
        wall_clock_secs: secs,
        node_secs: nodes * secs,
        ..Default::default()
    }
}

pub fn count_rewards(events: &[EngineEvent]) -> usize {
    events
        .iter()
        .filter(|e| matches!(e, EngineEvent::RewardDistributed { .. }))
        .count()
}
