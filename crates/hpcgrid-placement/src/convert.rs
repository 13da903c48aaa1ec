//! Type conversions between state store types and placement types.
//!
//! Bridges `hpcgrid_state::{HPCCluster, HPCOffering, HPCJob}` to the
//! scheduler's `ClusterCandidate` and `PlacementRequest`.

use hpcgrid_state::{HPCJob, StateStore};

use crate::error::PlacementResult;
use crate::scorer::{ClusterCandidate, PlacementRequest};

/// Convert an [`HPCJob`] to a [`PlacementRequest`].
pub fn job_to_request(job: &HPCJob) -> PlacementRequest {
    PlacementRequest {
        job_id: job.id.clone(),
        resource_type: job.resource_type,
        nodes: job.nodes,
        gpus: job.gpus,
        gpu_model: job.gpu_model.clone(),
        duration_secs: job.max_duration_secs,
        budget: job.budget.amount,
        region: job.region.clone(),
    }
}

/// Every (cluster, offering) pair in the store, in cluster id order.
///
/// Status and capacity filtering is left to the scorer.
pub fn load_candidates(store: &StateStore) -> PlacementResult<Vec<ClusterCandidate>> {
    let mut candidates = Vec::new();
    for cluster in store.list_clusters()? {
        for offering in store.list_offerings_for_cluster(&cluster.id)? {
            candidates.push(ClusterCandidate {
                cluster: cluster.clone(),
                offering,
            });
        }
    }
    Ok(candidates)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use hpc_core::{Coin, DecCoin, ResourceKind, UsageMetrics};
    use hpcgrid_state::*;
    use rust_decimal_macros::dec;

    use super::*;

    fn sample_cluster(id: &str) -> HPCCluster {
        HPCCluster {
            id: id.to_string(),
            provider: "provider1".to_string(),
            name: id.to_string(),
            region: "us-east".to_string(),
            latency_ms: BTreeMap::new(),
            total_nodes: 10,
            available_nodes: 10,
            total_gpus: 0,
            available_gpus: 0,
            reliability_bps: 10_000,
            node_operators: Vec::new(),
            status: ClusterStatus::Active,
            created_height: 1,
            updated_height: 1,
        }
    }

    fn sample_offering(cluster: &str, name: &str) -> HPCOffering {
        HPCOffering {
            id: HPCOffering::make_id(cluster, name),
            cluster_id: cluster.to_string(),
            name: name.to_string(),
            resource_type: ResourceKind::Node,
            gpu_model: None,
            price_per_hour: DecCoin::new(dec!(12.5), "uve"),
            min_duration_secs: 60,
            max_duration_secs: 86_400,
            active: true,
            created_height: 1,
            updated_height: 1,
        }
    }

    #[test]
    fn loads_pairs_per_cluster() {
        let store = StateStore::open_in_memory().unwrap();
        let mut batch = WriteBatch::new();
        batch.put_cluster(&sample_cluster("c1")).unwrap();
        batch.put_cluster(&sample_cluster("c2")).unwrap();
        batch.put_offering(&sample_offering("c1", "std")).unwrap();
        batch.put_offering(&sample_offering("c1", "large")).unwrap();
        batch.put_offering(&sample_offering("c2", "std")).unwrap();
        store.commit(batch).unwrap();

        let candidates = load_candidates(&store).unwrap();
        let pairs: Vec<(&str, &str)> = candidates
            .iter()
            .map(|c| (c.cluster.id.as_str(), c.offering.name.as_str()))
            .collect();
        assert_eq!(pairs, vec![("c1", "large"), ("c1", "std"), ("c2", "std")]);
    }

    #[test]
    fn job_request_carries_allocation() {
        let job = HPCJob {
            id: "job-000001".to_string(),
            customer: "customer1".to_string(),
            template_id: None,
            resource_type: ResourceKind::Gpu,
            nodes: 1,
            gpus: 4,
            gpu_model: Some("a100".to_string()),
            max_duration_secs: 7_200,
            budget: Coin::new(1_000_000, "uve"),
            region: "eu-west".to_string(),
            promo_code: None,
            state: JobState::Pending,
            active_decision_id: None,
            cluster_id: None,
            offering_id: None,
            provider: None,
            escrow_id: "job-000001".to_string(),
            usage: UsageMetrics::default(),
            usage_reported: false,
            created_height: 1,
            created_time: 1,
            queued_time: None,
            started_time: None,
            finished_time: None,
            updated_height: 1,
            history: Vec::new(),
            settlement: SettlementStatus::Unsettled,
        };
        let req = job_to_request(&job);
        assert_eq!(req.gpus, 4);
        assert_eq!(req.duration_secs, 7_200);
        assert_eq!(req.budget, 1_000_000);
        assert_eq!(req.gpu_model.as_deref(), Some("a100"));
    }
}
