//! Cluster scoring for scheduling decisions.
//!
//! Evaluates candidate (cluster, offering) pairs using a weighted
//! combination of:
//! - **Proximity**: latency or region distance to the customer's region
//! - **Price**: how much of the budget the estimated cost leaves unused
//! - **Reliability**: the cluster's recent health signal
//!
//! All scores are integer basis points so identical inputs give identical
//! rankings on every replica.

use serde::{Deserialize, Serialize};

use hpc_core::{
    Amount, BPS_DENOMINATOR, ClusterId, HPCBillingRules, JobId, OfferingId, ResourceKind,
    SchedulingParams,
};
use hpcgrid_billing::{estimate_allocation_charge, offering_rates};
use hpcgrid_state::{HPCCluster, HPCOffering};

use crate::error::PlacementResult;

/// Score for an exact region match without a latency measurement.
const SAME_REGION_BPS: u64 = 10_000;

/// Score for a region in the same geography (`us-east` vs `us-west`).
const SAME_GEOGRAPHY_BPS: u64 = 5_000;

/// What a job needs from a cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlacementRequest {
    pub job_id: JobId,
    pub resource_type: ResourceKind,
    pub nodes: u32,
    pub gpus: u32,
    pub gpu_model: Option<String>,
    pub duration_secs: u64,
    pub budget: Amount,
    pub region: String,
}

/// A cluster together with one of its offerings.
#[derive(Debug, Clone)]
pub struct ClusterCandidate {
    pub cluster: HPCCluster,
    pub offering: HPCOffering,
}

/// Individual score components for debugging and audit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScoreBreakdown {
    pub proximity_bps: u64,
    pub price_bps: u64,
    pub reliability_bps: u64,
}

/// Scored candidate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterScore {
    pub cluster_id: ClusterId,
    pub offering_id: OfferingId,
    /// Weighted total, 0..=10_000.
    pub score_bps: u64,
    pub estimated_cost: Amount,
    pub breakdown: ScoreBreakdown,
}

/// Hard constraints. A candidate failing any of them is not scored.
fn is_feasible(candidate: &ClusterCandidate, req: &PlacementRequest) -> bool {
    let ClusterCandidate { cluster, offering } = candidate;
    if !cluster.is_active() || !offering.active || offering.cluster_id != cluster.id {
        return false;
    }
    if offering.resource_type != req.resource_type {
        return false;
    }
    if let Some(model) = &req.gpu_model {
        if offering.gpu_model.as_ref() != Some(model) {
            return false;
        }
    }
    offering.accepts_duration(req.duration_secs) && cluster.has_capacity(req.nodes, req.gpus)
}

/// Proximity in bps, or `None` when the measured latency is over the limit.
fn proximity_bps(cluster: &HPCCluster, region: &str, max_latency_ms: u32) -> Option<u64> {
    if let Some(latency) = cluster.latency_ms.get(region) {
        if *latency > max_latency_ms {
            return None;
        }
        if max_latency_ms == 0 {
            return Some(BPS_DENOMINATOR);
        }
        let headroom = u64::from(max_latency_ms - latency);
        return Some(headroom * BPS_DENOMINATOR / u64::from(max_latency_ms));
    }
    if cluster.region == region {
        return Some(SAME_REGION_BPS);
    }
    let geography = |r: &str| r.split('-').next().unwrap_or_default().to_string();
    if !region.is_empty() && geography(&cluster.region) == geography(region) {
        return Some(SAME_GEOGRAPHY_BPS);
    }
    Some(0)
}

fn price_bps(cost: Amount, budget: Amount) -> u64 {
    if budget == 0 {
        return if cost == 0 { BPS_DENOMINATOR } else { 0 };
    }
    let unused = u128::from(budget.saturating_sub(cost));
    (unused * u128::from(BPS_DENOMINATOR) / u128::from(budget)) as u64
}

/// Score a single candidate. `Ok(None)` means the candidate is infeasible.
pub fn score_candidate(
    candidate: &ClusterCandidate,
    req: &PlacementRequest,
    params: &SchedulingParams,
    rules: &HPCBillingRules,
) -> PlacementResult<Option<ClusterScore>> {
    if !is_feasible(candidate, req) {
        return Ok(None);
    }
    let ClusterCandidate { cluster, offering } = candidate;

    let Some(proximity) = proximity_bps(cluster, &req.region, params.max_latency_ms) else {
        return Ok(None);
    };

    let rates = offering_rates(&rules.rates, offering.resource_type, offering.price_per_hour.amount);
    let estimated_cost = estimate_allocation_charge(
        req.nodes,
        req.gpus,
        req.gpu_model.as_deref(),
        req.duration_secs,
        &rates,
        rules,
    )?;
    if estimated_cost > req.budget {
        return Ok(None);
    }

    let breakdown = ScoreBreakdown {
        proximity_bps: proximity,
        price_bps: price_bps(estimated_cost, req.budget),
        reliability_bps: u64::from(cluster.reliability_bps).min(BPS_DENOMINATOR),
    };
    let w = &params.weights;
    let weighted = breakdown.proximity_bps * u64::from(w.proximity_bps)
        + breakdown.price_bps * u64::from(w.price_bps)
        + breakdown.reliability_bps * u64::from(w.reliability_bps);

    Ok(Some(ClusterScore {
        cluster_id: cluster.id.clone(),
        offering_id: offering.id.clone(),
        score_bps: weighted / BPS_DENOMINATOR,
        estimated_cost,
        breakdown,
    }))
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use hpc_core::{DecCoin, ScoringWeights};
    use hpcgrid_state::ClusterStatus;
    use rust_decimal_macros::dec;

    use super::*;

    fn make_candidate(id: &str, region: &str, available_nodes: u32) -> ClusterCandidate {
        ClusterCandidate {
            cluster: HPCCluster {
                id: id.to_string(),
                provider: "provider1".to_string(),
                name: id.to_string(),
                region: region.to_string(),
                latency_ms: BTreeMap::new(),
                total_nodes: 10,
                available_nodes,
                total_gpus: 0,
                available_gpus: 0,
                reliability_bps: 10_000,
                node_operators: Vec::new(),
                status: ClusterStatus::Active,
                created_height: 1,
                updated_height: 1,
            },
            offering: HPCOffering {
                id: HPCOffering::make_id(id, "std"),
                cluster_id: id.to_string(),
                name: "std".to_string(),
                resource_type: ResourceKind::Node,
                gpu_model: None,
                price_per_hour: DecCoin::new(dec!(12.5), "uve"),
                min_duration_secs: 60,
                max_duration_secs: 86_400,
                active: true,
                created_height: 1,
                updated_height: 1,
            },
        }
    }

    fn default_req() -> PlacementRequest {
        PlacementRequest {
            job_id: "job-000001".to_string(),
            resource_type: ResourceKind::Node,
            nodes: 4,
            gpus: 0,
            gpu_model: None,
            duration_secs: 1_800,
            budget: 500,
            region: "us-east".to_string(),
        }
    }

    fn score(candidate: &ClusterCandidate, req: &PlacementRequest) -> Option<ClusterScore> {
        score_candidate(
            candidate,
            req,
            &SchedulingParams::default(),
            &HPCBillingRules::default(),
        )
        .unwrap()
    }

    #[test]
    fn scores_feasible_candidate() {
        let s = score(&make_candidate("c1", "us-east", 10), &default_req()).unwrap();
        assert_eq!(s.estimated_cost, 25);
        assert_eq!(s.breakdown.proximity_bps, 10_000);
        // (500 - 25) / 500
        assert_eq!(s.breakdown.price_bps, 9_500);
        // 0.4 * 10000 + 0.35 * 9500 + 0.25 * 10000
        assert_eq!(s.score_bps, 9_825);
    }

    #[test]
    fn rejects_insufficient_nodes() {
        assert!(score(&make_candidate("c1", "us-east", 3), &default_req()).is_none());
    }

    #[test]
    fn rejects_over_budget() {
        let mut req = default_req();
        req.budget = 24;
        assert!(score(&make_candidate("c1", "us-east", 10), &req).is_none());
    }

    #[test]
    fn rejects_unavailable_cluster_and_inactive_offering() {
        let mut c = make_candidate("c1", "us-east", 10);
        c.cluster.status = ClusterStatus::Unavailable;
        assert!(score(&c, &default_req()).is_none());

        let mut c = make_candidate("c1", "us-east", 10);
        c.offering.active = false;
        assert!(score(&c, &default_req()).is_none());
    }

    #[test]
    fn rejects_duration_outside_offering_window() {
        let mut req = default_req();
        req.duration_secs = 30;
        assert!(score(&make_candidate("c1", "us-east", 10), &req).is_none());
    }

    #[test]
    fn gpu_model_must_match() {
        let mut c = make_candidate("c1", "us-east", 10);
        c.cluster.total_gpus = 8;
        c.cluster.available_gpus = 8;
        c.offering.resource_type = ResourceKind::Gpu;
        c.offering.gpu_model = Some("a100".to_string());

        let mut req = default_req();
        req.resource_type = ResourceKind::Gpu;
        req.nodes = 1;
        req.gpus = 2;
        req.gpu_model = Some("h100".to_string());
        assert!(score(&c, &req).is_none());

        req.gpu_model = Some("a100".to_string());
        assert!(score(&c, &req).is_some());
    }

    #[test]
    fn proximity_prefers_latency_then_region() {
        let mut measured = make_candidate("c1", "eu-west", 10);
        measured.cluster.latency_ms.insert("us-east".to_string(), 100);
        assert_eq!(proximity_bps(&measured.cluster, "us-east", 500), Some(8_000));
        assert_eq!(proximity_bps(&measured.cluster, "us-east", 50), None);

        let nearby = make_candidate("c2", "us-west", 10);
        assert_eq!(proximity_bps(&nearby.cluster, "us-east", 500), Some(5_000));
        let far = make_candidate("c3", "ap-south", 10);
        assert_eq!(proximity_bps(&far.cluster, "us-east", 500), Some(0));
    }

    #[test]
    fn weights_shift_ranking() {
        let near = make_candidate("c1", "us-east", 10);
        let mut reliable_far = make_candidate("c2", "ap-south", 10);
        reliable_far.cluster.reliability_bps = 10_000;
        let mut near_flaky = near.clone();
        near_flaky.cluster.reliability_bps = 2_000;

        let params = SchedulingParams {
            weights: ScoringWeights {
                proximity_bps: 0,
                price_bps: 0,
                reliability_bps: 10_000,
            },
            ..Default::default()
        };
        let rules = HPCBillingRules::default();
        let req = default_req();
        let a = score_candidate(&near_flaky, &req, &params, &rules).unwrap().unwrap();
        let b = score_candidate(&reliable_far, &req, &params, &rules).unwrap().unwrap();
        assert!(b.score_bps > a.score_bps);
    }
}
