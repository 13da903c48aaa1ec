//! Scheduling engine — ranks candidates and emits decisions.
//!
//! Given a job's placement request and the registered clusters, the
//! scheduler:
//! 1. Scores every feasible (cluster, offering) pair (using scorer)
//! 2. Orders them by score, breaking ties by lowest cluster id
//! 3. Wraps the winner in an immutable `SchedulingDecision`

use std::collections::BTreeSet;

use tracing::{debug, info, warn};

use hpc_core::{BlockContext, ClusterId, DecisionId, HPCBillingRules, SchedulingParams};
use hpcgrid_state::{DecisionOrigin, SchedulingDecision};

use crate::error::{PlacementError, PlacementResult};
use crate::scorer::{ClusterCandidate, ClusterScore, PlacementRequest, score_candidate};

/// Identity of the decision being produced.
#[derive(Debug, Clone)]
pub struct DecisionMeta {
    pub id: DecisionId,
    pub origin: DecisionOrigin,
    pub supersedes: Option<DecisionId>,
}

/// Deterministic scheduler over one params epoch.
pub struct Scheduler<'a> {
    params: &'a SchedulingParams,
    rules: &'a HPCBillingRules,
}

impl<'a> Scheduler<'a> {
    pub fn new(params: &'a SchedulingParams, rules: &'a HPCBillingRules) -> Self {
        Self { params, rules }
    }

    /// Score all candidates and return feasible ones, best first.
    ///
    /// Clusters in `exclude` are skipped (used when falling back away
    /// from an unavailable cluster).
    pub fn rank(
        &self,
        req: &PlacementRequest,
        candidates: &[ClusterCandidate],
        exclude: &BTreeSet<ClusterId>,
    ) -> PlacementResult<Vec<ClusterScore>> {
        let mut scores = Vec::new();
        for candidate in candidates {
            if exclude.contains(&candidate.cluster.id) {
                continue;
            }
            if let Some(score) = score_candidate(candidate, req, self.params, self.rules)? {
                debug!(
                    cluster = %score.cluster_id,
                    offering = %score.offering_id,
                    score = score.score_bps,
                    cost = score.estimated_cost,
                    "candidate scored"
                );
                scores.push(score);
            }
        }

        scores.sort_by(|a, b| {
            b.score_bps
                .cmp(&a.score_bps)
                .then_with(|| a.cluster_id.cmp(&b.cluster_id))
                .then_with(|| a.offering_id.cmp(&b.offering_id))
        });
        Ok(scores)
    }

    /// Pick the best candidate and build a decision for it.
    pub fn schedule(
        &self,
        req: &PlacementRequest,
        candidates: &[ClusterCandidate],
        exclude: &BTreeSet<ClusterId>,
        ctx: &BlockContext,
        meta: DecisionMeta,
    ) -> PlacementResult<SchedulingDecision> {
        let ranked = self.rank(req, candidates, exclude)?;
        let Some(best) = ranked.into_iter().next() else {
            warn!(
                job = %req.job_id,
                candidates = candidates.len(),
                excluded = exclude.len(),
                "no cluster can take job"
            );
            return Err(PlacementError::NoCapacityAvailable {
                job_id: req.job_id.clone(),
                considered: candidates.len(),
            });
        };

        info!(
            job = %req.job_id,
            decision = %meta.id,
            cluster = %best.cluster_id,
            score = best.score_bps,
            origin = ?meta.origin,
            "scheduling decision created"
        );

        Ok(SchedulingDecision {
            id: meta.id,
            job_id: req.job_id.clone(),
            cluster_id: best.cluster_id,
            offering_id: best.offering_id,
            score_bps: best.score_bps,
            estimated_cost: best.estimated_cost,
            created_height: ctx.height,
            created_time: ctx.time,
            max_age_blocks: self.params.decision_max_age_blocks,
            max_age_secs: self.params.decision_max_age_secs,
            origin: meta.origin,
            supersedes: meta.supersedes,
        })
    }
}
