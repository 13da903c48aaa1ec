//! Routing enforcement over the state store.

use std::collections::BTreeSet;

use tracing::{debug, info, warn};

use hpc_core::{
    BlockContext, ClusterId, DecisionId, EnforcementMode, EngineParams, OfferingId,
    StalenessAuthority,
};
use hpcgrid_placement::{DecisionMeta, PlacementError, Scheduler, job_to_request, load_candidates};
use hpcgrid_state::{
    DecisionOrigin, HPCCluster, HPCJob, ProviderViolations, RoutingAuditRecord, RoutingStatus,
    SchedulingDecision, StateResult, StateStore, ViolationKind, WriteBatch, sequence_key,
};

use crate::error::{RoutingError, RoutingResult};

/// Where the job is allowed to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingApproval {
    pub cluster_id: ClusterId,
    pub offering_id: OfferingId,
    /// Decision backing the approval (absent for audit-only approvals
    /// without one).
    pub decision_id: Option<DecisionId>,
    pub status: RoutingStatus,
}

/// Everything one enforcement call produced.
#[derive(Debug)]
pub struct RoutingOutcome {
    pub audit: RoutingAuditRecord,
    pub result: RoutingResult<RoutingApproval>,
    /// Decision created by re-scheduling or fallback. Supersedes the job's
    /// active decision.
    pub new_decision: Option<SchedulingDecision>,
    /// Updated counter for the provider, when the call was a violation.
    pub violations: Option<ProviderViolations>,
    /// The provider's counter crossed the alert threshold on this call.
    pub threshold_crossed: bool,
    /// The job's previous enforcement was rejected and this one approved.
    pub violation_resolved: bool,
}

impl RoutingOutcome {
    pub fn is_approved(&self) -> bool {
        self.result.is_ok()
    }

    /// Stage the audit record, new decision, and counter update.
    pub fn stage(&self, batch: &mut WriteBatch) -> StateResult<()> {
        batch.put_audit_record(&self.audit)?;
        if let Some(decision) = &self.new_decision {
            batch.put_decision(decision)?;
        }
        if let Some(violations) = &self.violations {
            batch.put_violations(violations)?;
        }
        Ok(())
    }
}

/// How the active decision relates to the proposed placement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Finding {
    Missing,
    Stale,
    Mismatch,
    Valid,
}

impl Finding {
    fn violation(self) -> Option<ViolationKind> {
        match self {
            Finding::Missing => Some(ViolationKind::MissingDecision),
            Finding::Stale => Some(ViolationKind::StaleDecision),
            Finding::Mismatch => Some(ViolationKind::ClusterMismatch),
            Finding::Valid => None,
        }
    }
}

/// A mode policy's conclusion, before it becomes an audit record.
struct Verdict {
    status: RoutingStatus,
    violation: Option<ViolationKind>,
    reason: String,
    is_fallback: bool,
    new_decision: Option<SchedulingDecision>,
    result: RoutingResult<RoutingApproval>,
}

impl Verdict {
    fn reject(violation: ViolationKind, reason: String, error: RoutingError) -> Self {
        Self {
            status: RoutingStatus::Rejected,
            violation: Some(violation),
            reason,
            is_fallback: false,
            new_decision: None,
            result: Err(error),
        }
    }

    fn approve(
        status: RoutingStatus,
        violation: Option<ViolationKind>,
        reason: String,
        approval: RoutingApproval,
    ) -> Self {
        Self {
            status,
            violation,
            reason,
            is_fallback: status == RoutingStatus::Fallback,
            new_decision: None,
            result: Ok(approval),
        }
    }

    fn with_decision(mut self, decision: SchedulingDecision) -> Self {
        self.new_decision = Some(decision);
        self
    }
}

fn unavailable_reason(cluster: &HPCCluster, job: &HPCJob) -> Option<String> {
    if !cluster.is_active() {
        return Some(format!("cluster status is {:?}", cluster.status).to_lowercase());
    }
    if !cluster.has_capacity(job.nodes, job.gpus) {
        return Some(format!(
            "needs {} nodes / {} gpus, {} / {} available",
            job.nodes, job.gpus, cluster.available_nodes, cluster.available_gpus
        ));
    }
    None
}

fn approval_from(decision: &SchedulingDecision, status: RoutingStatus) -> RoutingApproval {
    RoutingApproval {
        cluster_id: decision.cluster_id.clone(),
        offering_id: decision.offering_id.clone(),
        decision_id: Some(decision.id.clone()),
        status,
    }
}

/// Routing enforcer for one params epoch.
pub struct RoutingEnforcer<'a> {
    store: &'a StateStore,
    params: &'a EngineParams,
}

impl<'a> RoutingEnforcer<'a> {
    pub fn new(store: &'a StateStore, params: &'a EngineParams) -> Self {
        Self { store, params }
    }

    /// Check a proposed placement of `job` on `proposed`.
    ///
    /// The outer `Err` is reserved for internal failures. Policy and
    /// capacity outcomes, including rejections, are in
    /// [`RoutingOutcome::result`] alongside their audit record.
    pub fn enforce(
        &self,
        job: &HPCJob,
        proposed: &HPCCluster,
        ctx: &BlockContext,
    ) -> RoutingResult<RoutingOutcome> {
        let routing = &self.params.routing;
        let decision = match &job.active_decision_id {
            Some(id) => self.store.get_decision(id)?,
            None => None,
        };
        let (age_blocks, age_secs) = decision.as_ref().map(|d| d.age(ctx)).unwrap_or((0, 0));

        let mut notes = Vec::new();
        let finding = self.classify(decision.as_ref(), proposed, ctx, &mut notes);
        debug!(job = %job.id, cluster = %proposed.id, ?finding, mode = ?routing.mode, "enforcing routing");

        let mut verdict = match routing.mode {
            EnforcementMode::Strict => self.strict(job, decision.as_ref(), finding, proposed, ctx)?,
            EnforcementMode::Permissive => {
                self.permissive(job, decision.as_ref(), finding, proposed, ctx)?
            }
            EnforcementMode::AuditOnly => self.audit_only(job, decision.as_ref(), finding, proposed)?,
        };
        if !notes.is_empty() {
            verdict.reason = format!("{}; {}", verdict.reason, notes.join("; "));
        }

        let previous = self.store.list_audit_records(&job.id)?;
        let sequence = previous.len() as u64 + 1;
        let approved_cluster = verdict.result.as_ref().ok().map(|a| a.cluster_id.clone());
        let expected_cluster = decision
            .as_ref()
            .or(verdict.new_decision.as_ref())
            .map(|d| d.cluster_id.clone());

        let audit = RoutingAuditRecord {
            id: sequence_key(&job.id, sequence),
            job_id: job.id.clone(),
            sequence,
            decision_id: job.active_decision_id.clone(),
            expected_cluster,
            actual_cluster: proposed.id.clone(),
            approved_cluster,
            status: verdict.status,
            violation: verdict.violation,
            reason: verdict.reason,
            is_fallback: verdict.is_fallback,
            decision_age_blocks: age_blocks,
            decision_age_secs: age_secs,
            provider: proposed.provider.clone(),
            mode: routing.mode,
            created_height: ctx.height,
            created_time: ctx.time,
        };

        let (violations, threshold_crossed) = match finding.violation() {
            Some(kind) => {
                let (counter, crossed) = self.count_violation(&proposed.provider, ctx)?;
                warn!(
                    job = %job.id,
                    provider = %proposed.provider,
                    violation = kind.label(),
                    status = ?audit.status,
                    total = counter.count,
                    "routing violation"
                );
                (Some(counter), crossed)
            }
            None => (None, false),
        };

        let violation_resolved = verdict.result.is_ok()
            && previous
                .last()
                .is_some_and(|r| r.status == RoutingStatus::Rejected);

        match &verdict.result {
            Ok(approval) => info!(
                job = %job.id,
                cluster = %approval.cluster_id,
                status = ?approval.status,
                "routing approved"
            ),
            Err(e) => warn!(job = %job.id, cluster = %proposed.id, error = %e, "routing rejected"),
        }

        Ok(RoutingOutcome {
            audit,
            result: verdict.result,
            new_decision: verdict.new_decision,
            violations,
            threshold_crossed,
            violation_resolved,
        })
    }

    fn classify(
        &self,
        decision: Option<&SchedulingDecision>,
        proposed: &HPCCluster,
        ctx: &BlockContext,
        notes: &mut Vec<String>,
    ) -> Finding {
        let Some(decision) = decision else {
            return Finding::Missing;
        };
        let blocks_stale = decision.exceeds_block_age(ctx);
        let secs_stale = decision.exceeds_time_age(ctx);
        let stale = match self.params.routing.staleness_authority {
            StalenessAuthority::Blocks => {
                if secs_stale && !blocks_stale {
                    notes.push(format!(
                        "advisory: decision {}s old exceeds {}s",
                        ctx.secs_since(decision.created_time),
                        decision.max_age_secs
                    ));
                }
                blocks_stale
            }
            StalenessAuthority::Either => blocks_stale || secs_stale,
        };
        if stale {
            Finding::Stale
        } else if decision.cluster_id != proposed.id {
            Finding::Mismatch
        } else {
            Finding::Valid
        }
    }

    fn strict(
        &self,
        job: &HPCJob,
        decision: Option<&SchedulingDecision>,
        finding: Finding,
        proposed: &HPCCluster,
        ctx: &BlockContext,
    ) -> RoutingResult<Verdict> {
        let decision = match (finding, decision) {
            (Finding::Missing, _) | (_, None) => {
                return Ok(Verdict::reject(
                    ViolationKind::MissingDecision,
                    "no scheduling decision".to_string(),
                    RoutingError::MissingDecision {
                        job_id: job.id.clone(),
                    },
                ));
            }
            (_, Some(decision)) => decision,
        };
        let (age_blocks, age_secs) = decision.age(ctx);

        match finding {
            Finding::Stale if self.params.routing.auto_refresh_stale => {
                let Some(fresh) = self.reschedule(job, BTreeSet::new(), DecisionOrigin::Reschedule, ctx)?
                else {
                    return Ok(Verdict::reject(
                        ViolationKind::StaleDecision,
                        "stale decision; no capacity to refresh".to_string(),
                        RoutingError::NoCapacityAvailable {
                            job_id: job.id.clone(),
                        },
                    ));
                };
                if fresh.cluster_id != proposed.id {
                    let reason = format!(
                        "stale decision refreshed to {}, proposed {}",
                        fresh.cluster_id, proposed.id
                    );
                    let error = RoutingError::ClusterMismatch {
                        job_id: job.id.clone(),
                        expected: fresh.cluster_id.clone(),
                        actual: proposed.id.clone(),
                    };
                    return Ok(Verdict::reject(ViolationKind::ClusterMismatch, reason, error)
                        .with_decision(fresh));
                }
                let reason = format!("stale decision refreshed, placed on {}", fresh.cluster_id);
                let approval = approval_from(&fresh, RoutingStatus::Rescheduled);
                Ok(Verdict::approve(
                    RoutingStatus::Rescheduled,
                    Some(ViolationKind::StaleDecision),
                    reason,
                    approval,
                )
                .with_decision(fresh))
            }
            Finding::Stale => Ok(Verdict::reject(
                ViolationKind::StaleDecision,
                format!("decision {age_blocks} blocks / {age_secs}s old"),
                RoutingError::StaleDecision {
                    job_id: job.id.clone(),
                    decision_id: decision.id.clone(),
                    age_blocks,
                    age_secs,
                },
            )),
            Finding::Mismatch => Ok(Verdict::reject(
                ViolationKind::ClusterMismatch,
                format!("scheduled on {}, proposed {}", decision.cluster_id, proposed.id),
                RoutingError::ClusterMismatch {
                    job_id: job.id.clone(),
                    expected: decision.cluster_id.clone(),
                    actual: proposed.id.clone(),
                },
            )),
            Finding::Missing | Finding::Valid => {
                if let Some(reason) = unavailable_reason(proposed, job) {
                    return Ok(Verdict::reject(
                        ViolationKind::ClusterUnavailable,
                        reason.clone(),
                        RoutingError::ClusterUnavailable {
                            cluster_id: proposed.id.clone(),
                            reason,
                        },
                    ));
                }
                Ok(Verdict::approve(
                    RoutingStatus::Approved,
                    None,
                    "placement matches decision".to_string(),
                    approval_from(decision, RoutingStatus::Approved),
                ))
            }
        }
    }

    fn permissive(
        &self,
        job: &HPCJob,
        decision: Option<&SchedulingDecision>,
        finding: Finding,
        proposed: &HPCCluster,
        ctx: &BlockContext,
    ) -> RoutingResult<Verdict> {
        let decision = match (finding, decision) {
            (Finding::Missing | Finding::Stale, _) | (_, None) => {
                let violation = if decision.is_none() {
                    ViolationKind::MissingDecision
                } else {
                    ViolationKind::StaleDecision
                };
                let Some(fresh) = self.reschedule(job, BTreeSet::new(), DecisionOrigin::Reschedule, ctx)?
                else {
                    return Ok(Verdict::reject(
                        violation,
                        format!("{}; no capacity to re-schedule", violation.label()),
                        RoutingError::NoCapacityAvailable {
                            job_id: job.id.clone(),
                        },
                    ));
                };
                let mut reason = format!("{}; re-scheduled to {}", violation.label(), fresh.cluster_id);
                if fresh.cluster_id != proposed.id {
                    reason.push_str(&format!(" (proposed {})", proposed.id));
                }
                let approval = approval_from(&fresh, RoutingStatus::Rescheduled);
                return Ok(
                    Verdict::approve(RoutingStatus::Rescheduled, Some(violation), reason, approval)
                        .with_decision(fresh),
                );
            }
            (_, Some(decision)) => decision,
        };

        let scheduled = if decision.cluster_id == proposed.id {
            Some(proposed.clone())
        } else {
            self.store.get_cluster(&decision.cluster_id)?
        };
        let unavailable = match &scheduled {
            Some(cluster) => unavailable_reason(cluster, job),
            None => Some("cluster not registered".to_string()),
        };

        if let Some(why) = unavailable {
            let exclude = BTreeSet::from([decision.cluster_id.clone()]);
            let Some(alternative) = self.reschedule(job, exclude, DecisionOrigin::Fallback, ctx)? else {
                let reason = format!("{why}; no alternative cluster");
                return Ok(Verdict::reject(
                    ViolationKind::ClusterUnavailable,
                    reason.clone(),
                    RoutingError::ClusterUnavailable {
                        cluster_id: decision.cluster_id.clone(),
                        reason,
                    },
                ));
            };
            warn!(
                job = %job.id,
                from = %decision.cluster_id,
                to = %alternative.cluster_id,
                reason = %why,
                "falling back to alternative cluster"
            );
            let reason = format!(
                "scheduled cluster {} {why}; fell back to {}",
                decision.cluster_id, alternative.cluster_id
            );
            let approval = approval_from(&alternative, RoutingStatus::Fallback);
            return Ok(Verdict::approve(
                RoutingStatus::Fallback,
                finding.violation(),
                reason,
                approval,
            )
            .with_decision(alternative));
        }

        let reason = match finding {
            Finding::Mismatch => format!(
                "proposed {}, redirected to scheduled {}",
                proposed.id, decision.cluster_id
            ),
            _ => "placement matches decision".to_string(),
        };
        Ok(Verdict::approve(
            RoutingStatus::Approved,
            finding.violation(),
            reason,
            approval_from(decision, RoutingStatus::Approved),
        ))
    }

    fn audit_only(
        &self,
        job: &HPCJob,
        decision: Option<&SchedulingDecision>,
        finding: Finding,
        proposed: &HPCCluster,
    ) -> RoutingResult<Verdict> {
        // Audit-only waives policy, not physics. Approving a cluster that
        // cannot hold the job would push available capacity below zero, so
        // an unavailable or full cluster is still refused here. This is not
        // a policy violation and does not count against the provider.
        if let Some(reason) = unavailable_reason(proposed, job) {
            return Ok(Verdict::reject(
                ViolationKind::NoCapacity,
                reason.clone(),
                RoutingError::ClusterUnavailable {
                    cluster_id: proposed.id.clone(),
                    reason,
                },
            ));
        }

        let offering_id = match decision {
            Some(d) if d.cluster_id == proposed.id => Some(d.offering_id.clone()),
            _ => self.matching_offering(job, proposed)?,
        };
        let Some(offering_id) = offering_id else {
            let reason = "no matching offering on proposed cluster".to_string();
            return Ok(Verdict::reject(
                ViolationKind::ClusterUnavailable,
                reason.clone(),
                RoutingError::ClusterUnavailable {
                    cluster_id: proposed.id.clone(),
                    reason,
                },
            ));
        };

        let reason = match finding.violation() {
            Some(kind) => format!("audit only: {}", kind.label()),
            None => "placement matches decision".to_string(),
        };
        Ok(Verdict::approve(
            RoutingStatus::Approved,
            finding.violation(),
            reason,
            RoutingApproval {
                cluster_id: proposed.id.clone(),
                offering_id,
                decision_id: decision.map(|d| d.id.clone()),
                status: RoutingStatus::Approved,
            },
        ))
    }

    /// First active offering on `cluster` that fits the job's resource class.
    fn matching_offering(&self, job: &HPCJob, cluster: &HPCCluster) -> RoutingResult<Option<OfferingId>> {
        Ok(self
            .store
            .list_offerings_for_cluster(&cluster.id)?
            .into_iter()
            .find(|o| {
                o.active
                    && o.resource_type == job.resource_type
                    && (job.gpu_model.is_none() || o.gpu_model == job.gpu_model)
            })
            .map(|o| o.id))
    }

    /// New decision for the job, or `None` when nothing has capacity.
    fn reschedule(
        &self,
        job: &HPCJob,
        exclude: BTreeSet<ClusterId>,
        origin: DecisionOrigin,
        ctx: &BlockContext,
    ) -> RoutingResult<Option<SchedulingDecision>> {
        let candidates = load_candidates(self.store)?;
        let sequence = self.store.count_decisions(&job.id)? + 1;
        let meta = DecisionMeta {
            id: sequence_key(&job.id, sequence),
            origin,
            supersedes: job.active_decision_id.clone(),
        };
        let scheduler = Scheduler::new(&self.params.scheduling, &self.params.billing);
        match scheduler.schedule(&job_to_request(job), &candidates, &exclude, ctx, meta) {
            Ok(decision) => Ok(Some(decision)),
            Err(PlacementError::NoCapacityAvailable { .. }) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn count_violation(
        &self,
        provider: &str,
        ctx: &BlockContext,
    ) -> RoutingResult<(ProviderViolations, bool)> {
        let mut counter = self
            .store
            .get_violations(provider)?
            .unwrap_or_else(|| ProviderViolations {
                provider: provider.to_string(),
                count: 0,
                alerted: false,
                last_height: ctx.height,
            });
        counter.count += 1;
        counter.last_height = ctx.height;
        let crossed = !counter.alerted && counter.count > self.params.routing.violation_alert_threshold;
        if crossed {
            counter.alerted = true;
            warn!(
                provider,
                count = counter.count,
                threshold = self.params.routing.violation_alert_threshold,
                "provider violation threshold exceeded"
            );
        }
        Ok((counter, crossed))
    }
}
