//! Job submission, placement, status reports and cancellation.

use std::collections::BTreeSet;

use tracing::{debug, info, warn};

use hpc_core::{BlockContext, Coin, EngineParams, UsageMetrics};
use hpcgrid_lifecycle::{LifecycleError, TransitionOutcome, forward_path, transition};
use hpcgrid_placement::{DecisionMeta, Scheduler, job_to_request, load_candidates};
use hpcgrid_routing::RoutingEnforcer;
use hpcgrid_settlement::Escrow;
use hpcgrid_state::{
    CustomerStats, DecisionOrigin, HPCJob, JobState, SchedulingDecision, SettlementStatus,
    TemplateStatus, sequence_key,
};

use crate::error::{KeeperError, KeeperResult};
use crate::events::EngineEvent;
use crate::keeper::{JOB_SEQUENCE, Keeper, Tx};
use crate::msg::{ReportStatus, SubmitJob};

pub(crate) fn job_id(sequence: u64) -> String {
    format!("job-{sequence:06}")
}

fn escrow_id(job_id: &str) -> String {
    format!("escrow/{job_id}")
}

/// Cumulative usage never goes backwards.
fn check_usage_monotonic(job: &HPCJob, next: &UsageMetrics) -> KeeperResult<()> {
    if !job.usage_reported {
        return Ok(());
    }
    let before = job.usage.metric_values();
    for (metric, value) in next.metric_values() {
        let prev = before.get(metric).copied().unwrap_or(0);
        if value < prev {
            return Err(KeeperError::Invalid(format!(
                "job {}: cumulative {metric} went from {prev} to {value}",
                job.id
            )));
        }
    }
    for (model, prev) in &job.usage.gpu_secs {
        if next.gpu_secs.get(model).copied().unwrap_or(0) < *prev {
            return Err(KeeperError::Invalid(format!(
                "job {}: cumulative gpu_secs for {model:?} went backwards",
                job.id
            )));
        }
    }
    Ok(())
}

fn decision_created(decision: &SchedulingDecision) -> EngineEvent {
    EngineEvent::DecisionCreated {
        job_id: decision.job_id.clone(),
        decision_id: decision.id.clone(),
        cluster_id: decision.cluster_id.clone(),
        origin: decision.origin,
        supersedes: decision.supersedes.clone(),
    }
}

/// The error a job in `from` gives for a move to `to`.
fn lifecycle_error(job: &HPCJob, to: JobState) -> LifecycleError {
    if job.state.is_terminal() {
        LifecycleError::AlreadyTerminal {
            job_id: job.id.clone(),
            state: job.state,
        }
    } else {
        LifecycleError::IllegalTransition {
            job_id: job.id.clone(),
            from: job.state,
            to,
        }
    }
}

impl<E: Escrow> Keeper<E> {
    pub(crate) fn load_job(&self, job_id: &str) -> KeeperResult<HPCJob> {
        self.store
            .get_job(job_id)?
            .ok_or_else(|| KeeperError::not_found("job", job_id))
    }

    pub(crate) fn submit_job(
        &mut self,
        params: &EngineParams,
        ctx: &BlockContext,
        m: SubmitJob,
    ) -> KeeperResult<Vec<EngineEvent>> {
        if m.customer.trim().is_empty() {
            return Err(KeeperError::Invalid("customer is required".to_string()));
        }
        if !m.resource_type.is_schedulable() {
            return Err(KeeperError::Invalid(format!(
                "jobs request nodes or gpus, not {}",
                m.resource_type.label()
            )));
        }
        if m.nodes == 0 {
            return Err(KeeperError::Invalid("at least one node is required".to_string()));
        }
        if m.max_duration_secs == 0 {
            return Err(KeeperError::Invalid("max duration must be positive".to_string()));
        }
        let budget = Coin::parse(&m.budget)?;
        if budget.denom != params.denom {
            return Err(KeeperError::Invalid(format!(
                "budget denom {} is not {}",
                budget.denom, params.denom
            )));
        }
        if budget.amount == 0 || budget.amount < params.billing.minimum_charge {
            return Err(KeeperError::Invalid(format!(
                "budget {} is below the minimum charge {}",
                budget.amount, params.billing.minimum_charge
            )));
        }
        if let Some(template_id) = &m.template_id {
            let approved = self
                .store
                .get_template(template_id)?
                .is_some_and(|t| t.status == TemplateStatus::Approved);
            if !approved {
                return Err(KeeperError::TemplateNotApproved {
                    template_id: template_id.clone(),
                });
            }
        }

        let mut tx = Tx::new();
        let id = job_id(tx.next_global(&self.store, JOB_SEQUENCE)?);
        let mut job = HPCJob {
            escrow_id: escrow_id(&id),
            id,
            customer: m.customer,
            template_id: m.template_id,
            resource_type: m.resource_type,
            nodes: m.nodes,
            gpus: m.gpus,
            gpu_model: m.gpu_model,
            max_duration_secs: m.max_duration_secs,
            budget,
            region: m.region,
            promo_code: m.promo_code,
            state: JobState::Pending,
            active_decision_id: None,
            cluster_id: None,
            offering_id: None,
            provider: None,
            usage: UsageMetrics::default(),
            usage_reported: false,
            created_height: ctx.height,
            created_time: ctx.time,
            queued_time: None,
            started_time: None,
            finished_time: None,
            updated_height: ctx.height,
            history: Vec::new(),
            settlement: SettlementStatus::Unsettled,
        };

        let candidates = load_candidates(&self.store)?;
        let decision = Scheduler::new(&params.scheduling, &params.billing).schedule(
            &job_to_request(&job),
            &candidates,
            &BTreeSet::new(),
            ctx,
            DecisionMeta {
                id: sequence_key(&job.id, 1),
                origin: DecisionOrigin::Submission,
                supersedes: None,
            },
        )?;
        job.active_decision_id = Some(decision.id.clone());

        let mut customer = self.store.get_customer(&job.customer)?.unwrap_or(CustomerStats {
            address: job.customer.clone(),
            first_seen_time: ctx.time,
            cumulative_spend: 0,
            jobs_submitted: 0,
        });
        customer.jobs_submitted += 1;

        tx.batch.put_job(&job)?;
        tx.batch.put_decision(&decision)?;
        tx.batch.put_customer(&customer)?;
        tx.emit(EngineEvent::JobSubmitted {
            job_id: job.id.clone(),
            customer: job.customer.clone(),
            budget: job.budget.amount,
        });
        tx.emit(decision_created(&decision));

        self.escrow
            .lock(&job.escrow_id, &job.customer, job.budget.amount)?;
        info!(
            job = %job.id,
            customer = %job.customer,
            budget = job.budget.amount,
            cluster = %decision.cluster_id,
            "job submitted"
        );
        match tx.commit(&self.store) {
            Ok(events) => Ok(events),
            Err(e) => {
                // Undo the lock so escrow matches the store.
                if let Err(release) = self.escrow.release(&job.escrow_id) {
                    warn!(job = %job.id, error = %release, "escrow release after failed commit");
                }
                Err(e)
            }
        }
    }

    /// Replace a pending job's decision with a fresh one.
    pub(crate) fn schedule_job(
        &mut self,
        params: &EngineParams,
        ctx: &BlockContext,
        sender: &str,
        job_id: &str,
    ) -> KeeperResult<Vec<EngineEvent>> {
        let mut job = self.load_job(job_id)?;
        if sender != job.customer && !params.is_moderator(sender) {
            return Err(KeeperError::Unauthorized {
                sender: sender.to_string(),
                action: "schedule job",
            });
        }
        if job.state != JobState::Pending {
            return Err(lifecycle_error(&job, JobState::Queued).into());
        }

        let sequence = self.store.count_decisions(&job.id)? + 1;
        let candidates = load_candidates(&self.store)?;
        let decision = Scheduler::new(&params.scheduling, &params.billing).schedule(
            &job_to_request(&job),
            &candidates,
            &BTreeSet::new(),
            ctx,
            DecisionMeta {
                id: sequence_key(&job.id, sequence),
                origin: DecisionOrigin::Reschedule,
                supersedes: job.active_decision_id.clone(),
            },
        )?;
        job.active_decision_id = Some(decision.id.clone());
        job.updated_height = ctx.height;

        let mut tx = Tx::new();
        tx.batch.put_decision(&decision)?;
        tx.batch.put_job(&job)?;
        tx.emit(decision_created(&decision));
        tx.emit(EngineEvent::JobRescheduled {
            job_id: job.id.clone(),
            decision_id: decision.id.clone(),
            cluster_id: decision.cluster_id.clone(),
            fallback: false,
        });
        tx.commit(&self.store)
    }

    /// A provider proposes to run a pending job on one of its clusters.
    ///
    /// Every call leaves one routing audit record, approved or not.
    pub(crate) fn place_job(
        &mut self,
        params: &EngineParams,
        ctx: &BlockContext,
        provider: &str,
        job_id: &str,
        cluster_id: &str,
    ) -> KeeperResult<Vec<EngineEvent>> {
        let mut job = self.load_job(job_id)?;
        let proposed = self
            .store
            .get_cluster(cluster_id)?
            .ok_or_else(|| KeeperError::not_found("cluster", cluster_id))?;
        if proposed.provider != provider {
            return Err(KeeperError::Unauthorized {
                sender: provider.to_string(),
                action: "place jobs on another provider's cluster",
            });
        }
        if job.state != JobState::Pending {
            return Err(lifecycle_error(&job, JobState::Queued).into());
        }

        let outcome = RoutingEnforcer::new(&self.store, params).enforce(&job, &proposed, ctx)?;

        let mut tx = Tx::new();
        outcome.stage(&mut tx.batch)?;
        if let Some(kind) = outcome.audit.violation {
            tx.emit(EngineEvent::RoutingViolation {
                job_id: job.id.clone(),
                provider: outcome.audit.provider.clone(),
                kind,
                status: outcome.audit.status,
            });
        }
        if outcome.threshold_crossed {
            if let Some(counter) = &outcome.violations {
                tx.emit(EngineEvent::ViolationThresholdExceeded {
                    provider: counter.provider.clone(),
                    count: counter.count,
                });
            }
        }
        if let Some(decision) = &outcome.new_decision {
            job.active_decision_id = Some(decision.id.clone());
            tx.emit(decision_created(decision));
            tx.emit(EngineEvent::JobRescheduled {
                job_id: job.id.clone(),
                decision_id: decision.id.clone(),
                cluster_id: decision.cluster_id.clone(),
                fallback: outcome.audit.is_fallback,
            });
        }

        let approval = match outcome.result {
            Ok(approval) => approval,
            Err(source) => {
                job.updated_height = ctx.height;
                tx.batch.put_job(&job)?;
                let events = tx.commit(&self.store)?;
                return Err(KeeperError::RoutingRejected { source, events });
            }
        };

        let mut target = if approval.cluster_id == proposed.id {
            proposed
        } else {
            self.store
                .get_cluster(&approval.cluster_id)?
                .ok_or_else(|| KeeperError::not_found("cluster", &approval.cluster_id))?
        };
        target.allocate(job.nodes, job.gpus)?;
        target.updated_height = ctx.height;

        job.cluster_id = Some(target.id.clone());
        job.offering_id = Some(approval.offering_id.clone());
        job.provider = Some(target.provider.clone());
        transition(&mut job, JobState::Queued, ctx, &outcome.audit.reason)?;

        tx.batch.put_cluster(&target)?;
        tx.batch.put_job(&job)?;
        tx.emit(EngineEvent::JobRouted {
            job_id: job.id.clone(),
            cluster_id: target.id.clone(),
            status: approval.status,
            audit_record_id: outcome.audit.id.clone(),
        });
        if outcome.violation_resolved {
            tx.emit(EngineEvent::RoutingViolationResolved {
                job_id: job.id.clone(),
            });
        }
        tx.emit(EngineEvent::JobStateChanged {
            job_id: job.id.clone(),
            from: JobState::Pending,
            to: JobState::Queued,
        });
        debug!(
            job = %job.id,
            cluster = %target.id,
            available_nodes = target.available_nodes,
            "capacity allocated"
        );
        tx.commit(&self.store)
    }

    /// A provider's status report, normalized at the boundary.
    pub(crate) fn report_status(
        &mut self,
        params: &EngineParams,
        ctx: &BlockContext,
        m: ReportStatus,
    ) -> KeeperResult<Vec<EngineEvent>> {
        let mut job = self.load_job(&m.job_id)?;
        if job.provider.as_deref() != Some(m.provider.as_str()) {
            return Err(KeeperError::Unauthorized {
                sender: m.provider,
                action: "report status for this job",
            });
        }
        let target = match (m.state, m.scheduler, m.raw_status.as_deref()) {
            (Some(state), _, _) => state,
            (None, Some(scheduler), Some(raw)) => scheduler.normalize(raw)?,
            _ => {
                return Err(KeeperError::Invalid(
                    "status report needs a state or a scheduler status".to_string(),
                ));
            }
        };

        if job.state.is_terminal() {
            if job.state == target {
                debug!(job = %job.id, state = target.label(), "terminal report replayed");
                return Ok(Vec::new());
            }
            return Err(lifecycle_error(&job, target).into());
        }

        let path = if job.state == target {
            Vec::new()
        } else {
            forward_path(job.state, target).ok_or_else(|| lifecycle_error(&job, target))?
        };
        if let Some(usage) = m.usage {
            check_usage_monotonic(&job, &usage)?;
            job.usage = usage;
            job.usage_reported = true;
        }

        let mut tx = Tx::new();
        let reason = m.reason.unwrap_or_else(|| "provider report".to_string());
        let prior = job.state;
        for step in path {
            if let TransitionOutcome::Applied { from, to } = transition(&mut job, step, ctx, &reason)? {
                tx.emit(EngineEvent::JobStateChanged {
                    job_id: job.id.clone(),
                    from,
                    to,
                });
            }
        }
        job.updated_height = ctx.height;
        if job.state.is_terminal() {
            self.on_terminal(params, &mut tx, &mut job, prior, ctx)?;
        }
        tx.batch.put_job(&job)?;
        tx.commit(&self.store)
    }

    pub(crate) fn cancel_job(
        &mut self,
        params: &EngineParams,
        ctx: &BlockContext,
        sender: &str,
        job_id: &str,
        reason: Option<&str>,
    ) -> KeeperResult<Vec<EngineEvent>> {
        let mut job = self.load_job(job_id)?;
        if sender != job.customer && !params.is_moderator(sender) {
            return Err(KeeperError::Unauthorized {
                sender: sender.to_string(),
                action: "cancel job",
            });
        }

        let prior = job.state;
        let reason = reason.unwrap_or("cancelled");
        let mut tx = Tx::new();
        match transition(&mut job, JobState::Cancelled, ctx, reason)? {
            TransitionOutcome::Unchanged => return Ok(Vec::new()),
            TransitionOutcome::Applied { from, to } => tx.emit(EngineEvent::JobStateChanged {
                job_id: job.id.clone(),
                from,
                to,
            }),
        }
        self.on_terminal(params, &mut tx, &mut job, prior, ctx)?;
        tx.batch.put_job(&job)?;
        tx.commit(&self.store)
    }
}
