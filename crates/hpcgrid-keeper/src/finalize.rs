//! Terminal-state handling: capacity release, final accounting, settlement.
//!
//! ```text
//! terminal transition ─→ release capacity (once)
//!                     └→ final accounting record ─→ reconcile ─→ settle
//!                                                              │
//!                     pending retry ←── escrow refused ────────┘
//! ```
//!
//! Settlement is guarded by the job's finalization marker: once it is
//! written, every later attempt is a no-op.

use rust_decimal::Decimal;
use tracing::{debug, error, info, warn};

use hpc_core::{Amount, BlockContext, EngineParams, UsageMetrics};
use hpcgrid_accounting::{
    PeriodRecord, build_record, check_period_order, observed_for_period, open_automatic_dispute,
    reconcile,
};
use hpcgrid_billing::{ChargeBreakdown, ChargeContext, DiscountContext, compute_charge_with, offering_rates};
use hpcgrid_lifecycle::effective_usage;
use hpcgrid_settlement::{Escrow, SettlementInput, settle_job};
use hpcgrid_state::{
    EntryStatus, FinalizationMarker, HPCAccountingRecord, HPCJob, JobState, SettlementStatus,
    sequence_key,
};

use crate::error::KeeperResult;
use crate::events::EngineEvent;
use crate::keeper::{DISPUTE_SEQUENCE, Keeper, Tx};

pub(crate) fn dispute_id(sequence: u64) -> String {
    format!("dispute-{sequence:06}")
}

pub(crate) fn accounting_log(job_id: &str) -> String {
    format!("{job_id}:accounting")
}

pub(crate) fn settlement_log(job_id: &str) -> String {
    format!("{job_id}:settlement")
}

/// Charge for a job that never started and never reported usage.
fn zero_charge() -> ChargeBreakdown {
    ChargeBreakdown {
        lines: Vec::new(),
        subtotal: Decimal::ZERO,
        discounts: Vec::new(),
        discounted: Decimal::ZERO,
        gross: 0,
        capped: false,
        minimum_applied: false,
        total: 0,
    }
}

fn attempts_so_far(status: &SettlementStatus) -> u32 {
    match status {
        SettlementStatus::PendingRetry { attempts, .. } | SettlementStatus::Abandoned { attempts, .. } => {
            *attempts
        }
        _ => 0,
    }
}

impl<E: Escrow> Keeper<E> {
    /// Everything that follows a job's entry into a terminal state.
    ///
    /// `prior` is the state the job left; capacity is returned only if
    /// that state held it.
    pub(crate) fn on_terminal(
        &mut self,
        params: &EngineParams,
        tx: &mut Tx,
        job: &mut HPCJob,
        prior: JobState,
        ctx: &BlockContext,
    ) -> KeeperResult<()> {
        if prior.holds_capacity() {
            if let Some(cluster_id) = &job.cluster_id {
                if let Some(mut cluster) = self.store.get_cluster(cluster_id)? {
                    cluster.release(job.nodes, job.gpus)?;
                    cluster.updated_height = ctx.height;
                    tx.batch.put_cluster(&cluster)?;
                    debug!(
                        job = %job.id,
                        cluster = %cluster.id,
                        available_nodes = cluster.available_nodes,
                        "capacity released"
                    );
                }
            }
        }
        self.finalize_job(params, tx, job, ctx)
    }

    /// Write the final accounting record (if missing) and try to settle.
    ///
    /// Settlement failure does not fail the message: the job keeps its
    /// terminal state and is marked for retry.
    pub(crate) fn finalize_job(
        &mut self,
        params: &EngineParams,
        tx: &mut Tx,
        job: &mut HPCJob,
        ctx: &BlockContext,
    ) -> KeeperResult<()> {
        if self.store.get_finalized(&job.id)?.is_some() {
            debug!(job = %job.id, "already finalized");
            return Ok(());
        }

        let existing = self.store.list_accounting(&job.id)?;
        let record = match existing.iter().find(|r| r.is_final) {
            Some(record) => record.clone(),
            None => self.final_record(params, tx, job, &existing, ctx)?,
        };
        self.settle(params, tx, job, &record, ctx)
    }

    fn final_record(
        &mut self,
        params: &EngineParams,
        tx: &mut Tx,
        job: &HPCJob,
        existing: &[HPCAccountingRecord],
        ctx: &BlockContext,
    ) -> KeeperResult<HPCAccountingRecord> {
        let end = job.finished_time.unwrap_or(ctx.time);
        let never_ran = job.started_time.is_none() && !job.usage_reported;
        let usage = if never_ran {
            UsageMetrics::default()
        } else {
            effective_usage(job, end)
        };
        let period = PeriodRecord {
            period_start: job.started_time.unwrap_or(end).min(end),
            period_end: end,
            usage,
            is_final: true,
        };
        check_period_order(&job.id, existing, &period)?;

        let breakdown = if never_ran {
            zero_charge()
        } else {
            compute_charge_with(&period.usage, &params.billing, &self.charge_context(params, job, ctx)?)?
        };

        let sequence = tx.next_local(accounting_log(&job.id), existing.len() as u64);
        let record = build_record(job, sequence, period, &breakdown, ctx)?;
        tx.batch.put_accounting(&record)?;
        tx.emit(EngineEvent::AccountingRecordCreated {
            record_id: record.id.clone(),
            job_id: job.id.clone(),
            charge: record.charge,
            is_final: true,
        });
        info!(
            job = %job.id,
            record = %record.id,
            charge = record.charge,
            gross = record.gross_charge,
            minimum_applied = breakdown.minimum_applied,
            capped = breakdown.capped,
            "final accounting record"
        );

        self.reconcile_record(params, tx, &record, ctx)?;
        Ok(record)
    }

    /// Rates, discount facts and the budget cap for a job's charge.
    pub(crate) fn charge_context(
        &self,
        params: &EngineParams,
        job: &HPCJob,
        ctx: &BlockContext,
    ) -> KeeperResult<ChargeContext> {
        let rates = match &job.offering_id {
            Some(id) => self.store.get_offering(id)?.map(|o| {
                offering_rates(&params.billing.rates, o.resource_type, o.price_per_hour.amount)
            }),
            None => None,
        };
        let customer = self.store.get_customer(&job.customer)?;
        let discounts = DiscountContext {
            cumulative_spend: customer.as_ref().map(|c| c.cumulative_spend).unwrap_or(0),
            account_age_secs: customer
                .as_ref()
                .map(|c| ctx.secs_since(c.first_seen_time))
                .unwrap_or(0),
            promo_code: job.promo_code.clone(),
            provider: job.provider.clone(),
        };
        Ok(ChargeContext {
            rates,
            discounts,
            cap: Some(job.budget.amount),
        })
    }

    /// Compare a record against node-agent snapshots for the same period
    /// and open an automatic dispute when they disagree.
    pub(crate) fn reconcile_record(
        &mut self,
        params: &EngineParams,
        tx: &mut Tx,
        record: &HPCAccountingRecord,
        ctx: &BlockContext,
    ) -> KeeperResult<()> {
        let snapshots = self.store.list_snapshots(&record.job_id)?;
        let Some(observed) = observed_for_period(&snapshots, record.period_start, record.period_end) else {
            return Ok(());
        };
        let report = reconcile(&record.usage, &observed, params.reconciliation.tolerance_bps);
        if report.within_tolerance() {
            debug!(record = %record.id, "usage reconciled");
            return Ok(());
        }

        let existing = self.store.list_disputes_for_job(&record.job_id)?;
        // One automatic dispute per record; an open manual one also blocks.
        if existing
            .iter()
            .any(|d| d.record_id == record.id && (d.automatic || d.status.is_open()))
        {
            return Ok(());
        }
        let id = dispute_id(tx.next_global(&self.store, DISPUTE_SEQUENCE)?);
        if let Some(dispute) =
            open_automatic_dispute(id, record, &existing, &report, observed, params, ctx)
        {
            warn!(
                record = %record.id,
                dispute = %dispute.id,
                mismatches = report.mismatches.len(),
                "usage outside tolerance, dispute opened"
            );
            tx.batch.put_dispute(&dispute)?;
            tx.emit(EngineEvent::DisputeOpened {
                dispute_id: dispute.id,
                record_id: record.id.clone(),
                automatic: true,
            });
        }
        Ok(())
    }

    fn settle(
        &mut self,
        params: &EngineParams,
        tx: &mut Tx,
        job: &mut HPCJob,
        record: &HPCAccountingRecord,
        ctx: &BlockContext,
    ) -> KeeperResult<()> {
        let entries = self.store.list_settlement_entries(&job.id)?;
        let deferred: Vec<_> = entries
            .iter()
            .filter(|e| e.status == EntryStatus::Deferred)
            .collect();
        let deferred_total: Amount = deferred.iter().map(|e| e.amount).sum();
        let operators = match &job.cluster_id {
            Some(id) => self
                .store
                .get_cluster(id)?
                .map(|c| c.node_operators)
                .unwrap_or_default(),
            None => Vec::new(),
        };
        let sequence = tx.next_local(settlement_log(&job.id), entries.len() as u64);

        let input = SettlementInput {
            job: &*job,
            record,
            operators: &operators,
            deferred_compensation: deferred_total,
            platform_fee_bps: params.billing.platform_fee_bps,
            node_operator_split_bps: params.settlement.node_operator_split_bps,
            treasury: &params.settlement.treasury_address,
            entry_id: sequence_key(&job.id, sequence),
        };

        match settle_job(&mut self.escrow, input, ctx) {
            Ok(receipt) => {
                let reward = receipt.reward;
                tx.batch.put_reward(&reward)?;
                tx.batch.put_settlement_entry(&receipt.entry)?;
                for entry in deferred {
                    let mut netted = entry.clone();
                    netted.status = EntryStatus::Netted;
                    tx.batch.update_settlement_entry(&netted)?;
                }
                tx.batch.put_finalized(&FinalizationMarker {
                    job_id: job.id.clone(),
                    reward_id: reward.id.clone(),
                    accounting_record_id: record.id.clone(),
                    finalized_height: ctx.height,
                })?;
                if let Some(mut customer) = self.store.get_customer(&job.customer)? {
                    customer.cumulative_spend = customer.cumulative_spend.saturating_add(reward.charge);
                    tx.batch.put_customer(&customer)?;
                }
                job.settlement = SettlementStatus::Settled {
                    reward_id: reward.id.clone(),
                };
                tx.emit(EngineEvent::RewardDistributed {
                    job_id: job.id.clone(),
                    reward_id: reward.id.clone(),
                    charge: reward.charge,
                    platform_fee: reward.platform_fee,
                    provider_reward: reward.provider_reward,
                });
            }
            Err(e) => {
                let attempts = attempts_so_far(&job.settlement) + 1;
                let abandoned = attempts >= params.settlement.max_settlement_retries;
                let last_error = e.to_string();
                error!(job = %job.id, attempts, abandoned, error = %last_error, "settlement failed");
                job.settlement = if abandoned {
                    SettlementStatus::Abandoned {
                        attempts,
                        last_error: last_error.clone(),
                    }
                } else {
                    SettlementStatus::PendingRetry {
                        attempts,
                        last_error: last_error.clone(),
                    }
                };
                tx.emit(EngineEvent::SettlementFailed {
                    job_id: job.id.clone(),
                    attempts,
                    error: last_error,
                    abandoned,
                });
            }
        }
        job.updated_height = ctx.height;
        Ok(())
    }

    /// End-of-cycle hook: force timeouts, then retry pending settlements.
    ///
    /// Each job commits on its own. A job whose step fails is logged and
    /// left as it was; the rest of the cycle still runs.
    pub fn process_cycle(&mut self, ctx: &BlockContext) -> KeeperResult<Vec<EngineEvent>> {
        let params = self.params()?;
        let mut events = Vec::new();
        // Jobs failing for the first time in this cycle wait for the next.
        let retries: Vec<_> = self
            .store
            .list_jobs()?
            .into_iter()
            .filter(|j| matches!(j.settlement, SettlementStatus::PendingRetry { .. }))
            .collect();

        for job_id in self.store.list_active_job_ids()? {
            match self.time_out_job(&params, &job_id, ctx) {
                Ok(produced) => events.extend(produced),
                Err(e) => error!(job = %job_id, error = %e, "timeout check failed"),
            }
        }

        for job in retries {
            let job_id = job.id.clone();
            match self.retry_settlement(&params, job, ctx) {
                Ok(produced) => events.extend(produced),
                Err(e) => error!(job = %job_id, error = %e, "settlement retry failed"),
            }
        }

        debug!(height = ctx.height, events = events.len(), "cycle processed");
        Ok(events)
    }

    fn time_out_job(
        &mut self,
        params: &EngineParams,
        job_id: &str,
        ctx: &BlockContext,
    ) -> KeeperResult<Vec<EngineEvent>> {
        let mut job = self.load_job(job_id)?;
        if !hpcgrid_lifecycle::is_timed_out(&job, ctx) {
            return Ok(Vec::new());
        }
        let prior = job.state;
        let mut tx = Tx::new();
        hpcgrid_lifecycle::transition(&mut job, JobState::Timeout, ctx, "duration ceiling exceeded")?;
        warn!(job = %job.id, max_duration = job.max_duration_secs, "job timed out");
        tx.emit(EngineEvent::JobStateChanged {
            job_id: job.id.clone(),
            from: prior,
            to: JobState::Timeout,
        });
        self.on_terminal(params, &mut tx, &mut job, prior, ctx)?;
        tx.batch.put_job(&job)?;
        tx.commit(&self.store)
    }

    fn retry_settlement(
        &mut self,
        params: &EngineParams,
        mut job: HPCJob,
        ctx: &BlockContext,
    ) -> KeeperResult<Vec<EngineEvent>> {
        info!(job = %job.id, attempts = attempts_so_far(&job.settlement), "retrying settlement");
        let mut tx = Tx::new();
        self.finalize_job(params, &mut tx, &mut job, ctx)?;
        tx.batch.put_job(&job)?;
        tx.commit(&self.store)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_helpers() {
        assert_eq!(dispute_id(3), "dispute-000003");
        assert_eq!(accounting_log("job-000001"), "job-000001:accounting");
        assert_eq!(settlement_log("job-000001"), "job-000001:settlement");
    }

    #[test]
    fn attempts_carry_over() {
        assert_eq!(attempts_so_far(&SettlementStatus::Unsettled), 0);
        assert_eq!(
            attempts_so_far(&SettlementStatus::PendingRetry {
                attempts: 3,
                last_error: "x".into()
            }),
            3
        );
    }

    #[test]
    fn zero_charge_is_empty() {
        let z = zero_charge();
        assert_eq!(z.total, 0);
        assert!(!z.minimum_applied);
    }
}
