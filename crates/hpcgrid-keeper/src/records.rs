//! Periodic accounting, usage snapshots and the dispute workflow.

use tracing::{info, warn};

use hpc_core::{Amount, BlockContext, EngineParams};
use hpcgrid_accounting::{
    PeriodRecord, begin_review, build_record, check_period_order, observed_for_period,
    open_automatic_dispute, open_dispute, reconcile, resolve_dispute,
};
use hpcgrid_billing::compute_charge_with;
use hpcgrid_settlement::{Escrow, compensation_entry, execute_compensation};
use hpcgrid_state::{DisputeOutcome, EntryStatus, SettlementEntryKind, UsageSnapshot, sequence_key};

use crate::error::{KeeperError, KeeperResult};
use crate::events::EngineEvent;
use crate::finalize::{accounting_log, dispute_id, settlement_log};
use crate::keeper::{DISPUTE_SEQUENCE, Keeper, Tx};
use crate::msg::{RecordUsageSnapshot, SubmitAccounting};

impl<E: Escrow> Keeper<E> {
    /// A provider's usage for one billing period of a running job.
    pub(crate) fn submit_accounting(
        &mut self,
        params: &EngineParams,
        ctx: &BlockContext,
        m: SubmitAccounting,
    ) -> KeeperResult<Vec<EngineEvent>> {
        let job = self.load_job(&m.job_id)?;
        if job.provider.as_deref() != Some(m.provider.as_str()) {
            return Err(KeeperError::Unauthorized {
                sender: m.provider,
                action: "submit accounting for this job",
            });
        }
        let Some(started) = job.started_time else {
            return Err(KeeperError::Invalid(format!("job {} has not started", job.id)));
        };
        if m.period_start < started {
            return Err(KeeperError::Invalid(format!(
                "period starts at {} before the job started at {started}",
                m.period_start
            )));
        }
        if m.period_end > ctx.time {
            return Err(KeeperError::Invalid(format!(
                "period ends at {} in the future (now {})",
                m.period_end, ctx.time
            )));
        }

        let existing = self.store.list_accounting(&job.id)?;
        let period = PeriodRecord {
            period_start: m.period_start,
            period_end: m.period_end,
            usage: m.usage,
            is_final: false,
        };
        check_period_order(&job.id, &existing, &period)?;

        let charge_ctx = self.charge_context(params, &job, ctx)?;
        let breakdown = compute_charge_with(&period.usage, &params.billing, &charge_ctx)?;

        let mut tx = Tx::new();
        let sequence = tx.next_local(accounting_log(&job.id), existing.len() as u64);
        let record = build_record(&job, sequence, period, &breakdown, ctx)?;
        tx.batch.put_accounting(&record)?;
        tx.emit(EngineEvent::AccountingRecordCreated {
            record_id: record.id.clone(),
            job_id: job.id.clone(),
            charge: record.charge,
            is_final: false,
        });
        info!(
            job = %job.id,
            record = %record.id,
            start = record.period_start,
            end = record.period_end,
            charge = record.charge,
            "periodic accounting record"
        );
        self.reconcile_record(params, &mut tx, &record, ctx)?;
        tx.commit(&self.store)
    }

    /// Observed usage from the node-agent feed.
    ///
    /// Existing records whose period contains the snapshot are reconciled
    /// again once their period is fully observed; later records are
    /// reconciled when they are created.
    pub(crate) fn record_usage_snapshot(
        &mut self,
        params: &EngineParams,
        ctx: &BlockContext,
        m: RecordUsageSnapshot,
    ) -> KeeperResult<Vec<EngineEvent>> {
        let job = self.load_job(&m.job_id)?;
        if m.period_end <= m.period_start {
            return Err(KeeperError::Invalid(format!(
                "snapshot period {}..{} is empty",
                m.period_start, m.period_end
            )));
        }
        let snapshot = UsageSnapshot {
            job_id: job.id.clone(),
            period_start: m.period_start,
            period_end: m.period_end,
            usage: m.usage,
            source: m.source,
            recorded_height: ctx.height,
        };
        let mut snapshots = self.store.list_snapshots(&job.id)?;
        if snapshots.iter().any(|s| s.period_end == snapshot.period_end) {
            return Err(KeeperError::AlreadyExists {
                kind: "usage snapshot",
                id: snapshot.table_key(),
            });
        }

        let mut tx = Tx::new();
        tx.batch.put_snapshot(&snapshot)?;
        snapshots.push(snapshot.clone());

        let records = self.store.list_accounting(&job.id)?;
        let disputes = self.store.list_disputes_for_job(&job.id)?;
        for record in records.iter().filter(|r| {
            r.period_start <= snapshot.period_start && snapshot.period_end <= r.period_end
        }) {
            let blocked = disputes
                .iter()
                .any(|d| d.record_id == record.id && (d.automatic || d.status.is_open()));
            if blocked {
                continue;
            }
            let Some(observed) = observed_for_period(
                &snapshots,
                record.period_start,
                record.period_end,
            ) else {
                continue;
            };
            let report = reconcile(
                &record.usage,
                &observed,
                params.reconciliation.tolerance_bps,
            );
            if report.within_tolerance() {
                continue;
            }
            let id = dispute_id(tx.next_global(&self.store, DISPUTE_SEQUENCE)?);
            if let Some(dispute) = open_automatic_dispute(
                id, record, &disputes, &report, observed, params, ctx,
            ) {
                warn!(record = %record.id, dispute = %dispute.id, "snapshot disagrees with record");
                tx.batch.put_dispute(&dispute)?;
                tx.emit(EngineEvent::DisputeOpened {
                    dispute_id: dispute.id,
                    record_id: record.id.clone(),
                    automatic: true,
                });
            }
        }
        tx.commit(&self.store)
    }

    pub(crate) fn flag_dispute(
        &mut self,
        params: &EngineParams,
        ctx: &BlockContext,
        sender: &str,
        record_id: &str,
        reason: &str,
    ) -> KeeperResult<Vec<EngineEvent>> {
        if reason.trim().is_empty() {
            return Err(KeeperError::Invalid("dispute reason is required".to_string()));
        }
        let record = self
            .store
            .get_accounting(record_id)?
            .ok_or_else(|| KeeperError::not_found("accounting record", record_id))?;
        let job = self.load_job(&record.job_id)?;
        let existing = self.store.list_disputes_for_job(&job.id)?;

        let mut tx = Tx::new();
        let id = dispute_id(tx.next_global(&self.store, DISPUTE_SEQUENCE)?);
        let dispute = open_dispute(id, &record, &job, &existing, sender, reason, params, ctx)?;
        tx.batch.put_dispute(&dispute)?;
        tx.emit(EngineEvent::DisputeOpened {
            dispute_id: dispute.id.clone(),
            record_id: record.id.clone(),
            automatic: false,
        });
        tx.commit(&self.store)
    }

    pub(crate) fn begin_review(
        &mut self,
        params: &EngineParams,
        ctx: &BlockContext,
        moderator: &str,
        dispute_id: &str,
    ) -> KeeperResult<Vec<EngineEvent>> {
        let mut dispute = self
            .store
            .get_dispute(dispute_id)?
            .ok_or_else(|| KeeperError::not_found("dispute", dispute_id))?;
        begin_review(&mut dispute, moderator, params, ctx)?;

        let mut tx = Tx::new();
        tx.batch.put_dispute(&dispute)?;
        tx.emit(EngineEvent::DisputeReviewStarted {
            dispute_id: dispute.id.clone(),
            reviewer: moderator.to_string(),
        });
        tx.commit(&self.store)
    }

    /// Resolve a dispute and record what it owes the customer.
    ///
    /// Any reduction becomes a compensating entry, whether the record is
    /// periodic or final: paid out now if the job has settled, otherwise
    /// deferred and netted out of the final charge at settlement.
    pub(crate) fn resolve_dispute(
        &mut self,
        params: &EngineParams,
        ctx: &BlockContext,
        moderator: &str,
        dispute_id: &str,
        outcome: DisputeOutcome,
    ) -> KeeperResult<Vec<EngineEvent>> {
        let mut dispute = self
            .store
            .get_dispute(dispute_id)?
            .ok_or_else(|| KeeperError::not_found("dispute", dispute_id))?;
        let record = self
            .store
            .get_accounting(&dispute.record_id)?
            .ok_or_else(|| KeeperError::not_found("accounting record", &dispute.record_id))?;
        let job = self.load_job(&record.job_id)?;

        let adjustment_id = sequence_key(&job.id, self.store.count_adjustments(&job.id)? + 1);
        let adjustment = resolve_dispute(
            &mut dispute,
            &record,
            outcome,
            moderator,
            adjustment_id,
            params,
            ctx,
        )?;

        let mut tx = Tx::new();
        tx.batch.put_adjustment(&adjustment)?;
        tx.batch.put_dispute(&dispute)?;
        tx.emit(EngineEvent::DisputeResolved {
            dispute_id: dispute.id.clone(),
            status: dispute.status,
            revised_charge: adjustment.revised_charge,
        });

        let entries = self.store.list_settlement_entries(&job.id)?;
        let already_returned: Amount = entries
            .iter()
            .filter(|e| {
                e.kind == SettlementEntryKind::Compensation && e.status == EntryStatus::Executed
            })
            .map(|e| e.amount)
            .sum();
        let settled = match self.store.get_finalized(&job.id)? {
            Some(marker) => self.store.get_reward(&marker.reward_id)?,
            None => None,
        };
        let sequence = tx.next_local(settlement_log(&job.id), entries.len() as u64);
        let entry = compensation_entry(
            sequence_key(&job.id, sequence),
            &adjustment,
            &job.customer,
            &params.settlement.treasury_address,
            settled.as_ref(),
            already_returned,
            ctx,
        );
        if let Some(mut entry) = entry {
            if settled.is_some() {
                execute_compensation(&mut self.escrow, &mut entry)?;
            }
            tx.batch.put_settlement_entry(&entry)?;
            tx.emit(EngineEvent::CompensationRecorded {
                entry_id: entry.id.clone(),
                job_id: job.id.clone(),
                amount: entry.amount,
                status: entry.status,
            });
            info!(
                job = %job.id,
                entry = %entry.id,
                amount = entry.amount,
                status = ?entry.status,
                "compensation recorded"
            );
        }
        tx.commit(&self.store)
    }
}
