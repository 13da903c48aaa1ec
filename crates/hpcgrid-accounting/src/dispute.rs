//! Dispute workflow.
//!
//! `flagged → under_review → {upheld | rejected | partial_adjustment}`.
//! Disputes never touch the accounting record they reference; resolution
//! produces an [`AccountingAdjustment`] carrying the revised charge.

use tracing::info;

use hpc_core::{Address, BlockContext, DisputeId, EngineParams, RecordId, UsageMetrics, apply_bps};
use hpcgrid_state::{
    AccountingAdjustment, Dispute, DisputeOutcome, DisputeStatus, HPCAccountingRecord, HPCJob,
};

use crate::error::{AccountingError, AccountingResult};
use crate::reconcile::ReconciliationReport;

fn require_moderator(params: &EngineParams, address: &str) -> AccountingResult<()> {
    if params.is_moderator(address) {
        Ok(())
    } else {
        Err(AccountingError::NotModerator {
            address: address.to_string(),
        })
    }
}

/// Flag `record` on behalf of a principal.
///
/// The job's customer, its provider, or any moderator may raise a
/// dispute. Only one dispute per record may be open at a time.
#[allow(clippy::too_many_arguments)]
pub fn open_dispute(
    id: DisputeId,
    record: &HPCAccountingRecord,
    job: &HPCJob,
    existing: &[Dispute],
    raised_by: &str,
    reason: &str,
    params: &EngineParams,
    ctx: &BlockContext,
) -> AccountingResult<Dispute> {
    let is_party = raised_by == job.customer
        || job.provider.as_deref() == Some(raised_by)
        || params.is_moderator(raised_by);
    if !is_party {
        return Err(AccountingError::NotParticipant {
            address: raised_by.to_string(),
            job_id: job.id.clone(),
        });
    }
    ensure_none_open(&record.id, existing)?;

    info!(dispute = %id, record = %record.id, raised_by, "dispute flagged");
    Ok(new_dispute(id, record, raised_by.to_string(), reason.to_string(), false, None, ctx))
}

/// Flag `record` after reconciliation found usage outside tolerance.
///
/// Returns `None` when the record already has an open dispute.
pub fn open_automatic_dispute(
    id: DisputeId,
    record: &HPCAccountingRecord,
    existing: &[Dispute],
    report: &ReconciliationReport,
    observed: UsageMetrics,
    params: &EngineParams,
    ctx: &BlockContext,
) -> Option<Dispute> {
    if ensure_none_open(&record.id, existing).is_err() {
        return None;
    }
    info!(
        dispute = %id,
        record = %record.id,
        mismatched = report.mismatches.len(),
        "dispute flagged by reconciliation"
    );
    Some(new_dispute(
        id,
        record,
        params.reconciliation.system_address.clone(),
        report.summary(),
        true,
        Some(observed),
        ctx,
    ))
}

fn ensure_none_open(record_id: &RecordId, existing: &[Dispute]) -> AccountingResult<()> {
    if existing
        .iter()
        .any(|d| &d.record_id == record_id && d.status.is_open())
    {
        return Err(AccountingError::DisputeOpen {
            record_id: record_id.clone(),
        });
    }
    Ok(())
}

fn new_dispute(
    id: DisputeId,
    record: &HPCAccountingRecord,
    raised_by: Address,
    reason: String,
    automatic: bool,
    observed_usage: Option<UsageMetrics>,
    ctx: &BlockContext,
) -> Dispute {
    Dispute {
        id,
        record_id: record.id.clone(),
        job_id: record.job_id.clone(),
        raised_by,
        reason,
        status: DisputeStatus::Flagged,
        automatic,
        observed_usage,
        reviewer: None,
        outcome: None,
        created_height: ctx.height,
        reviewed_height: None,
        resolved_height: None,
    }
}

/// Move a flagged dispute under review.
pub fn begin_review(
    dispute: &mut Dispute,
    reviewer: &str,
    params: &EngineParams,
    ctx: &BlockContext,
) -> AccountingResult<()> {
    require_moderator(params, reviewer)?;
    if dispute.status != DisputeStatus::Flagged {
        return Err(AccountingError::InvalidDisputeTransition {
            dispute_id: dispute.id.clone(),
            status: dispute.status,
            action: "begin review",
        });
    }
    dispute.status = DisputeStatus::UnderReview;
    dispute.reviewer = Some(reviewer.to_string());
    dispute.reviewed_height = Some(ctx.height);
    info!(dispute = %dispute.id, reviewer, "dispute under review");
    Ok(())
}

/// Resolve a dispute under review. Happens exactly once.
///
/// Returns the adjustment record; its `refund()` is what a compensating
/// settlement entry should pay back to the customer.
pub fn resolve_dispute(
    dispute: &mut Dispute,
    record: &HPCAccountingRecord,
    outcome: DisputeOutcome,
    resolver: &str,
    adjustment_id: RecordId,
    params: &EngineParams,
    ctx: &BlockContext,
) -> AccountingResult<AccountingAdjustment> {
    require_moderator(params, resolver)?;
    if dispute.status != DisputeStatus::UnderReview {
        return Err(AccountingError::InvalidDisputeTransition {
            dispute_id: dispute.id.clone(),
            status: dispute.status,
            action: "resolve",
        });
    }

    let original = record.charge;
    let (status, revised) = match &outcome {
        DisputeOutcome::Upheld { revised_charge } => {
            if *revised_charge > original {
                return Err(AccountingError::RevisedChargeTooHigh {
                    revised: *revised_charge,
                    original,
                });
            }
            (DisputeStatus::Upheld, *revised_charge)
        }
        DisputeOutcome::Rejected => (DisputeStatus::Rejected, original),
        DisputeOutcome::PartialAdjustment { correction_bps } => {
            let max = params.reconciliation.max_correction_bps;
            if *correction_bps > max {
                return Err(AccountingError::CorrectionTooLarge {
                    bps: *correction_bps,
                    max,
                });
            }
            let correction = apply_bps(original, *correction_bps);
            (DisputeStatus::PartialAdjustment, original - correction)
        }
    };

    dispute.status = status;
    dispute.outcome = Some(outcome.clone());
    dispute.reviewer = Some(resolver.to_string());
    dispute.resolved_height = Some(ctx.height);

    info!(
        dispute = %dispute.id,
        record = %record.id,
        status = ?status,
        original,
        revised,
        "dispute resolved"
    );
    Ok(AccountingAdjustment {
        id: adjustment_id,
        job_id: record.job_id.clone(),
        record_id: record.id.clone(),
        dispute_id: dispute.id.clone(),
        original_charge: original,
        revised_charge: revised,
        outcome,
        created_height: ctx.height,
    })
}

#[cfg(test)]
mod tests {
    use hpc_core::{Coin, ResourceKind};
    use hpcgrid_state::{JobState, SettlementStatus};

    use super::*;
    use crate::reconcile::reconcile;

    const MODERATOR: &str = "moderator1";

    fn params() -> EngineParams {
        EngineParams {
            moderators: vec![MODERATOR.to_string()],
            ..Default::default()
        }
    }

    fn job() -> HPCJob {
        HPCJob {
            id: "job-000001".to_string(),
            customer: "customer1".to_string(),
            template_id: None,
            resource_type: ResourceKind::Node,
            nodes: 1,
            gpus: 0,
            gpu_model: None,
            max_duration_secs: 3_600,
            budget: Coin::new(100_000, "uve"),
            region: "us-east".to_string(),
            promo_code: None,
            state: JobState::Completed,
            active_decision_id: None,
            cluster_id: Some("c1".to_string()),
            offering_id: Some("c1/std".to_string()),
            provider: Some("provider1".to_string()),
            escrow_id: "job-000001".to_string(),
            usage: UsageMetrics::default(),
            usage_reported: true,
            created_height: 1,
            created_time: 0,
            queued_time: Some(0),
            started_time: Some(0),
            finished_time: Some(3_600),
            updated_height: 5,
            history: Vec::new(),
            settlement: SettlementStatus::Unsettled,
        }
    }

    fn record() -> HPCAccountingRecord {
        HPCAccountingRecord {
            id: "job-000001:000001".to_string(),
            job_id: "job-000001".to_string(),
            sequence: 1,
            cluster_id: "c1".to_string(),
            provider: "provider1".to_string(),
            customer: "customer1".to_string(),
            period_start: 0,
            period_end: 3_600,
            usage: UsageMetrics {
                node_secs: 3_600,
                ..Default::default()
            },
            gross_charge: 10_000,
            charge: 10_000,
            is_final: true,
            job_state: JobState::Completed,
            content_hash: "00".repeat(32),
            dispute_status: DisputeStatus::None,
            created_height: 5,
            created_time: 3_600,
        }
    }

    fn flagged(by: &str) -> Dispute {
        open_dispute(
            "dispute-000001".to_string(),
            &record(),
            &job(),
            &[],
            by,
            "overbilled",
            &params(),
            &BlockContext::new(6, 3_700),
        )
        .unwrap()
    }

    fn under_review() -> Dispute {
        let mut d = flagged("customer1");
        begin_review(&mut d, MODERATOR, &params(), &BlockContext::new(7, 3_800)).unwrap();
        d
    }

    fn resolve(d: &mut Dispute, outcome: DisputeOutcome) -> AccountingResult<AccountingAdjustment> {
        resolve_dispute(
            d,
            &record(),
            outcome,
            MODERATOR,
            "job-000001:000001".to_string(),
            &params(),
            &BlockContext::new(8, 3_900),
        )
    }

    #[test]
    fn parties_may_flag_outsiders_may_not() {
        assert_eq!(flagged("customer1").status, DisputeStatus::Flagged);
        assert_eq!(flagged("provider1").raised_by, "provider1");
        assert!(!flagged(MODERATOR).automatic);

        let err = open_dispute(
            "dispute-000002".to_string(),
            &record(),
            &job(),
            &[],
            "stranger",
            "why not",
            &params(),
            &BlockContext::new(6, 3_700),
        )
        .unwrap_err();
        assert!(matches!(err, AccountingError::NotParticipant { .. }));
    }

    #[test]
    fn only_one_open_dispute_per_record() {
        let existing = vec![flagged("customer1")];
        let err = open_dispute(
            "dispute-000002".to_string(),
            &record(),
            &job(),
            &existing,
            "provider1",
            "again",
            &params(),
            &BlockContext::new(6, 3_700),
        )
        .unwrap_err();
        assert!(matches!(err, AccountingError::DisputeOpen { .. }));

        let observed = UsageMetrics {
            node_secs: 2_000,
            ..Default::default()
        };
        let report = reconcile(&record().usage, &observed, 500);
        assert!(
            open_automatic_dispute(
                "dispute-000003".to_string(),
                &record(),
                &existing,
                &report,
                observed,
                &params(),
                &BlockContext::new(6, 3_700),
            )
            .is_none()
        );
    }

    #[test]
    fn automatic_dispute_carries_observed_usage() {
        let observed = UsageMetrics {
            node_secs: 2_000,
            ..Default::default()
        };
        let report = reconcile(&record().usage, &observed, 500);
        let d = open_automatic_dispute(
            "dispute-000001".to_string(),
            &record(),
            &[],
            &report,
            observed.clone(),
            &params(),
            &BlockContext::new(6, 3_700),
        )
        .unwrap();
        assert!(d.automatic);
        assert_eq!(d.status, DisputeStatus::Flagged);
        assert_eq!(d.raised_by, params().reconciliation.system_address);
        assert_eq!(d.observed_usage, Some(observed));
        assert!(d.reason.contains("node_secs"));
    }

    #[test]
    fn review_requires_moderator_and_flagged_status() {
        let mut d = flagged("customer1");
        let err = begin_review(&mut d, "customer1", &params(), &BlockContext::new(7, 0)).unwrap_err();
        assert!(matches!(err, AccountingError::NotModerator { .. }));

        begin_review(&mut d, MODERATOR, &params(), &BlockContext::new(7, 0)).unwrap();
        assert_eq!(d.status, DisputeStatus::UnderReview);
        assert_eq!(d.reviewed_height, Some(7));
        let err = begin_review(&mut d, MODERATOR, &params(), &BlockContext::new(8, 0)).unwrap_err();
        assert!(matches!(err, AccountingError::InvalidDisputeTransition { .. }));
    }

    #[test]
    fn cannot_resolve_before_review() {
        let mut d = flagged("customer1");
        let err = resolve(&mut d, DisputeOutcome::Rejected).unwrap_err();
        assert!(matches!(
            err,
            AccountingError::InvalidDisputeTransition {
                status: DisputeStatus::Flagged,
                ..
            }
        ));
    }

    #[test]
    fn partial_adjustment_applies_bounded_correction() {
        let mut d = under_review();
        let adj = resolve(&mut d, DisputeOutcome::PartialAdjustment { correction_bps: 2_000 }).unwrap();
        assert_eq!(d.status, DisputeStatus::PartialAdjustment);
        assert_eq!(adj.original_charge, 10_000);
        assert_eq!(adj.revised_charge, 8_000);
        assert_eq!(adj.refund(), 2_000);

        let mut d = under_review();
        let err = resolve(&mut d, DisputeOutcome::PartialAdjustment { correction_bps: 6_000 }).unwrap_err();
        assert_eq!(err, AccountingError::CorrectionTooLarge { bps: 6_000, max: 5_000 });
        assert_eq!(d.status, DisputeStatus::UnderReview);
    }

    #[test]
    fn upheld_and_rejected_outcomes() {
        let mut d = under_review();
        let adj = resolve(&mut d, DisputeOutcome::Upheld { revised_charge: 7_500 }).unwrap();
        assert_eq!(adj.refund(), 2_500);
        assert_eq!(d.resolved_height, Some(8));

        // resolves exactly once
        let err = resolve(&mut d, DisputeOutcome::Rejected).unwrap_err();
        assert!(matches!(err, AccountingError::InvalidDisputeTransition { .. }));

        let mut d = under_review();
        let adj = resolve(&mut d, DisputeOutcome::Rejected).unwrap();
        assert_eq!(adj.refund(), 0);
        assert_eq!(d.status, DisputeStatus::Rejected);

        let mut d = under_review();
        let err = resolve(&mut d, DisputeOutcome::Upheld { revised_charge: 20_000 }).unwrap_err();
        assert!(matches!(err, AccountingError::RevisedChargeTooHigh { .. }));
    }
}
