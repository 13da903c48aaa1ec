//! Period accounting records.

use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::debug;

use hpc_core::{BlockContext, UsageMetrics};
use hpcgrid_billing::ChargeBreakdown;
use hpcgrid_state::{DisputeStatus, HPCAccountingRecord, HPCJob, sequence_key};

use crate::error::{AccountingError, AccountingResult};

/// A billing period to record for a job.
#[derive(Debug, Clone)]
pub struct PeriodRecord {
    pub period_start: u64,
    pub period_end: u64,
    pub usage: UsageMetrics,
    pub is_final: bool,
}

/// The hashed view of a record: every field except the hash itself and
/// the creation-time dispute status.
#[derive(Serialize)]
struct HashedContent<'a> {
    id: &'a str,
    job_id: &'a str,
    sequence: u64,
    cluster_id: &'a str,
    provider: &'a str,
    customer: &'a str,
    period_start: u64,
    period_end: u64,
    usage: &'a UsageMetrics,
    gross_charge: u64,
    charge: u64,
    is_final: bool,
    job_state: hpcgrid_state::JobState,
    created_height: u64,
    created_time: u64,
}

/// Hex SHA-256 over the record's canonical JSON content.
pub fn content_hash(record: &HPCAccountingRecord) -> AccountingResult<String> {
    let content = HashedContent {
        id: &record.id,
        job_id: &record.job_id,
        sequence: record.sequence,
        cluster_id: &record.cluster_id,
        provider: &record.provider,
        customer: &record.customer,
        period_start: record.period_start,
        period_end: record.period_end,
        usage: &record.usage,
        gross_charge: record.gross_charge,
        charge: record.charge,
        is_final: record.is_final,
        job_state: record.job_state,
        created_height: record.created_height,
        created_time: record.created_time,
    };
    let bytes = serde_json::to_vec(&content).map_err(|e| AccountingError::Hash(e.to_string()))?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}

/// Whether the stored hash still matches the record's content.
pub fn verify_hash(record: &HPCAccountingRecord) -> AccountingResult<bool> {
    Ok(content_hash(record)? == record.content_hash)
}

/// Reject periods that are empty, overlap, or precede what is recorded.
///
/// The final record spans the whole run (cumulative usage), so only its
/// end is checked against earlier periods.
pub fn check_period_order(
    job_id: &str,
    existing: &[HPCAccountingRecord],
    period: &PeriodRecord,
) -> AccountingResult<()> {
    let order_err = |reason: &str| AccountingError::PeriodOrder {
        job_id: job_id.to_string(),
        start: period.period_start,
        end: period.period_end,
        reason: reason.to_string(),
    };
    if existing.iter().any(|r| r.is_final) {
        return Err(AccountingError::AlreadyFinal {
            job_id: job_id.to_string(),
        });
    }
    if period.period_end < period.period_start {
        return Err(order_err("ends before it starts"));
    }
    if !period.is_final && period.period_end == period.period_start {
        return Err(order_err("is empty"));
    }
    if let Some(last) = existing.last() {
        if period.period_end < last.period_end {
            return Err(order_err("precedes the last recorded period"));
        }
        if !period.is_final && period.period_start < last.period_end {
            return Err(order_err("overlaps the last recorded period"));
        }
    }
    Ok(())
}

/// Build the next accounting record for `job`, hash included.
pub fn build_record(
    job: &HPCJob,
    sequence: u64,
    period: PeriodRecord,
    charge: &ChargeBreakdown,
    ctx: &BlockContext,
) -> AccountingResult<HPCAccountingRecord> {
    let mut record = HPCAccountingRecord {
        id: sequence_key(&job.id, sequence),
        job_id: job.id.clone(),
        sequence,
        cluster_id: job.cluster_id.clone().unwrap_or_default(),
        provider: job.provider.clone().unwrap_or_default(),
        customer: job.customer.clone(),
        period_start: period.period_start,
        period_end: period.period_end,
        usage: period.usage,
        gross_charge: charge.gross,
        charge: charge.total,
        is_final: period.is_final,
        job_state: job.state,
        content_hash: String::new(),
        dispute_status: DisputeStatus::None,
        created_height: ctx.height,
        created_time: ctx.time,
    };
    record.content_hash = content_hash(&record)?;
    debug!(
        record = %record.id,
        charge = record.charge,
        is_final = record.is_final,
        hash = %record.content_hash,
        "accounting record built"
    );
    Ok(record)
}

#[cfg(test)]
mod tests {
    use hpc_core::{Coin, HPCBillingRules, ResourceKind};
    use hpcgrid_billing::compute_charge;
    use hpcgrid_state::{JobState, SettlementStatus};

    use super::*;

    fn job() -> HPCJob {
        HPCJob {
            id: "job-000001".to_string(),
            customer: "customer1".to_string(),
            template_id: None,
            resource_type: ResourceKind::Node,
            nodes: 1,
            gpus: 0,
            gpu_model: None,
            max_duration_secs: 7_200,
            budget: Coin::new(1_000_000, "uve"),
            region: "us-east".to_string(),
            promo_code: None,
            state: JobState::Running,
            active_decision_id: None,
            cluster_id: Some("c1".to_string()),
            offering_id: Some("c1/std".to_string()),
            provider: Some("provider1".to_string()),
            escrow_id: "job-000001".to_string(),
            usage: UsageMetrics::default(),
            usage_reported: false,
            created_height: 1,
            created_time: 0,
            queued_time: Some(0),
            started_time: Some(0),
            finished_time: None,
            updated_height: 1,
            history: Vec::new(),
            settlement: SettlementStatus::Unsettled,
        }
    }

    fn period(start: u64, end: u64, is_final: bool) -> PeriodRecord {
        PeriodRecord {
            period_start: start,
            period_end: end,
            usage: UsageMetrics {
                node_secs: end - start,
                ..Default::default()
            },
            is_final,
        }
    }

    fn record(start: u64, end: u64, is_final: bool, seq: u64) -> HPCAccountingRecord {
        let p = period(start, end, is_final);
        let charge = compute_charge(&p.usage, &HPCBillingRules::default()).unwrap();
        build_record(&job(), seq, p, &charge, &BlockContext::new(10, end)).unwrap()
    }

    #[test]
    fn record_hash_detects_tampering() {
        let mut r = record(0, 3_600, false, 1);
        assert_eq!(r.id, "job-000001:000001");
        assert_eq!(r.charge, 100_000);
        assert_eq!(r.content_hash.len(), 64);
        assert!(verify_hash(&r).unwrap());

        r.charge = 1;
        assert!(!verify_hash(&r).unwrap());
    }

    #[test]
    fn identical_records_hash_identically() {
        assert_eq!(
            record(0, 600, false, 1).content_hash,
            record(0, 600, false, 1).content_hash
        );
        assert_ne!(
            record(0, 600, false, 1).content_hash,
            record(0, 600, false, 2).content_hash
        );
    }

    #[test]
    fn periods_must_be_ordered() {
        let existing = vec![record(0, 600, false, 1)];
        assert!(check_period_order("job-000001", &existing, &period(600, 1_200, false)).is_ok());

        let overlap = check_period_order("job-000001", &existing, &period(300, 900, false));
        assert!(matches!(overlap, Err(AccountingError::PeriodOrder { .. })));
        let before = check_period_order("job-000001", &existing, &period(0, 300, false));
        assert!(matches!(before, Err(AccountingError::PeriodOrder { .. })));
        let empty = check_period_order("job-000001", &[], &period(5, 5, false));
        assert!(matches!(empty, Err(AccountingError::PeriodOrder { .. })));
    }

    #[test]
    fn final_record_spans_run_and_closes_the_log() {
        let existing = vec![record(0, 600, false, 1)];
        // cumulative final record starts at the job's start
        assert!(check_period_order("job-000001", &existing, &period(0, 900, true)).is_ok());
        // zero-length final for a job that never ran
        assert!(check_period_order("job-000001", &[], &period(50, 50, true)).is_ok());

        let closed = vec![record(0, 600, false, 1), record(0, 900, true, 2)];
        let err = check_period_order("job-000001", &closed, &period(900, 1_000, false));
        assert!(matches!(err, Err(AccountingError::AlreadyFinal { .. })));
    }
}
