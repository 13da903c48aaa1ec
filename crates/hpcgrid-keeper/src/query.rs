//! Read-only projections of engine state.

use hpcgrid_state::{
    AccountingAdjustment, Dispute, DisputeStatus, HPCAccountingRecord, HPCCluster, HPCJob,
    HPCOffering, HPCRewardRecord, ParamsEpoch, ProviderViolations, RoutingAuditRecord,
    SchedulingDecision, SettlementEntry, StateStore, UsageSnapshot,
};

use crate::error::{KeeperError, KeeperResult};

/// Query view over a state store.
pub struct Query<'a> {
    store: &'a StateStore,
}

impl<'a> Query<'a> {
    pub fn new(store: &'a StateStore) -> Self {
        Self { store }
    }

    pub fn cluster(&self, id: &str) -> KeeperResult<HPCCluster> {
        self.store
            .get_cluster(id)?
            .ok_or_else(|| KeeperError::not_found("cluster", id))
    }

    pub fn clusters(&self) -> KeeperResult<Vec<HPCCluster>> {
        Ok(self.store.list_clusters()?)
    }

    pub fn offerings(&self, cluster_id: &str) -> KeeperResult<Vec<HPCOffering>> {
        Ok(self.store.list_offerings_for_cluster(cluster_id)?)
    }

    pub fn job(&self, id: &str) -> KeeperResult<HPCJob> {
        self.store
            .get_job(id)?
            .ok_or_else(|| KeeperError::not_found("job", id))
    }

    pub fn jobs(&self) -> KeeperResult<Vec<HPCJob>> {
        Ok(self.store.list_jobs()?)
    }

    /// The job's active decision, if it has one.
    pub fn active_decision(&self, job_id: &str) -> KeeperResult<Option<SchedulingDecision>> {
        let job = self.job(job_id)?;
        match job.active_decision_id {
            Some(id) => Ok(self.store.get_decision(&id)?),
            None => Ok(None),
        }
    }

    /// Every decision for the job, superseded ones included.
    pub fn decisions(&self, job_id: &str) -> KeeperResult<Vec<SchedulingDecision>> {
        Ok(self.store.list_decisions(job_id)?)
    }

    pub fn audit_trail(&self, job_id: &str) -> KeeperResult<Vec<RoutingAuditRecord>> {
        Ok(self.store.list_audit_records(job_id)?)
    }

    /// Accounting records with their live dispute status.
    ///
    /// Stored records keep the status they were created with; the live
    /// status comes from the latest dispute raised against each record.
    pub fn accounting(&self, job_id: &str) -> KeeperResult<Vec<HPCAccountingRecord>> {
        let disputes = self.store.list_disputes_for_job(job_id)?;
        let mut records = self.store.list_accounting(job_id)?;
        for record in &mut records {
            record.dispute_status = live_status(&record.id, &disputes);
        }
        Ok(records)
    }

    pub fn final_record(&self, job_id: &str) -> KeeperResult<Option<HPCAccountingRecord>> {
        Ok(self.accounting(job_id)?.into_iter().find(|r| r.is_final))
    }

    pub fn adjustments(&self, job_id: &str) -> KeeperResult<Vec<AccountingAdjustment>> {
        Ok(self.store.list_adjustments(job_id)?)
    }

    pub fn snapshots(&self, job_id: &str) -> KeeperResult<Vec<UsageSnapshot>> {
        Ok(self.store.list_snapshots(job_id)?)
    }

    pub fn reward(&self, job_id: &str) -> KeeperResult<Option<HPCRewardRecord>> {
        Ok(self.store.get_reward(&HPCRewardRecord::make_id(job_id))?)
    }

    pub fn dispute(&self, id: &str) -> KeeperResult<Dispute> {
        self.store
            .get_dispute(id)?
            .ok_or_else(|| KeeperError::not_found("dispute", id))
    }

    pub fn disputes(&self, job_id: &str) -> KeeperResult<Vec<Dispute>> {
        Ok(self.store.list_disputes_for_job(job_id)?)
    }

    pub fn settlement_entries(&self, job_id: &str) -> KeeperResult<Vec<SettlementEntry>> {
        Ok(self.store.list_settlement_entries(job_id)?)
    }

    pub fn violations(&self, provider: &str) -> KeeperResult<Option<ProviderViolations>> {
        Ok(self.store.get_violations(provider)?)
    }

    pub fn params_history(&self) -> KeeperResult<Vec<ParamsEpoch>> {
        Ok(self.store.list_params()?)
    }
}

fn live_status(record_id: &str, disputes: &[Dispute]) -> DisputeStatus {
    disputes
        .iter()
        .filter(|d| d.record_id == record_id)
        .max_by(|a, b| a.created_height.cmp(&b.created_height).then_with(|| a.id.cmp(&b.id)))
        .map(|d| d.status)
        .unwrap_or(DisputeStatus::None)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dispute(id: &str, record: &str, height: u64, status: DisputeStatus) -> Dispute {
        Dispute {
            id: id.to_string(),
            record_id: record.to_string(),
            job_id: "job-000001".to_string(),
            raised_by: "alice".to_string(),
            reason: "wrong".to_string(),
            status,
            automatic: false,
            observed_usage: None,
            reviewer: None,
            outcome: None,
            created_height: height,
            reviewed_height: None,
            resolved_height: None,
        }
    }

    #[test]
    fn live_status_follows_latest_dispute() {
        let disputes = vec![
            dispute("dispute-000001", "job-000001:000001", 5, DisputeStatus::Rejected),
            dispute("dispute-000002", "job-000001:000001", 9, DisputeStatus::Flagged),
            dispute("dispute-000003", "job-000001:000002", 9, DisputeStatus::Upheld),
        ];
        assert_eq!(live_status("job-000001:000001", &disputes), DisputeStatus::Flagged);
        assert_eq!(live_status("job-000001:000002", &disputes), DisputeStatus::Upheld);
        assert_eq!(live_status("job-000001:000003", &disputes), DisputeStatus::None);
    }
}
