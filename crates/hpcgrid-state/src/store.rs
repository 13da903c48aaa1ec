//! StateStore — redb-backed state persistence for HPCGrid.
//!
//! Reads are typed getters over JSON-serialized values. Writes are staged
//! in a [`WriteBatch`] and applied by [`StateStore::commit`] inside a single
//! redb write transaction: either every staged write lands or none does.

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable, WriteTransaction};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

enum BatchOp {
    Put {
        table: Table,
        key: String,
        value: Vec<u8>,
        /// Fail the commit if the key already exists.
        create_only: bool,
    },
    Delete {
        table: Table,
        key: String,
    },
}

/// Writes staged by one keeper message, applied atomically.
#[derive(Default)]
pub struct WriteBatch {
    ops: Vec<BatchOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    fn stage<T: Serialize>(
        &mut self,
        table: Table,
        key: String,
        value: &T,
        create_only: bool,
    ) -> StateResult<()> {
        let value = serde_json::to_vec(value).map_err(map_err!(Serialize))?;
        self.ops.push(BatchOp::Put {
            table,
            key,
            value,
            create_only,
        });
        Ok(())
    }

    fn delete(&mut self, table: Table, key: String) {
        self.ops.push(BatchOp::Delete { table, key });
    }

    // ── Registry ───────────────────────────────────────────────────

    pub fn put_cluster(&mut self, cluster: &HPCCluster) -> StateResult<()> {
        self.stage(CLUSTERS, cluster.id.clone(), cluster, false)
    }

    pub fn put_offering(&mut self, offering: &HPCOffering) -> StateResult<()> {
        self.stage(OFFERINGS, offering.id.clone(), offering, false)
    }

    pub fn put_template(&mut self, template: &WorkloadTemplate) -> StateResult<()> {
        self.stage(TEMPLATES, template.id.clone(), template, false)
    }

    // ── Jobs ───────────────────────────────────────────────────────

    /// Store a job and keep the active-job index in step with its state.
    pub fn put_job(&mut self, job: &HPCJob) -> StateResult<()> {
        self.stage(JOBS, job.id.clone(), job, false)?;
        if job.state.is_terminal() {
            self.delete(ACTIVE_JOBS, job.id.clone());
        } else {
            self.stage(ACTIVE_JOBS, job.id.clone(), &job.state, false)?;
        }
        Ok(())
    }

    pub fn put_customer(&mut self, stats: &CustomerStats) -> StateResult<()> {
        self.stage(CUSTOMERS, stats.address.clone(), stats, false)
    }

    // ── Scheduling & routing ───────────────────────────────────────

    pub fn put_decision(&mut self, decision: &SchedulingDecision) -> StateResult<()> {
        self.stage(DECISIONS, decision.id.clone(), decision, true)
    }

    pub fn put_audit_record(&mut self, record: &RoutingAuditRecord) -> StateResult<()> {
        self.stage(ROUTING_AUDIT, record.id.clone(), record, true)
    }

    pub fn put_violations(&mut self, violations: &ProviderViolations) -> StateResult<()> {
        self.stage(VIOLATIONS, violations.provider.clone(), violations, false)
    }

    // ── Accounting & disputes ──────────────────────────────────────

    pub fn put_accounting(&mut self, record: &HPCAccountingRecord) -> StateResult<()> {
        self.stage(ACCOUNTING, record.id.clone(), record, true)
    }

    pub fn put_adjustment(&mut self, adjustment: &AccountingAdjustment) -> StateResult<()> {
        self.stage(ADJUSTMENTS, adjustment.id.clone(), adjustment, true)
    }

    pub fn put_snapshot(&mut self, snapshot: &UsageSnapshot) -> StateResult<()> {
        self.stage(USAGE_SNAPSHOTS, snapshot.table_key(), snapshot, true)
    }

    pub fn put_dispute(&mut self, dispute: &Dispute) -> StateResult<()> {
        self.stage(DISPUTES, dispute.id.clone(), dispute, false)
    }

    // ── Settlement ─────────────────────────────────────────────────

    pub fn put_reward(&mut self, reward: &HPCRewardRecord) -> StateResult<()> {
        self.stage(REWARDS, reward.id.clone(), reward, true)
    }

    pub fn put_settlement_entry(&mut self, entry: &SettlementEntry) -> StateResult<()> {
        self.stage(SETTLEMENT_ENTRIES, entry.id.clone(), entry, true)
    }

    /// Overwrite an existing entry; only its status ever changes.
    pub fn update_settlement_entry(&mut self, entry: &SettlementEntry) -> StateResult<()> {
        self.stage(SETTLEMENT_ENTRIES, entry.id.clone(), entry, false)
    }

    pub fn put_finalized(&mut self, marker: &FinalizationMarker) -> StateResult<()> {
        self.stage(FINALIZED, marker.job_id.clone(), marker, true)
    }

    // ── Params & sequences ─────────────────────────────────────────

    pub fn put_params_epoch(&mut self, epoch: &ParamsEpoch) -> StateResult<()> {
        self.stage(PARAMS, format!("{:012}", epoch.version), epoch, true)
    }

    pub fn set_sequence(&mut self, name: &str, value: u64) -> StateResult<()> {
        self.stage(SEQUENCES, name.to_string(), &value, false)
    }
}

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing and replay).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        for table in ALL_TABLES {
            txn.open_table(table).map_err(map_err!(Table))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Apply every staged write in one transaction.
    pub fn commit(&self, batch: WriteBatch) -> StateResult<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let ops = batch.len();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        if let Err(e) = apply_ops(&txn, batch.ops) {
            txn.abort().map_err(map_err!(Transaction))?;
            return Err(e);
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(ops, "batch committed");
        Ok(())
    }

    // ── Generic access ─────────────────────────────────────────────

    fn get<T: DeserializeOwned>(&self, table: Table, key: &str) -> StateResult<Option<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(table).map_err(map_err!(Table))?;
        match table.get(key).map_err(map_err!(Read))? {
            Some(guard) => {
                let value: T =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    fn list<T: DeserializeOwned>(&self, table: Table) -> StateResult<Vec<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(table).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            results.push(serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?);
        }
        Ok(results)
    }

    /// Values whose key starts with `prefix`, in key order.
    fn list_prefix<T: DeserializeOwned>(&self, table: Table, prefix: &str) -> StateResult<Vec<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(table).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.range(prefix..).map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if !key.value().starts_with(prefix) {
                break;
            }
            results.push(serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?);
        }
        Ok(results)
    }

    fn count_prefix(&self, table: Table, prefix: &str) -> StateResult<u64> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(table).map_err(map_err!(Table))?;
        let mut count = 0;
        for entry in table.range(prefix..).map_err(map_err!(Read))? {
            let (key, _) = entry.map_err(map_err!(Read))?;
            if !key.value().starts_with(prefix) {
                break;
            }
            count += 1;
        }
        Ok(count)
    }

    // ── Registry ───────────────────────────────────────────────────

    pub fn get_cluster(&self, id: &str) -> StateResult<Option<HPCCluster>> {
        self.get(CLUSTERS, id)
    }

    pub fn list_clusters(&self) -> StateResult<Vec<HPCCluster>> {
        self.list(CLUSTERS)
    }

    pub fn get_offering(&self, id: &str) -> StateResult<Option<HPCOffering>> {
        self.get(OFFERINGS, id)
    }

    pub fn list_offerings(&self) -> StateResult<Vec<HPCOffering>> {
        self.list(OFFERINGS)
    }

    /// Offerings registered on one cluster.
    pub fn list_offerings_for_cluster(&self, cluster_id: &str) -> StateResult<Vec<HPCOffering>> {
        self.list_prefix(OFFERINGS, &format!("{cluster_id}/"))
    }

    pub fn get_template(&self, id: &str) -> StateResult<Option<WorkloadTemplate>> {
        self.get(TEMPLATES, id)
    }

    // ── Jobs ───────────────────────────────────────────────────────

    pub fn get_job(&self, id: &str) -> StateResult<Option<HPCJob>> {
        self.get(JOBS, id)
    }

    pub fn list_jobs(&self) -> StateResult<Vec<HPCJob>> {
        self.list(JOBS)
    }

    /// Ids of jobs not yet in a terminal state.
    pub fn list_active_job_ids(&self) -> StateResult<Vec<String>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(ACTIVE_JOBS).map_err(map_err!(Table))?;
        let mut ids = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, _) = entry.map_err(map_err!(Read))?;
            ids.push(key.value().to_string());
        }
        Ok(ids)
    }

    pub fn get_customer(&self, address: &str) -> StateResult<Option<CustomerStats>> {
        self.get(CUSTOMERS, address)
    }

    // ── Scheduling & routing ───────────────────────────────────────

    pub fn get_decision(&self, id: &str) -> StateResult<Option<SchedulingDecision>> {
        self.get(DECISIONS, id)
    }

    /// Every decision ever made for a job, oldest first.
    pub fn list_decisions(&self, job_id: &str) -> StateResult<Vec<SchedulingDecision>> {
        self.list_prefix(DECISIONS, &format!("{job_id}:"))
    }

    pub fn count_decisions(&self, job_id: &str) -> StateResult<u64> {
        self.count_prefix(DECISIONS, &format!("{job_id}:"))
    }

    /// Routing audit trail for a job, oldest first.
    pub fn list_audit_records(&self, job_id: &str) -> StateResult<Vec<RoutingAuditRecord>> {
        self.list_prefix(ROUTING_AUDIT, &format!("{job_id}:"))
    }

    pub fn count_audit_records(&self, job_id: &str) -> StateResult<u64> {
        self.count_prefix(ROUTING_AUDIT, &format!("{job_id}:"))
    }

    pub fn get_violations(&self, provider: &str) -> StateResult<Option<ProviderViolations>> {
        self.get(VIOLATIONS, provider)
    }

    pub fn list_violations(&self) -> StateResult<Vec<ProviderViolations>> {
        self.list(VIOLATIONS)
    }

    // ── Accounting & disputes ──────────────────────────────────────

    pub fn get_accounting(&self, id: &str) -> StateResult<Option<HPCAccountingRecord>> {
        self.get(ACCOUNTING, id)
    }

    /// Accounting records for a job, oldest first.
    pub fn list_accounting(&self, job_id: &str) -> StateResult<Vec<HPCAccountingRecord>> {
        self.list_prefix(ACCOUNTING, &format!("{job_id}:"))
    }

    pub fn list_adjustments(&self, job_id: &str) -> StateResult<Vec<AccountingAdjustment>> {
        self.list_prefix(ADJUSTMENTS, &format!("{job_id}:"))
    }

    pub fn count_adjustments(&self, job_id: &str) -> StateResult<u64> {
        self.count_prefix(ADJUSTMENTS, &format!("{job_id}:"))
    }

    /// Observed usage for a job, ordered by period end.
    pub fn list_snapshots(&self, job_id: &str) -> StateResult<Vec<UsageSnapshot>> {
        self.list_prefix(USAGE_SNAPSHOTS, &format!("{job_id}:"))
    }

    pub fn get_dispute(&self, id: &str) -> StateResult<Option<Dispute>> {
        self.get(DISPUTES, id)
    }

    pub fn list_disputes(&self) -> StateResult<Vec<Dispute>> {
        self.list(DISPUTES)
    }

    pub fn list_disputes_for_job(&self, job_id: &str) -> StateResult<Vec<Dispute>> {
        Ok(self
            .list_disputes()?
            .into_iter()
            .filter(|d| d.job_id == job_id)
            .collect())
    }

    // ── Settlement ─────────────────────────────────────────────────

    pub fn get_reward(&self, id: &str) -> StateResult<Option<HPCRewardRecord>> {
        self.get(REWARDS, id)
    }

    pub fn list_settlement_entries(&self, job_id: &str) -> StateResult<Vec<SettlementEntry>> {
        self.list_prefix(SETTLEMENT_ENTRIES, &format!("{job_id}:"))
    }

    pub fn count_settlement_entries(&self, job_id: &str) -> StateResult<u64> {
        self.count_prefix(SETTLEMENT_ENTRIES, &format!("{job_id}:"))
    }

    pub fn get_finalized(&self, job_id: &str) -> StateResult<Option<FinalizationMarker>> {
        self.get(FINALIZED, job_id)
    }

    // ── Params & sequences ─────────────────────────────────────────

    /// The params epoch with the highest version.
    pub fn latest_params(&self) -> StateResult<Option<ParamsEpoch>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(PARAMS).map_err(map_err!(Table))?;
        match table.last().map_err(map_err!(Read))? {
            Some((_, value)) => {
                let epoch: ParamsEpoch =
                    serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(epoch))
            }
            None => Ok(None),
        }
    }

    pub fn list_params(&self) -> StateResult<Vec<ParamsEpoch>> {
        self.list(PARAMS)
    }

    /// Current value of a named counter (0 if never set).
    pub fn sequence(&self, name: &str) -> StateResult<u64> {
        Ok(self.get::<u64>(SEQUENCES, name)?.unwrap_or(0))
    }
}

fn apply_ops(txn: &WriteTransaction, ops: Vec<BatchOp>) -> StateResult<()> {
    for op in ops {
        match op {
            BatchOp::Put {
                table,
                key,
                value,
                create_only,
            } => {
                let mut table = txn.open_table(table).map_err(map_err!(Table))?;
                if create_only && table.get(key.as_str()).map_err(map_err!(Read))?.is_some() {
                    return Err(StateError::AlreadyExists(key));
                }
                table
                    .insert(key.as_str(), value.as_slice())
                    .map_err(map_err!(Write))?;
            }
            BatchOp::Delete { table, key } => {
                let mut table = txn.open_table(table).map_err(map_err!(Table))?;
                table.remove(key.as_str()).map_err(map_err!(Write))?;
            }
        }
    }
    Ok(())
}
