//! redb table definitions for the HPCGrid state store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized domain types).
//! Per-job logs use `{job_id}:{sequence:06}` keys so a prefix scan returns
//! them in creation order.

use redb::TableDefinition;

pub(crate) type Table = TableDefinition<'static, &'static str, &'static [u8]>;

/// Clusters keyed by `{cluster_id}`.
pub const CLUSTERS: Table = TableDefinition::new("clusters");

/// Offerings keyed by `{cluster_id}/{name}`.
pub const OFFERINGS: Table = TableDefinition::new("offerings");

/// Jobs keyed by `{job_id}`.
pub const JOBS: Table = TableDefinition::new("jobs");

/// Index of non-terminal jobs keyed by `{job_id}`. Value is the job state.
pub const ACTIVE_JOBS: Table = TableDefinition::new("active_jobs");

/// Scheduling decisions keyed by `{job_id}:{sequence}`.
pub const DECISIONS: Table = TableDefinition::new("decisions");

/// Routing audit records keyed by `{job_id}:{sequence}`.
pub const ROUTING_AUDIT: Table = TableDefinition::new("routing_audit");

/// Per-provider violation counters keyed by `{provider}`.
pub const VIOLATIONS: Table = TableDefinition::new("violations");

/// Accounting records keyed by `{job_id}:{sequence}`.
pub const ACCOUNTING: Table = TableDefinition::new("accounting");

/// Dispute resolution records keyed by `{job_id}:{sequence}`.
pub const ADJUSTMENTS: Table = TableDefinition::new("adjustments");

/// Observed usage keyed by `{job_id}:{period_end}`.
pub const USAGE_SNAPSHOTS: Table = TableDefinition::new("usage_snapshots");

/// Disputes keyed by `{dispute_id}`.
pub const DISPUTES: Table = TableDefinition::new("disputes");

/// Reward records keyed by `reward/{job_id}`.
pub const REWARDS: Table = TableDefinition::new("rewards");

/// Settlement ledger keyed by `{job_id}:{sequence}`.
pub const SETTLEMENT_ENTRIES: Table = TableDefinition::new("settlement_entries");

/// Finalization markers keyed by `{job_id}`.
pub const FINALIZED: Table = TableDefinition::new("finalized");

/// Workload templates keyed by `{template_id}`.
pub const TEMPLATES: Table = TableDefinition::new("templates");

/// Customer aggregates keyed by `{address}`.
pub const CUSTOMERS: Table = TableDefinition::new("customers");

/// Params epochs keyed by `{version:012}`.
pub const PARAMS: Table = TableDefinition::new("params");

/// Monotonic counters keyed by name.
pub const SEQUENCES: Table = TableDefinition::new("sequences");

pub(crate) const ALL_TABLES: [Table; 18] = [
    CLUSTERS,
    OFFERINGS,
    JOBS,
    ACTIVE_JOBS,
    DECISIONS,
    ROUTING_AUDIT,
    VIOLATIONS,
    ACCOUNTING,
    ADJUSTMENTS,
    USAGE_SNAPSHOTS,
    DISPUTES,
    REWARDS,
    SETTLEMENT_ENTRIES,
    FINALIZED,
    TEMPLATES,
    CUSTOMERS,
    PARAMS,
    SEQUENCES,
];
