//! hpcgrid-keeper — the deterministic HPC engine.
//!
//! Applies externally ordered messages to the state store, one
//! [`WriteBatch`](hpcgrid_state::WriteBatch) per message. Replicas that
//! apply the same messages at the same [`BlockContext`](hpc_core::BlockContext)s
//! reach identical state and emit identical events.
//!
//! # Components
//!
//! - **`keeper`** — `Keeper::new` (genesis params) and `Keeper::apply`,
//!   the single entry point; governance param replacement.
//! - **`registry`** — Clusters, offerings, health feed, template status.
//! - **`jobs`** — Submission (escrow lock + first decision), explicit
//!   re-scheduling, placement through the routing enforcer, provider
//!   status reports, cancellation.
//! - **`finalize`** — Capacity release, final accounting, reconciliation,
//!   settle-or-retry, and the end-of-cycle hook (`process_cycle`).
//! - **`records`** — Periodic accounting, usage snapshots, disputes and
//!   compensating entries.
//! - **`query`** — Read-only projections.
//! - **`events`** — `EngineEvent`s returned from every message.

pub mod error;
pub mod events;
mod finalize;
mod jobs;
pub mod keeper;
pub mod msg;
pub mod query;
mod records;
mod registry;

pub use error::{ErrorClass, KeeperError, KeeperResult};
pub use events::EngineEvent;
pub use keeper::Keeper;
pub use msg::{
    CreateOffering, Msg, RecordUsageSnapshot, RegisterCluster, ReportStatus, SubmitAccounting,
    SubmitJob, UpdateCluster, UpdateClusterHealth, UpdateOffering,
};
pub use query::Query;
