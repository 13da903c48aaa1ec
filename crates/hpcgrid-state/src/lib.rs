//! hpcgrid-state — embedded state store for HPCGrid.
//!
//! Backed by [redb](https://docs.rs/redb), provides persistent and in-memory
//! state for clusters, offerings, jobs, scheduling decisions, routing audit
//! records, accounting, disputes, and settlement.
//!
//! # Architecture
//!
//! All domain types are JSON-serialized into redb's `&[u8]` value columns.
//! Per-job logs (decisions, audit, accounting, settlement entries) use
//! `{job_id}:{sequence}` keys so prefix scans return them in order.
//!
//! A keeper message stages its writes in a [`WriteBatch`] and commits them
//! in one redb write transaction, so a rejected message leaves no trace.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{CapacityError, StateError, StateResult};
pub use store::{StateStore, WriteBatch};
pub use types::*;
