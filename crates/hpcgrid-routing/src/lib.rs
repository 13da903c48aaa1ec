//! hpcgrid-routing — the routing enforcer.
//!
//! Checks a provider's proposed placement of a job against the job's
//! active scheduling decision under one of three module-wide modes:
//!
//! - **Strict**: only a fresh decision whose cluster matches and has
//!   capacity is approved; everything else is rejected.
//! - **Permissive**: missing or stale decisions are re-scheduled, and an
//!   unavailable decision cluster falls back to an alternative.
//! - **Audit-only**: the proposed cluster is approved; violations are
//!   only recorded.
//!
//! Every call yields exactly one `RoutingAuditRecord`, including calls
//! that fail. The enforcer does not write to the store itself: it returns
//! a [`RoutingOutcome`] whose writes the caller stages into its batch.

pub mod enforcer;
pub mod error;

pub use enforcer::{RoutingApproval, RoutingEnforcer, RoutingOutcome};
pub use error::{RoutingError, RoutingResult};
