//! hpcgrid-lifecycle — job lifecycle state machine.
//!
//! ```text
//! pending → queued → starting → running → {completed | failed | cancelled | timeout}
//!                                 ↕
//!                             suspended
//! ```
//!
//! Terminal states are absorbing. Any non-terminal state may be cancelled.
//! Provider status strings are normalized at the boundary by a
//! [`SchedulerKind`] adapter; the state machine only sees [`JobState`]s.
//!
//! [`JobState`]: hpcgrid_state::JobState

pub mod adapter;
pub mod error;
pub mod machine;
pub mod usage;

pub use adapter::{MoabStatus, OpenOnDemandStatus, SchedulerKind, SlurmStatus, StatusNormalizer};
pub use error::{LifecycleError, LifecycleResult};
pub use machine::{TransitionOutcome, deadline, forward_path, is_legal, is_timed_out, transition};
pub use usage::{derive_usage, effective_usage};
