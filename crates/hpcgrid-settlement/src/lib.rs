//! hpcgrid-settlement — paying out finalized jobs.
//!
//! # Components
//!
//! - **`escrow`** — The `Escrow` interface (lock, transfer, release) the
//!   host ledger implements, plus an in-memory implementation with
//!   failure injection for tests and replay.
//! - **`split`** — Platform fee, provider reward and node-operator shares.
//! - **`settle`** — Executes a split against escrow atomically: either
//!   every leg lands or every executed leg is reversed.
//! - **`compensation`** — Compensating entries from dispute adjustments,
//!   executed immediately or deferred and netted at settlement.

pub mod compensation;
pub mod error;
pub mod escrow;
pub mod settle;
pub mod split;

pub use compensation::{compensation_entry, execute_compensation};
pub use error::{SettlementError, SettlementResult};
pub use escrow::{Account, Escrow, InMemoryEscrow};
pub use settle::{SettlementInput, SettlementReceipt, settle_job};
pub use split::{RewardSplit, compute_split};
