//! hpcgrid-accounting — accounting records, reconciliation, disputes.
//!
//! # Components
//!
//! - **`record`** — Period accounting records with ordering checks and a
//!   SHA-256 content hash. The final record carries cumulative usage and is
//!   what settles; periodic records can still be disputed and compensated.
//! - **`reconcile`** — Per-metric comparison of provider-reported usage
//!   against observed snapshots within a tolerance band. Only snapshots
//!   that tile the record period exactly count as observed.
//! - **`dispute`** — `flagged → under_review → {upheld | rejected |
//!   partial_adjustment}`, resolved by moderators into adjustment records
//!   that leave the disputed record untouched.

pub mod dispute;
pub mod error;
pub mod reconcile;
pub mod record;

pub use dispute::{begin_review, open_automatic_dispute, open_dispute, resolve_dispute};
pub use error::{AccountingError, AccountingResult};
pub use reconcile::{MetricMismatch, ReconciliationReport, observed_for_period, reconcile};
pub use record::{PeriodRecord, build_record, check_period_order, content_hash, verify_hash};
