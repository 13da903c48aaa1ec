//! hpcgrid-billing — the billing calculator.
//!
//! A pure function from (usage, billing rules) to an itemized charge.
//! All arithmetic is fixed-point via [`rust_decimal`]; the final charge is
//! truncated to whole tokens. Processing order:
//!
//! 1. Round each time-based quantity down to the billing granularity.
//! 2. Price each resource line (`rate × units / 3600`, network per GB).
//! 3. Apply per-model GPU multipliers.
//! 4. Apply eligible discounts multiplicatively, in registration order.
//! 5. Truncate, cap at the budget, floor at the minimum charge.

pub mod calculator;
pub mod discount;
pub mod error;

pub use calculator::{
    ChargeBreakdown, ChargeContext, ChargeLine, compute_charge, compute_charge_with,
    estimate_allocation_charge, offering_rates,
};
pub use discount::{AppliedDiscount, DiscountContext, eligible_discounts};
pub use error::{BillingError, BillingResult};
