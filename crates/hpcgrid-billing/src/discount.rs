//! Discount eligibility.
//!
//! Each rule carries an activation threshold whose meaning depends on the
//! rule kind. Eligible rules stack multiplicatively in the order they are
//! registered in the billing rules.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use hpc_core::{Address, Amount, DiscountKind, DiscountRule, UsageMetrics};

/// Facts about the customer and placement that discounts are keyed on.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscountContext {
    /// Customer's settled spend before this charge.
    pub cumulative_spend: Amount,
    /// Seconds since the customer's first submission.
    pub account_age_secs: u64,
    pub promo_code: Option<String>,
    /// Provider whose cluster ran the job.
    pub provider: Option<Address>,
}

/// A discount that reduced the charge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppliedDiscount {
    pub name: String,
    pub kind: DiscountKind,
    pub multiplier: Decimal,
    /// Amount removed by this discount, before truncation.
    pub reduction: Decimal,
}

/// Whether `rule` activates for this usage and context.
pub fn is_eligible(rule: &DiscountRule, ctx: &DiscountContext, usage: &UsageMetrics) -> bool {
    match rule.kind {
        DiscountKind::Volume => ctx.cumulative_spend >= rule.threshold,
        DiscountKind::Loyalty => ctx.account_age_secs >= rule.threshold,
        DiscountKind::Promotional => match (&rule.code, &ctx.promo_code) {
            (Some(code), Some(presented)) => code == presented,
            _ => false,
        },
        DiscountKind::Bundle => usage.distinct_kinds() as u64 >= rule.threshold,
        DiscountKind::Partner => match (&rule.partner, &ctx.provider) {
            (Some(partner), Some(provider)) => partner == provider,
            _ => false,
        },
    }
}

/// Eligible rules in registration order.
pub fn eligible_discounts<'a>(
    rules: &'a [DiscountRule],
    ctx: &DiscountContext,
    usage: &UsageMetrics,
) -> Vec<&'a DiscountRule> {
    rules
        .iter()
        .filter(|rule| is_eligible(rule, ctx, usage))
        .collect()
}
