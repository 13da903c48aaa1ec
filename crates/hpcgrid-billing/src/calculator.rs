//! Charge computation.

use std::collections::BTreeMap;

use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde::{Deserialize, Serialize};
use tracing::debug;

use hpc_core::{
    Amount, BYTES_PER_GB, HPCBillingRules, ResourceKind, ResourceRates, SECS_PER_HOUR,
    UsageMetrics,
};

use crate::discount::{AppliedDiscount, DiscountContext, eligible_discounts};
use crate::error::{BillingError, BillingResult};

/// Per-charge inputs beyond the usage and the rules.
#[derive(Debug, Clone, Default)]
pub struct ChargeContext {
    /// Rates to use instead of `rules.rates` (e.g. an offering's price).
    pub rates: Option<ResourceRates>,
    pub discounts: DiscountContext,
    /// Budget ceiling; the charge never exceeds it before the floor.
    pub cap: Option<Amount>,
}

/// One priced resource line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChargeLine {
    pub kind: ResourceKind,
    pub gpu_model: Option<String>,
    /// Reported quantity: unit-seconds, or bytes for network.
    pub quantity: u64,
    /// Quantity after granularity rounding.
    pub billed_quantity: u64,
    pub rate: Decimal,
    pub multiplier: Decimal,
    pub amount: Decimal,
}

/// Itemized result of [`compute_charge`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChargeBreakdown {
    pub lines: Vec<ChargeLine>,
    pub subtotal: Decimal,
    pub discounts: Vec<AppliedDiscount>,
    pub discounted: Decimal,
    /// Subtotal truncated to whole tokens.
    pub gross: Amount,
    pub capped: bool,
    pub minimum_applied: bool,
    /// Final charge.
    pub total: Amount,
}

/// Charge for `usage` under `rules` with no discounts context and no cap.
pub fn compute_charge(usage: &UsageMetrics, rules: &HPCBillingRules) -> BillingResult<ChargeBreakdown> {
    compute_charge_with(usage, rules, &ChargeContext::default())
}

/// Charge for `usage` under `rules`, with rate override, discount facts and cap.
pub fn compute_charge_with(
    usage: &UsageMetrics,
    rules: &HPCBillingRules,
    ctx: &ChargeContext,
) -> BillingResult<ChargeBreakdown> {
    let rates = ctx.rates.as_ref().unwrap_or(&rules.rates);
    let granularity = rules.granularity_secs.max(1);

    let mut lines = Vec::new();
    let timed = [
        (ResourceKind::CpuCore, usage.cpu_core_secs, rates.cpu_core_hour),
        (ResourceKind::MemoryGb, usage.memory_gb_secs, rates.memory_gb_hour),
        (ResourceKind::StorageGb, usage.storage_gb_secs, rates.storage_gb_hour),
        (ResourceKind::Node, usage.node_secs, rates.node_hour),
    ];
    for (kind, quantity, rate) in timed {
        if quantity == 0 {
            continue;
        }
        lines.push(timed_line(kind, None, quantity, rate, Decimal::ONE, granularity)?);
    }
    for (model, quantity) in &usage.gpu_secs {
        if *quantity == 0 {
            continue;
        }
        let multiplier = gpu_multiplier(&rules.gpu_model_multipliers, model);
        let gpu_model = (!model.is_empty()).then(|| model.clone());
        lines.push(timed_line(
            ResourceKind::Gpu,
            gpu_model,
            *quantity,
            rates.gpu_hour,
            multiplier,
            granularity,
        )?);
    }
    if usage.network_bytes > 0 {
        lines.push(network_line(usage.network_bytes, rates.network_gb)?);
    }

    let mut subtotal = Decimal::ZERO;
    for line in &lines {
        subtotal = subtotal
            .checked_add(line.amount)
            .ok_or(BillingError::Overflow("subtotal"))?;
    }

    let mut discounted = subtotal;
    let mut applied = Vec::new();
    for rule in eligible_discounts(&rules.discounts, &ctx.discounts, usage) {
        let next = discounted
            .checked_mul(rule.multiplier)
            .ok_or(BillingError::Overflow("discount"))?;
        applied.push(AppliedDiscount {
            name: rule.name.clone(),
            kind: rule.kind,
            multiplier: rule.multiplier,
            reduction: discounted - next,
        });
        discounted = next;
    }

    let gross = to_amount(subtotal)?;
    let mut total = to_amount(discounted)?;
    let mut capped = false;
    if let Some(cap) = ctx.cap {
        if total > cap {
            total = cap;
            capped = true;
        }
    }
    let minimum_applied = total < rules.minimum_charge;
    if minimum_applied {
        total = rules.minimum_charge;
    }

    debug!(gross, total, discounts = applied.len(), capped, minimum_applied, "charge computed");

    Ok(ChargeBreakdown {
        lines,
        subtotal,
        discounts: applied,
        discounted,
        gross,
        capped,
        minimum_applied,
        total,
    })
}

/// Estimated charge for holding an allocation for `duration_secs`.
pub fn estimate_allocation_charge(
    nodes: u32,
    gpus: u32,
    gpu_model: Option<&str>,
    duration_secs: u64,
    rates: &ResourceRates,
    rules: &HPCBillingRules,
) -> BillingResult<Amount> {
    let mut usage = UsageMetrics {
        wall_clock_secs: duration_secs,
        node_secs: u64::from(nodes).saturating_mul(duration_secs),
        ..Default::default()
    };
    if gpus > 0 {
        usage.gpu_secs.insert(
            gpu_model.unwrap_or_default().to_string(),
            u64::from(gpus).saturating_mul(duration_secs),
        );
    }
    let ctx = ChargeContext {
        rates: Some(rates.clone()),
        ..Default::default()
    };
    Ok(compute_charge_with(&usage, rules, &ctx)?.total)
}

/// `base` with the rate for `kind` replaced by an offering's price.
pub fn offering_rates(base: &ResourceRates, kind: ResourceKind, price: Decimal) -> ResourceRates {
    let mut rates = base.clone();
    match kind {
        ResourceKind::CpuCore => rates.cpu_core_hour = price,
        ResourceKind::MemoryGb => rates.memory_gb_hour = price,
        ResourceKind::Gpu => rates.gpu_hour = price,
        ResourceKind::StorageGb => rates.storage_gb_hour = price,
        ResourceKind::NetworkGb => rates.network_gb = price,
        ResourceKind::Node => rates.node_hour = price,
    }
    rates
}

fn gpu_multiplier(multipliers: &BTreeMap<String, Decimal>, model: &str) -> Decimal {
    multipliers.get(model).copied().unwrap_or(Decimal::ONE)
}

fn timed_line(
    kind: ResourceKind,
    gpu_model: Option<String>,
    quantity: u64,
    rate: Decimal,
    multiplier: Decimal,
    granularity: u64,
) -> BillingResult<ChargeLine> {
    if rate.is_sign_negative() {
        return Err(BillingError::NegativeRate(kind.label()));
    }
    let billed_quantity = quantity / granularity * granularity;
    let amount = rate
        .checked_mul(Decimal::from(billed_quantity))
        .and_then(|v| v.checked_mul(multiplier))
        .and_then(|v| v.checked_div(Decimal::from(SECS_PER_HOUR)))
        .ok_or(BillingError::Overflow(kind.label()))?;
    Ok(ChargeLine {
        kind,
        gpu_model,
        quantity,
        billed_quantity,
        rate,
        multiplier,
        amount,
    })
}

fn network_line(bytes: u64, rate: Decimal) -> BillingResult<ChargeLine> {
    if rate.is_sign_negative() {
        return Err(BillingError::NegativeRate("network_gb"));
    }
    let amount = rate
        .checked_mul(Decimal::from(bytes))
        .and_then(|v| v.checked_div(Decimal::from(BYTES_PER_GB)))
        .ok_or(BillingError::Overflow("network_gb"))?;
    Ok(ChargeLine {
        kind: ResourceKind::NetworkGb,
        gpu_model: None,
        quantity: bytes,
        billed_quantity: bytes,
        rate,
        multiplier: Decimal::ONE,
        amount,
    })
}

fn to_amount(value: Decimal) -> BillingResult<Amount> {
    value
        .trunc()
        .to_u64()
        .ok_or(BillingError::Overflow("total"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use hpc_core::{DiscountKind, DiscountRule};
    use rust_decimal_macros::dec;

    fn rules() -> HPCBillingRules {
        HPCBillingRules {
            rates: ResourceRates {
                cpu_core_hour: dec!(10000),
                memory_gb_hour: dec!(1000),
                gpu_hour: dec!(250000),
                storage_gb_hour: dec!(10),
                network_gb: dec!(5000),
                node_hour: dec!(100000),
            },
            gpu_model_multipliers: BTreeMap::new(),
            platform_fee_bps: 250,
            minimum_charge: 0,
            granularity_secs: 60,
            discounts: Vec::new(),
        }
    }

    #[test]
    fn one_cpu_core_hour_with_equal_minimum() {
        let mut rules = rules();
        rules.minimum_charge = 10_000;
        let usage = UsageMetrics {
            cpu_core_secs: 3_600,
            ..Default::default()
        };
        let charge = compute_charge(&usage, &rules).unwrap();
        assert_eq!(charge.total, 10_000);
        assert_eq!(charge.gross, 10_000);
        assert!(!charge.minimum_applied);
    }

    #[test]
    fn minimum_charge_is_a_floor() {
        let mut rules = rules();
        rules.minimum_charge = 10_000;
        let usage = UsageMetrics {
            cpu_core_secs: 60,
            ..Default::default()
        };
        let charge = compute_charge(&usage, &rules).unwrap();
        assert_eq!(charge.gross, 166);
        assert_eq!(charge.total, 10_000);
        assert!(charge.minimum_applied);

        let empty = compute_charge(&UsageMetrics::default(), &rules).unwrap();
        assert_eq!(empty.total, 10_000);
    }

    #[test]
    fn granularity_rounds_each_quantity_down() {
        let rules = rules();
        let usage = UsageMetrics {
            cpu_core_secs: 3_659,
            memory_gb_secs: 59,
            ..Default::default()
        };
        let charge = compute_charge(&usage, &rules).unwrap();
        assert_eq!(charge.lines.len(), 2);
        assert_eq!(charge.lines[0].billed_quantity, 3_600);
        assert_eq!(charge.lines[1].billed_quantity, 0);
        assert_eq!(charge.total, 10_000);
    }

    #[test]
    fn gpu_model_multiplier_and_network() {
        let mut rules = rules();
        rules.gpu_model_multipliers.insert("h100".to_string(), dec!(2));
        let usage = UsageMetrics {
            gpu_secs: BTreeMap::from([("h100".to_string(), 1_800), (String::new(), 1_800)]),
            network_bytes: 2 * BYTES_PER_GB,
            ..Default::default()
        };
        let charge = compute_charge(&usage, &rules).unwrap();
        // generic: 125_000, h100: 250_000, network: 10_000
        assert_eq!(charge.total, 385_000);
        let h100 = charge
            .lines
            .iter()
            .find(|l| l.gpu_model.as_deref() == Some("h100"))
            .unwrap();
        assert_eq!(h100.multiplier, dec!(2));
    }

    #[test]
    fn discounts_stack_multiplicatively_in_order() {
        let mut rules = rules();
        rules.discounts = vec![
            DiscountRule {
                name: "volume".to_string(),
                kind: DiscountKind::Volume,
                threshold: 1_000,
                multiplier: dec!(0.9),
                code: None,
                partner: None,
            },
            DiscountRule {
                name: "launch".to_string(),
                kind: DiscountKind::Promotional,
                threshold: 0,
                multiplier: dec!(0.5),
                code: Some("LAUNCH".to_string()),
                partner: None,
            },
        ];
        let usage = UsageMetrics {
            cpu_core_secs: 3_600,
            ..Default::default()
        };
        let ctx = ChargeContext {
            discounts: DiscountContext {
                cumulative_spend: 1_000,
                promo_code: Some("LAUNCH".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        let charge = compute_charge_with(&usage, &rules, &ctx).unwrap();
        // 10_000 * 0.9 * 0.5, not 10_000 * (1 - 0.1 - 0.5)
        assert_eq!(charge.total, 4_500);
        assert_eq!(charge.discounts.len(), 2);
        assert_eq!(charge.discounts[0].reduction, dec!(1000));
        assert_eq!(charge.discounts[1].reduction, dec!(4500));
    }

    #[test]
    fn cap_applies_before_floor() {
        let mut rules = rules();
        let usage = UsageMetrics {
            node_secs: 3_600,
            ..Default::default()
        };
        let ctx = ChargeContext {
            cap: Some(500),
            ..Default::default()
        };
        let charge = compute_charge_with(&usage, &rules, &ctx).unwrap();
        assert_eq!(charge.total, 500);
        assert!(charge.capped);

        rules.minimum_charge = 800;
        let charge = compute_charge_with(&usage, &rules, &ctx).unwrap();
        assert_eq!(charge.total, 800);
    }

    #[test]
    fn allocation_estimate_uses_offering_price() {
        let rules = rules();
        let rates = offering_rates(&rules.rates, ResourceKind::Node, dec!(12.5));
        // 4 nodes for half an hour at 12.5 per node-hour
        let estimate = estimate_allocation_charge(4, 0, None, 1_800, &rates, &rules).unwrap();
        assert_eq!(estimate, 25);
    }

    #[test]
    fn identical_inputs_give_identical_output() {
        let rules = rules();
        let usage = UsageMetrics {
            cpu_core_secs: 7_321,
            memory_gb_secs: 99_999,
            storage_gb_secs: 12_345,
            network_bytes: 987_654_321,
            ..Default::default()
        };
        let a = compute_charge(&usage, &rules).unwrap();
        let b = compute_charge(&usage, &rules).unwrap();
        assert_eq!(a, b);
    }
}
