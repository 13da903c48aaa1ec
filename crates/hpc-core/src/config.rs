//! Engine parameters and `hpcgrid.toml` parsing.
//!
//! `EngineParams` is the single versioned configuration every pure
//! function in the engine receives explicitly. It is replaced as a whole
//! through the governance-gated params update; nothing mutates it in place.

use std::collections::BTreeMap;
use std::path::Path;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{Address, Amount, BPS_DENOMINATOR};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParamsError {
    #[error("invalid parameter {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ParamsError {
    ParamsError::Invalid {
        field,
        reason: reason.into(),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineParams {
    /// Governance account allowed to replace these params.
    pub authority: Address,
    /// Settlement denomination.
    pub denom: String,
    /// Principals allowed to review and resolve disputes.
    #[serde(default)]
    pub moderators: Vec<Address>,
    pub scheduling: SchedulingParams,
    pub routing: RoutingParams,
    pub billing: HPCBillingRules,
    pub reconciliation: ReconciliationParams,
    pub settlement: SettlementParams,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulingParams {
    pub decision_max_age_blocks: u64,
    pub decision_max_age_secs: u64,
    pub weights: ScoringWeights,
    /// Latency at or above which the proximity score is zero.
    pub max_latency_ms: u32,
}

/// Weights for the scoring components, in basis points.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScoringWeights {
    pub proximity_bps: u32,
    pub price_bps: u32,
    pub reliability_bps: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnforcementMode {
    Strict,
    Permissive,
    AuditOnly,
}

/// Which decision-age bound decides staleness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StalenessAuthority {
    /// Block age decides; second age is advisory only.
    Blocks,
    /// Exceeding either bound is stale.
    Either,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingParams {
    pub mode: EnforcementMode,
    /// Strict mode re-schedules stale decisions instead of rejecting.
    pub auto_refresh_stale: bool,
    pub staleness_authority: StalenessAuthority,
    /// Cumulative per-provider violations that raise the alert signal.
    pub violation_alert_threshold: u64,
}

/// Per-unit-hour rates, in the settlement denomination.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceRates {
    pub cpu_core_hour: Decimal,
    pub memory_gb_hour: Decimal,
    pub gpu_hour: Decimal,
    pub storage_gb_hour: Decimal,
    /// Per GB transferred (not time based).
    pub network_gb: Decimal,
    pub node_hour: Decimal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscountKind {
    /// Threshold: customer cumulative settled spend.
    Volume,
    /// Threshold: customer account age in seconds.
    Loyalty,
    /// Active when the job carries the rule's code.
    Promotional,
    /// Threshold: number of distinct resource kinds used.
    Bundle,
    /// Active when the job runs on the rule's partner provider.
    Partner,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscountRule {
    pub name: String,
    pub kind: DiscountKind,
    #[serde(default)]
    pub threshold: u64,
    /// Price multiplier in (0, 1], e.g. `"0.95"` for 5% off.
    pub multiplier: Decimal,
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub partner: Option<Address>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HPCBillingRules {
    pub rates: ResourceRates,
    #[serde(default)]
    pub gpu_model_multipliers: BTreeMap<String, Decimal>,
    pub platform_fee_bps: u32,
    pub minimum_charge: Amount,
    pub granularity_secs: u64,
    /// Applied in order, multiplicatively.
    #[serde(default)]
    pub discounts: Vec<DiscountRule>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconciliationParams {
    /// Allowed relative difference between reported and observed usage.
    pub tolerance_bps: u32,
    /// Upper bound for partial-adjustment corrections.
    pub max_correction_bps: u32,
    /// Address recorded as the raiser of automatic disputes.
    pub system_address: Address,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettlementParams {
    /// Share of the provider reward paid to node operators.
    pub node_operator_split_bps: u32,
    pub treasury_address: Address,
    pub max_settlement_retries: u32,
}

impl Default for EngineParams {
    fn default() -> Self {
        Self {
            authority: "gov".to_string(),
            denom: "uve".to_string(),
            moderators: Vec::new(),
            scheduling: SchedulingParams::default(),
            routing: RoutingParams::default(),
            billing: HPCBillingRules::default(),
            reconciliation: ReconciliationParams::default(),
            settlement: SettlementParams::default(),
        }
    }
}

impl Default for SchedulingParams {
    fn default() -> Self {
        Self {
            decision_max_age_blocks: 100,
            decision_max_age_secs: 600,
            weights: ScoringWeights::default(),
            max_latency_ms: 500,
        }
    }
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            proximity_bps: 4_000,
            price_bps: 3_500,
            reliability_bps: 2_500,
        }
    }
}

impl Default for RoutingParams {
    fn default() -> Self {
        Self {
            mode: EnforcementMode::Strict,
            auto_refresh_stale: false,
            staleness_authority: StalenessAuthority::Blocks,
            violation_alert_threshold: 10,
        }
    }
}

impl Default for ResourceRates {
    fn default() -> Self {
        Self {
            cpu_core_hour: Decimal::from(10_000),
            memory_gb_hour: Decimal::from(1_000),
            gpu_hour: Decimal::from(250_000),
            storage_gb_hour: Decimal::from(10),
            network_gb: Decimal::from(5_000),
            node_hour: Decimal::from(100_000),
        }
    }
}

impl Default for HPCBillingRules {
    fn default() -> Self {
        Self {
            rates: ResourceRates::default(),
            gpu_model_multipliers: BTreeMap::new(),
            platform_fee_bps: 250,
            minimum_charge: 0,
            granularity_secs: 60,
            discounts: Vec::new(),
        }
    }
}

impl Default for ReconciliationParams {
    fn default() -> Self {
        Self {
            tolerance_bps: 500,
            max_correction_bps: 5_000,
            system_address: "hpc-module".to_string(),
        }
    }
}

impl Default for SettlementParams {
    fn default() -> Self {
        Self {
            node_operator_split_bps: 0,
            treasury_address: "treasury".to_string(),
            max_settlement_retries: 10,
        }
    }
}

fn check_bps(field: &'static str, bps: u32) -> Result<(), ParamsError> {
    if u64::from(bps) > BPS_DENOMINATOR {
        return Err(invalid(field, format!("{bps} exceeds {BPS_DENOMINATOR} bps")));
    }
    Ok(())
}

fn check_rate(field: &'static str, rate: Decimal) -> Result<(), ParamsError> {
    if rate.is_sign_negative() {
        return Err(invalid(field, "rate must not be negative"));
    }
    Ok(())
}

impl EngineParams {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let params: EngineParams = toml::from_str(&content)?;
        params.validate()?;
        Ok(params)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn is_moderator(&self, address: &str) -> bool {
        self.moderators.iter().any(|m| m == address)
    }

    /// Validate the whole parameter set. Called before any params epoch
    /// is stored.
    pub fn validate(&self) -> Result<(), ParamsError> {
        if self.authority.is_empty() {
            return Err(invalid("authority", "must not be empty"));
        }
        if self.denom.is_empty() {
            return Err(invalid("denom", "must not be empty"));
        }

        let s = &self.scheduling;
        if s.decision_max_age_blocks == 0 {
            return Err(invalid("scheduling.decision_max_age_blocks", "must be positive"));
        }
        if s.decision_max_age_secs == 0 {
            return Err(invalid("scheduling.decision_max_age_secs", "must be positive"));
        }
        if s.max_latency_ms == 0 {
            return Err(invalid("scheduling.max_latency_ms", "must be positive"));
        }
        let w = &s.weights;
        let total = u64::from(w.proximity_bps) + u64::from(w.price_bps) + u64::from(w.reliability_bps);
        if total == 0 || total > BPS_DENOMINATOR {
            return Err(invalid(
                "scheduling.weights",
                format!("weights must sum to 1..={BPS_DENOMINATOR} bps, got {total}"),
            ));
        }

        if self.routing.violation_alert_threshold == 0 {
            return Err(invalid("routing.violation_alert_threshold", "must be positive"));
        }

        let b = &self.billing;
        check_rate("billing.rates.cpu_core_hour", b.rates.cpu_core_hour)?;
        check_rate("billing.rates.memory_gb_hour", b.rates.memory_gb_hour)?;
        check_rate("billing.rates.gpu_hour", b.rates.gpu_hour)?;
        check_rate("billing.rates.storage_gb_hour", b.rates.storage_gb_hour)?;
        check_rate("billing.rates.network_gb", b.rates.network_gb)?;
        check_rate("billing.rates.node_hour", b.rates.node_hour)?;
        for (model, multiplier) in &b.gpu_model_multipliers {
            if *multiplier <= Decimal::ZERO {
                return Err(invalid(
                    "billing.gpu_model_multipliers",
                    format!("multiplier for {model} must be positive"),
                ));
            }
        }
        check_bps("billing.platform_fee_bps", b.platform_fee_bps)?;
        if b.granularity_secs == 0 {
            return Err(invalid("billing.granularity_secs", "must be positive"));
        }
        for rule in &b.discounts {
            if rule.multiplier <= Decimal::ZERO || rule.multiplier > Decimal::ONE {
                return Err(invalid(
                    "billing.discounts",
                    format!("{}: multiplier must be in (0, 1]", rule.name),
                ));
            }
            match rule.kind {
                DiscountKind::Promotional if rule.code.is_none() => {
                    return Err(invalid(
                        "billing.discounts",
                        format!("{}: promotional discount needs a code", rule.name),
                    ));
                }
                DiscountKind::Partner if rule.partner.is_none() => {
                    return Err(invalid(
                        "billing.discounts",
                        format!("{}: partner discount needs a partner", rule.name),
                    ));
                }
                _ => {}
            }
        }

        check_bps("reconciliation.tolerance_bps", self.reconciliation.tolerance_bps)?;
        check_bps(
            "reconciliation.max_correction_bps",
            self.reconciliation.max_correction_bps,
        )?;
        check_bps(
            "settlement.node_operator_split_bps",
            self.settlement.node_operator_split_bps,
        )?;
        if self.settlement.treasury_address.is_empty() {
            return Err(invalid("settlement.treasury_address", "must not be empty"));
        }
        Ok(())
    }
}
