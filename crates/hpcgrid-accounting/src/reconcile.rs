//! Reconciliation of provider-reported usage against observed snapshots.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use hpc_core::{BPS_DENOMINATOR, UsageMetrics};
use hpcgrid_state::UsageSnapshot;

/// One metric outside the tolerance band.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricMismatch {
    pub metric: String,
    pub reported: u64,
    pub observed: u64,
    /// `u64::MAX` when nothing was observed but something was reported.
    pub deviation_bps: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciliationReport {
    pub tolerance_bps: u32,
    pub mismatches: Vec<MetricMismatch>,
}

impl ReconciliationReport {
    pub fn within_tolerance(&self) -> bool {
        self.mismatches.is_empty()
    }

    /// Short human-readable summary used as a dispute reason.
    pub fn summary(&self) -> String {
        let parts: Vec<String> = self
            .mismatches
            .iter()
            .map(|m| format!("{} reported {} observed {}", m.metric, m.reported, m.observed))
            .collect();
        format!("usage outside {} bps tolerance: {}", self.tolerance_bps, parts.join(", "))
    }
}

fn deviation_bps(reported: u64, observed: u64) -> u64 {
    if observed == 0 {
        return if reported == 0 { 0 } else { u64::MAX };
    }
    let diff = u128::from(reported.abs_diff(observed));
    let bps = diff * u128::from(BPS_DENOMINATOR) / u128::from(observed);
    u64::try_from(bps).unwrap_or(u64::MAX)
}

/// Compare reported usage against observed usage, metric by metric.
pub fn reconcile(
    reported: &UsageMetrics,
    observed: &UsageMetrics,
    tolerance_bps: u32,
) -> ReconciliationReport {
    let observed_values = observed.metric_values();
    let mut mismatches = Vec::new();
    for (metric, reported_value) in reported.metric_values() {
        let observed_value = observed_values.get(metric).copied().unwrap_or(0);
        let deviation = deviation_bps(reported_value, observed_value);
        if deviation > u64::from(tolerance_bps) {
            mismatches.push(MetricMismatch {
                metric: metric.to_string(),
                reported: reported_value,
                observed: observed_value,
                deviation_bps: deviation,
            });
        }
    }

    if mismatches.is_empty() {
        debug!(tolerance_bps, "usage reconciled");
    } else {
        warn!(
            tolerance_bps,
            mismatched = mismatches.len(),
            "usage outside tolerance"
        );
    }
    ReconciliationReport {
        tolerance_bps,
        mismatches,
    }
}

/// Sum of the snapshots that tile `[start, end]` exactly.
///
/// `None` unless the snapshots inside the period cover it end to end
/// with no gap or overlap. Reported usage for the whole period cannot be
/// compared against observations for only part of it.
pub fn observed_for_period(
    snapshots: &[UsageSnapshot],
    start: u64,
    end: u64,
) -> Option<UsageMetrics> {
    let mut inside: Vec<&UsageSnapshot> = snapshots
        .iter()
        .filter(|s| s.period_start >= start && s.period_end <= end)
        .collect();
    inside.sort_by_key(|s| (s.period_start, s.period_end));

    let mut cursor = start;
    let mut total = UsageMetrics::default();
    for snap in &inside {
        if snap.period_start != cursor {
            debug!(start, end, cursor, next = snap.period_start, "snapshots do not tile period");
            return None;
        }
        add_into(&mut total, &snap.usage);
        cursor = snap.period_end;
    }
    if inside.is_empty() || cursor != end {
        return None;
    }
    Some(total)
}

fn add_into(acc: &mut UsageMetrics, usage: &UsageMetrics) {
    acc.wall_clock_secs = acc.wall_clock_secs.saturating_add(usage.wall_clock_secs);
    acc.cpu_core_secs = acc.cpu_core_secs.saturating_add(usage.cpu_core_secs);
    acc.memory_gb_secs = acc.memory_gb_secs.saturating_add(usage.memory_gb_secs);
    acc.storage_gb_secs = acc.storage_gb_secs.saturating_add(usage.storage_gb_secs);
    acc.network_bytes = acc.network_bytes.saturating_add(usage.network_bytes);
    acc.node_secs = acc.node_secs.saturating_add(usage.node_secs);
    for (model, secs) in &usage.gpu_secs {
        let entry = acc.gpu_secs.entry(model.clone()).or_insert(0);
        *entry = entry.saturating_add(*secs);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn usage(node_secs: u64, cpu_core_secs: u64) -> UsageMetrics {
        UsageMetrics {
            node_secs,
            cpu_core_secs,
            ..Default::default()
        }
    }

    fn snapshot(start: u64, end: u64, node_secs: u64) -> UsageSnapshot {
        UsageSnapshot {
            job_id: "job-000001".to_string(),
            period_start: start,
            period_end: end,
            usage: usage(node_secs, 0),
            source: "node-agent".to_string(),
            recorded_height: 1,
        }
    }

    #[test]
    fn within_tolerance_passes() {
        // 4% over with a 5% band
        let report = reconcile(&usage(10_400, 0), &usage(10_000, 0), 500);
        assert!(report.within_tolerance());
    }

    #[test]
    fn outside_tolerance_lists_metric() {
        let report = reconcile(&usage(12_000, 5), &usage(10_000, 5), 500);
        assert_eq!(report.mismatches.len(), 1);
        let m = &report.mismatches[0];
        assert_eq!(m.metric, "node_secs");
        assert_eq!(m.deviation_bps, 2_000);
        assert!(report.summary().contains("node_secs reported 12000 observed 10000"));
    }

    #[test]
    fn under_reporting_is_also_a_mismatch() {
        let report = reconcile(&usage(8_000, 0), &usage(10_000, 0), 500);
        assert_eq!(report.mismatches[0].deviation_bps, 2_000);
    }

    #[test]
    fn reported_against_nothing_observed() {
        let report = reconcile(&usage(0, 30), &usage(0, 0), 10_000);
        assert_eq!(report.mismatches.len(), 1);
        assert_eq!(report.mismatches[0].metric, "cpu_core_secs");
        assert_eq!(report.mismatches[0].deviation_bps, u64::MAX);
    }

    #[test]
    fn observed_sums_snapshots_inside_period() {
        let snaps = vec![
            snapshot(0, 600, 600),
            snapshot(600, 1_200, 500),
            snapshot(1_200, 1_800, 600),
        ];
        let observed = observed_for_period(&snaps, 0, 1_200).unwrap();
        assert_eq!(observed.node_secs, 1_100);
        assert!(observed_for_period(&snaps, 2_000, 3_000).is_none());
    }

    #[test]
    fn partial_coverage_is_not_observed() {
        let snaps = vec![snapshot(0, 600, 600), snapshot(1_200, 1_800, 600)];
        // tail missing
        assert!(observed_for_period(&snaps[..1], 0, 1_800).is_none());
        // gap in the middle
        assert!(observed_for_period(&snaps, 0, 1_800).is_none());
        // head missing
        assert!(observed_for_period(&snaps[1..], 600, 1_800).is_none());
        assert_eq!(
            observed_for_period(&snaps[1..], 1_200, 1_800).map(|u| u.node_secs),
            Some(600)
        );
    }

    #[test]
    fn overlapping_snapshots_are_not_observed() {
        let snaps = vec![snapshot(0, 900, 900), snapshot(600, 1_200, 600)];
        assert!(observed_for_period(&snaps, 0, 1_200).is_none());
    }
}
