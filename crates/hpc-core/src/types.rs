//! Shared types used across HPCGrid crates.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Bech32-style account address. Opaque to the engine.
pub type Address = String;

/// Unique identifier for a registered cluster.
pub type ClusterId = String;

/// Unique identifier for an offering (`{cluster_id}/{name}`).
pub type OfferingId = String;

/// Unique identifier for a submitted job.
pub type JobId = String;

/// Unique identifier for a scheduling decision.
pub type DecisionId = String;

/// Identifier for an append-only record (`{job_id}:{sequence}`).
pub type RecordId = String;

/// Unique identifier for a dispute.
pub type DisputeId = String;

/// Identifier of a governance-approved workload template.
pub type TemplateId = String;

/// Token amount in the smallest denomination unit.
pub type Amount = u64;

/// Basis points denominator (100% = 10_000 bps).
pub const BPS_DENOMINATOR: u64 = 10_000;

/// Seconds per billable hour.
pub const SECS_PER_HOUR: u64 = 3_600;

/// Bytes per billable network gigabyte.
pub const BYTES_PER_GB: u64 = 1_000_000_000;

/// Ledger position at which a transition is applied.
///
/// Every transition receives the height and the ledger-replicated block
/// time of the event it belongs to. The engine never reads a wall clock.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockContext {
    pub height: u64,
    /// Block time, unix seconds as agreed by the host ledger.
    pub time: u64,
}

impl BlockContext {
    pub fn new(height: u64, time: u64) -> Self {
        Self { height, time }
    }

    /// Blocks elapsed since `height` (zero if `height` is in the future).
    pub fn blocks_since(&self, height: u64) -> u64 {
        self.height.saturating_sub(height)
    }

    /// Seconds elapsed since `time` (zero if `time` is in the future).
    pub fn secs_since(&self, time: u64) -> u64 {
        self.time.saturating_sub(time)
    }
}

/// Billable resource classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    CpuCore,
    MemoryGb,
    Gpu,
    StorageGb,
    NetworkGb,
    Node,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 6] = [
        ResourceKind::CpuCore,
        ResourceKind::MemoryGb,
        ResourceKind::Gpu,
        ResourceKind::StorageGb,
        ResourceKind::NetworkGb,
        ResourceKind::Node,
    ];

    /// Whether offerings of this kind can be targeted by job placement.
    pub fn is_schedulable(&self) -> bool {
        matches!(self, ResourceKind::Node | ResourceKind::Gpu)
    }

    pub fn label(&self) -> &'static str {
        match self {
            ResourceKind::CpuCore => "cpu_core",
            ResourceKind::MemoryGb => "memory_gb",
            ResourceKind::Gpu => "gpu",
            ResourceKind::StorageGb => "storage_gb",
            ResourceKind::NetworkGb => "network_gb",
            ResourceKind::Node => "node",
        }
    }
}

/// Resource usage for a job over some period.
///
/// Time-based quantities are unit-seconds (e.g. 2 cores for 60s = 120).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UsageMetrics {
    pub wall_clock_secs: u64,
    pub cpu_core_secs: u64,
    pub memory_gb_secs: u64,
    /// GPU-seconds keyed by GPU model. The empty key is a generic GPU.
    pub gpu_secs: BTreeMap<String, u64>,
    pub storage_gb_secs: u64,
    pub network_bytes: u64,
    pub node_secs: u64,
}

impl UsageMetrics {
    pub fn is_zero(&self) -> bool {
        self.metric_values().values().all(|v| *v == 0)
    }

    pub fn total_gpu_secs(&self) -> u64 {
        self.gpu_secs.values().fold(0u64, |acc, v| acc.saturating_add(*v))
    }

    /// Number of distinct resource kinds with non-zero usage.
    pub fn distinct_kinds(&self) -> usize {
        [
            self.cpu_core_secs,
            self.memory_gb_secs,
            self.total_gpu_secs(),
            self.storage_gb_secs,
            self.network_bytes,
            self.node_secs,
        ]
        .iter()
        .filter(|v| **v > 0)
        .count()
    }

    /// Flat metric name → value view, in stable order.
    pub fn metric_values(&self) -> BTreeMap<&'static str, u64> {
        BTreeMap::from([
            ("wall_clock_secs", self.wall_clock_secs),
            ("cpu_core_secs", self.cpu_core_secs),
            ("memory_gb_secs", self.memory_gb_secs),
            ("gpu_secs", self.total_gpu_secs()),
            ("storage_gb_secs", self.storage_gb_secs),
            ("network_bytes", self.network_bytes),
            ("node_secs", self.node_secs),
        ])
    }

    /// Component-wise `self - earlier`, floored at zero.
    pub fn saturating_sub(&self, earlier: &UsageMetrics) -> UsageMetrics {
        let mut gpu_secs = BTreeMap::new();
        for (model, secs) in &self.gpu_secs {
            let prev = earlier.gpu_secs.get(model).copied().unwrap_or(0);
            let delta = secs.saturating_sub(prev);
            if delta > 0 {
                gpu_secs.insert(model.clone(), delta);
            }
        }
        UsageMetrics {
            wall_clock_secs: self.wall_clock_secs.saturating_sub(earlier.wall_clock_secs),
            cpu_core_secs: self.cpu_core_secs.saturating_sub(earlier.cpu_core_secs),
            memory_gb_secs: self.memory_gb_secs.saturating_sub(earlier.memory_gb_secs),
            gpu_secs,
            storage_gb_secs: self.storage_gb_secs.saturating_sub(earlier.storage_gb_secs),
            network_bytes: self.network_bytes.saturating_sub(earlier.network_bytes),
            node_secs: self.node_secs.saturating_sub(earlier.node_secs),
        }
    }
}

/// `amount * bps / 10_000`, computed without overflow and rounded down.
pub fn apply_bps(amount: Amount, bps: u32) -> Amount {
    let scaled = u128::from(amount) * u128::from(bps) / u128::from(BPS_DENOMINATOR);
    // bps <= 10_000 keeps the result within the input range.
    u64::try_from(scaled).unwrap_or(Amount::MAX)
}
