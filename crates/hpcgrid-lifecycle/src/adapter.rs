//! Scheduler status normalization.
//!
//! Scheduler adapters (SLURM, MOAB, Open OnDemand) report status strings
//! in their own vocabulary. Each kind implements [`StatusNormalizer`]; the
//! engine only ever sees the normalized [`JobState`].

use serde::{Deserialize, Serialize};

use hpcgrid_state::JobState;

use crate::error::{LifecycleError, LifecycleResult};

/// Maps a scheduler's raw status string to a lifecycle state.
pub trait StatusNormalizer {
    fn name(&self) -> &'static str;

    /// `None` for statuses that carry no lifecycle meaning.
    fn map_status(&self, raw: &str) -> Option<JobState>;

    fn normalize(&self, raw: &str) -> LifecycleResult<JobState> {
        self.map_status(raw.trim()).ok_or_else(|| LifecycleError::UnknownStatus {
            scheduler: self.name(),
            status: raw.to_string(),
        })
    }
}

/// SLURM `squeue`/`sacct` states, long or short form.
pub struct SlurmStatus;

impl StatusNormalizer for SlurmStatus {
    fn name(&self) -> &'static str {
        "slurm"
    }

    fn map_status(&self, raw: &str) -> Option<JobState> {
        // sacct appends the cancelling user: "CANCELLED by 1000"
        let state = raw.split_whitespace().next().unwrap_or_default();
        match state.to_ascii_uppercase().as_str() {
            "PENDING" | "PD" | "REQUEUED" | "RQ" => Some(JobState::Queued),
            "CONFIGURING" | "CF" => Some(JobState::Starting),
            "RUNNING" | "R" | "COMPLETING" | "CG" => Some(JobState::Running),
            "SUSPENDED" | "S" | "STOPPED" | "ST" => Some(JobState::Suspended),
            "COMPLETED" | "CD" => Some(JobState::Completed),
            "FAILED" | "F" | "NODE_FAIL" | "NF" | "BOOT_FAIL" | "BF" | "OUT_OF_MEMORY" | "OOM"
            | "PREEMPTED" | "PR" => Some(JobState::Failed),
            "CANCELLED" | "CA" => Some(JobState::Cancelled),
            "TIMEOUT" | "TO" | "DEADLINE" | "DL" => Some(JobState::Timeout),
            _ => None,
        }
    }
}

/// MOAB `checkjob`/`showq` states.
pub struct MoabStatus;

impl StatusNormalizer for MoabStatus {
    fn name(&self) -> &'static str {
        "moab"
    }

    fn map_status(&self, raw: &str) -> Option<JobState> {
        match raw.to_ascii_lowercase().as_str() {
            "idle" | "deferred" | "hold" | "batchhold" | "userhold" | "systemhold" | "staged" => {
                Some(JobState::Queued)
            }
            "starting" => Some(JobState::Starting),
            "running" => Some(JobState::Running),
            "suspended" => Some(JobState::Suspended),
            "completed" => Some(JobState::Completed),
            "vacated" => Some(JobState::Failed),
            "removed" | "canceling" => Some(JobState::Cancelled),
            _ => None,
        }
    }
}

/// Open OnDemand adapter states.
pub struct OpenOnDemandStatus;

impl StatusNormalizer for OpenOnDemandStatus {
    fn name(&self) -> &'static str {
        "open_on_demand"
    }

    fn map_status(&self, raw: &str) -> Option<JobState> {
        match raw.to_ascii_lowercase().as_str() {
            "queued" | "queued_held" => Some(JobState::Queued),
            "running" => Some(JobState::Running),
            "suspended" => Some(JobState::Suspended),
            "completed" => Some(JobState::Completed),
            _ => None,
        }
    }
}

/// Scheduler families a provider may report through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerKind {
    Slurm,
    Moab,
    OpenOnDemand,
}

impl SchedulerKind {
    pub fn normalizer(&self) -> &'static dyn StatusNormalizer {
        match self {
            SchedulerKind::Slurm => &SlurmStatus,
            SchedulerKind::Moab => &MoabStatus,
            SchedulerKind::OpenOnDemand => &OpenOnDemandStatus,
        }
    }

    pub fn normalize(&self, raw: &str) -> LifecycleResult<JobState> {
        self.normalizer().normalize(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slurm_long_and_short_forms() {
        let slurm = SchedulerKind::Slurm;
        assert_eq!(slurm.normalize("PENDING").unwrap(), JobState::Queued);
        assert_eq!(slurm.normalize("R").unwrap(), JobState::Running);
        assert_eq!(slurm.normalize("CANCELLED by 1000").unwrap(), JobState::Cancelled);
        assert_eq!(slurm.normalize("node_fail").unwrap(), JobState::Failed);
        assert_eq!(slurm.normalize("TO").unwrap(), JobState::Timeout);
    }

    #[test]
    fn moab_and_ood() {
        assert_eq!(SchedulerKind::Moab.normalize("Idle").unwrap(), JobState::Queued);
        assert_eq!(SchedulerKind::Moab.normalize("Removed").unwrap(), JobState::Cancelled);
        assert_eq!(
            SchedulerKind::OpenOnDemand.normalize("queued_held").unwrap(),
            JobState::Queued
        );
        assert_eq!(
            SchedulerKind::OpenOnDemand.normalize(" completed ").unwrap(),
            JobState::Completed
        );
    }

    #[test]
    fn unknown_status_is_an_error() {
        let err = SchedulerKind::OpenOnDemand.normalize("undetermined").unwrap_err();
        assert_eq!(
            err,
            LifecycleError::UnknownStatus {
                scheduler: "open_on_demand",
                status: "undetermined".to_string(),
            }
        );
    }
}
