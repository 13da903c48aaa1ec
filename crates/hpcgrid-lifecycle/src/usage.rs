//! Usage derivation for jobs whose provider never reported usage.

use hpc_core::UsageMetrics;
use hpcgrid_state::HPCJob;

/// Usage implied by the job's allocation over its run time up to
/// `end_time`, capped at the duration ceiling.
pub fn derive_usage(job: &HPCJob, end_time: u64) -> UsageMetrics {
    let elapsed = job.elapsed_run_secs(end_time).min(job.max_duration_secs);
    let mut usage = UsageMetrics {
        wall_clock_secs: elapsed,
        node_secs: u64::from(job.nodes).saturating_mul(elapsed),
        ..Default::default()
    };
    let gpu_secs = u64::from(job.gpus).saturating_mul(elapsed);
    if gpu_secs > 0 {
        usage
            .gpu_secs
            .insert(job.gpu_model.clone().unwrap_or_default(), gpu_secs);
    }
    usage
}

/// Reported cumulative usage if any was reported, else derived usage.
pub fn effective_usage(job: &HPCJob, end_time: u64) -> UsageMetrics {
    if job.usage_reported {
        job.usage.clone()
    } else {
        derive_usage(job, end_time)
    }
}

#[cfg(test)]
mod tests {
    use hpc_core::{Coin, ResourceKind};
    use hpcgrid_state::{JobState, SettlementStatus};

    use super::*;

    fn running_job(nodes: u32, gpus: u32, started: Option<u64>) -> HPCJob {
        HPCJob {
            id: "job-000001".to_string(),
            customer: "customer1".to_string(),
            template_id: None,
            resource_type: ResourceKind::Gpu,
            nodes,
            gpus,
            gpu_model: Some("a100".to_string()),
            max_duration_secs: 1_800,
            budget: Coin::new(1_000, "uve"),
            region: "us-east".to_string(),
            promo_code: None,
            state: JobState::Running,
            active_decision_id: None,
            cluster_id: None,
            offering_id: None,
            provider: None,
            escrow_id: "job-000001".to_string(),
            usage: UsageMetrics::default(),
            usage_reported: false,
            created_height: 1,
            created_time: 0,
            queued_time: None,
            started_time: started,
            finished_time: None,
            updated_height: 1,
            history: Vec::new(),
            settlement: SettlementStatus::Unsettled,
        }
    }

    #[test]
    fn derived_usage_is_allocation_times_elapsed() {
        let job = running_job(2, 4, Some(1_000));
        let usage = derive_usage(&job, 1_600);
        assert_eq!(usage.wall_clock_secs, 600);
        assert_eq!(usage.node_secs, 1_200);
        assert_eq!(usage.gpu_secs.get("a100"), Some(&2_400));
    }

    #[test]
    fn derived_usage_caps_at_max_duration() {
        let job = running_job(1, 0, Some(1_000));
        let usage = derive_usage(&job, 9_999);
        assert_eq!(usage.wall_clock_secs, 1_800);
        assert!(usage.gpu_secs.is_empty());
    }

    #[test]
    fn never_started_job_has_no_usage() {
        let job = running_job(4, 4, None);
        assert!(derive_usage(&job, 5_000).is_zero());
    }

    #[test]
    fn reported_usage_wins() {
        let mut job = running_job(4, 0, Some(0));
        job.usage = UsageMetrics {
            cpu_core_secs: 42,
            ..Default::default()
        };
        job.usage_reported = true;
        assert_eq!(effective_usage(&job, 100).cpu_core_secs, 42);
    }
}
