//! The job state machine.

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use hpc_core::BlockContext;
use hpcgrid_state::{HPCJob, JobState};

use crate::error::{LifecycleError, LifecycleResult};

/// Result of a requested transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransitionOutcome {
    Applied { from: JobState, to: JobState },
    /// The job was already in the requested state.
    Unchanged,
}

impl TransitionOutcome {
    pub fn entered_terminal(&self) -> bool {
        matches!(self, TransitionOutcome::Applied { to, .. } if to.is_terminal())
    }
}

/// Whether `from → to` is a single legal step.
pub fn is_legal(from: JobState, to: JobState) -> bool {
    use JobState::*;
    match (from, to) {
        (from, Cancelled) => !from.is_terminal(),
        (Pending, Queued) => true,
        (Queued, Starting | Failed) => true,
        (Starting, Running | Failed) => true,
        (Running, Suspended | Completed | Failed | Timeout) => true,
        (Suspended, Running | Failed | Timeout) => true,
        _ => false,
    }
}

/// Steps that take a placed job from `from` to `to`, walking through the
/// intermediate start-up states a scheduler may not report.
///
/// `None` if no such path exists. Never leaves `Pending`: queueing is
/// routing's decision, not a status report's.
pub fn forward_path(from: JobState, to: JobState) -> Option<Vec<JobState>> {
    let mut path = Vec::new();
    let mut current = from;
    loop {
        if is_legal(current, to) {
            path.push(to);
            return Some(path);
        }
        current = match current {
            JobState::Queued => JobState::Starting,
            JobState::Starting => JobState::Running,
            _ => return None,
        };
        path.push(current);
    }
}

/// Move `job` to `to`.
///
/// Re-entering the current state is `Unchanged`, including replay of the
/// terminal transition the job already took. Leaving a terminal state is
/// `AlreadyTerminal`.
pub fn transition(
    job: &mut HPCJob,
    to: JobState,
    ctx: &BlockContext,
    reason: &str,
) -> LifecycleResult<TransitionOutcome> {
    let from = job.state;
    if from == to {
        debug!(job = %job.id, state = from.label(), "transition replayed");
        return Ok(TransitionOutcome::Unchanged);
    }
    if from.is_terminal() {
        return Err(LifecycleError::AlreadyTerminal {
            job_id: job.id.clone(),
            state: from,
        });
    }
    if !is_legal(from, to) {
        return Err(LifecycleError::IllegalTransition {
            job_id: job.id.clone(),
            from,
            to,
        });
    }

    job.record_transition(to, ctx, reason);
    match to {
        JobState::Queued => job.queued_time = Some(ctx.time),
        JobState::Running if job.started_time.is_none() => job.started_time = Some(ctx.time),
        state if state.is_terminal() => job.finished_time = Some(ctx.time),
        _ => {}
    }

    info!(
        job = %job.id,
        from = from.label(),
        to = to.label(),
        height = ctx.height,
        reason,
        "job transitioned"
    );
    Ok(TransitionOutcome::Applied { from, to })
}

/// Block time after which a running job times out.
pub fn deadline(job: &HPCJob) -> Option<u64> {
    job.started_time
        .map(|started| started.saturating_add(job.max_duration_secs))
}

/// Whether the engine must force `job` into `Timeout` at `ctx`.
///
/// Suspended time counts toward the duration ceiling.
pub fn is_timed_out(job: &HPCJob, ctx: &BlockContext) -> bool {
    matches!(job.state, JobState::Running | JobState::Suspended)
        && deadline(job).is_some_and(|deadline| ctx.time > deadline)
}
