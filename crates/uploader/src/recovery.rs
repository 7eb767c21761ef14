//! Startup reconciliation of stored jobs with transfers the backend
//! still runs.

use std::collections::HashMap;

use skyhaul_transfer::Job;

/// Reconciliation of loaded jobs with transfers the backend still runs.
#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct RecoveryPlan {
    /// Live transfers to adopt, as `(job id, transfer id)`.
    pub reattach: Vec<(String, u64)>,
    /// Live transfers that belong to no pending job.
    pub orphaned: Vec<String>,
    /// Every pending job, oldest first. Starting is idempotent, so adopted
    /// jobs are included.
    pub start: Vec<String>,
    /// Jobs that already completed and are awaiting acknowledgement.
    pub completed: Vec<String>,
}

pub(crate) fn plan_recovery(
    jobs: &HashMap<String, Job>,
    outstanding: Vec<(String, u64)>,
) -> RecoveryPlan {
    let mut plan = RecoveryPlan::default();

    for (job_id, transfer) in outstanding {
        match jobs.get(&job_id) {
            Some(job) if !job.is_completed() => plan.reattach.push((job_id, transfer)),
            _ => plan.orphaned.push(job_id),
        }
    }

    let mut ordered: Vec<&Job> = jobs.values().collect();
    ordered.sort_by(|a, b| a.created_at().cmp(&b.created_at()).then(a.id().cmp(b.id())));
    for job in ordered {
        if job.is_completed() {
            plan.completed.push(job.id().to_string());
        } else {
            plan.start.push(job.id().to_string());
        }
    }

    plan
}
