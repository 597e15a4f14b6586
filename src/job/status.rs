use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::job::JobId;
use crate::scheduler::SchedulerKind;

/// Scheduler status reduced to the small set the monitor reasons about.
///
/// Each scheduler maps its native codes onto these, so that monitor logic
/// never has to branch on the scheduler kind.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Queued, waiting for resources
    Idle,
    Running,
    /// Held, suspended or failed: needs attention
    Held,
    Completed,
    /// Removed or cancelled
    Removed,
    Unknown,
}

impl JobStatus {
    /// The scheduler will never change this status again
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Removed)
    }

    /// HTCondor `JobStatus` ClassAd attribute
    pub fn from_htcondor_code(code: i64) -> Self {
        match code {
            1 => JobStatus::Idle,
            2 => JobStatus::Running,
            3 => JobStatus::Removed,
            4 => JobStatus::Completed,
            // held, submission error, suspended
            5..=7 => JobStatus::Held,
            _ => JobStatus::Unknown,
        }
    }

    /// Slurm job state, either the compact `squeue %t` form or the long `sacct` form
    pub fn from_slurm_state(state: &str) -> Self {
        // sacct reports e.g. "CANCELLED by 1234"
        let state = state
            .split_whitespace()
            .next()
            .unwrap_or_default()
            .trim_end_matches('+')
            .to_ascii_uppercase();

        match state.as_str() {
            "PD" | "PENDING" | "CF" | "CONFIGURING" | "RQ" | "REQUEUED" => JobStatus::Idle,
            "R" | "RUNNING" | "CG" | "COMPLETING" | "SO" | "STAGE_OUT" => JobStatus::Running,
            "CD" | "COMPLETED" => JobStatus::Completed,
            "CA" | "CANCELLED" | "RV" | "REVOKED" => JobStatus::Removed,
            "F" | "FAILED" | "TO" | "TIMEOUT" | "NF" | "NODE_FAIL" | "OOM" | "OUT_OF_MEMORY"
            | "BF" | "BOOT_FAIL" | "DL" | "DEADLINE" | "PR" | "PREEMPTED" | "S"
            | "SUSPENDED" | "ST" | "STOPPED" | "RH" | "REQUEUE_HOLD" | "SE"
            | "SPECIAL_EXIT" => JobStatus::Held,
            _ => JobStatus::Unknown,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            JobStatus::Idle => write!(f, "idle"),
            JobStatus::Running => write!(f, "running"),
            JobStatus::Held => write!(f, "held"),
            JobStatus::Completed => write!(f, "completed"),
            JobStatus::Removed => write!(f, "removed"),
            JobStatus::Unknown => write!(f, "unknown"),
        }
    }
}

/// A job as last reported by its scheduler.
///
/// Only built by the scheduler query path.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub name: Option<String>,
    pub kind: SchedulerKind,
    pub status: JobStatus,
    pub hosts: u32,
    /// DAGMan cluster that owns this job, if any
    pub dag_id: Option<JobId>,
    pub polled_at: DateTime<Utc>,
}

impl Job {
    pub fn polled(id: JobId, kind: SchedulerKind, status: JobStatus) -> Self {
        Job {
            id,
            name: None,
            kind,
            status,
            hosts: 0,
            dag_id: None,
            polled_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn htcondor_codes_map_to_canonical_status() {
        let expected = [
            (0, JobStatus::Unknown),
            (1, JobStatus::Idle),
            (2, JobStatus::Running),
            (3, JobStatus::Removed),
            (4, JobStatus::Completed),
            (5, JobStatus::Held),
            (6, JobStatus::Held),
            (7, JobStatus::Held),
            (42, JobStatus::Unknown),
        ];
        for (code, status) in expected {
            assert_eq!(JobStatus::from_htcondor_code(code), status, "code {code}");
        }
    }

    #[test]
    fn slurm_short_and_long_states_agree() {
        assert_eq!(JobStatus::from_slurm_state("PD"), JobStatus::Idle);
        assert_eq!(JobStatus::from_slurm_state("PENDING"), JobStatus::Idle);
        assert_eq!(JobStatus::from_slurm_state("R"), JobStatus::Running);
        assert_eq!(JobStatus::from_slurm_state("CD"), JobStatus::Completed);
        assert_eq!(JobStatus::from_slurm_state("CANCELLED by 1000"), JobStatus::Removed);
        assert_eq!(JobStatus::from_slurm_state("CANCELLED+"), JobStatus::Removed);
        assert_eq!(JobStatus::from_slurm_state("TIMEOUT"), JobStatus::Held);
        assert_eq!(JobStatus::from_slurm_state("??"), JobStatus::Unknown);
    }

    #[test]
    fn only_completed_and_removed_are_terminal() {
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Removed.is_terminal());
        assert!(!JobStatus::Held.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
    }
}
