//! Submit, query and remove jobs on a cluster scheduler
//!
//! Two schedulers are supported, each driven through its command line tools:
//! - HTCondor (`condor_submit`, `condor_q`, `condor_rm`, `condor_submit_dag`)
//! - Slurm (`sbatch`, `squeue`, `sacct`, `scancel`)
//!
//! Callers only ever hold a `dyn Scheduler`; the kind is picked once from configuration.

/// Run external scheduler commands with a per-call timeout
pub mod command;
/// Time-limited cache for bulk job queries
pub mod cache;
pub mod htcondor;
pub mod slurm;

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use clap::ValueEnum;
use log::info;
use serde::{Deserialize, Serialize};

use crate::config::ClusterConfig;
use crate::dag::format::{self, DagFormat};
use crate::dag::translate;
use crate::error::SchedulerError;
use crate::job::status::Job;
use crate::job::{sanitise, JobDescription, JobId};
use crate::scheduler::command::{CommandRunner, SystemRunner};

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchedulerKind {
    #[default]
    #[value(name = "htcondor")]
    #[serde(alias = "condor")]
    HTCondor,
    Slurm,
}

impl SchedulerKind {
    /// The job graph format this scheduler accepts without translation
    pub fn dag_format(&self) -> DagFormat {
        match self {
            SchedulerKind::HTCondor => DagFormat::DagMan,
            SchedulerKind::Slurm => DagFormat::SlurmScript,
        }
    }
}

impl fmt::Display for SchedulerKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SchedulerKind::HTCondor => write!(f, "htcondor"),
            SchedulerKind::Slurm => write!(f, "slurm"),
        }
    }
}

impl FromStr for SchedulerKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "htcondor" | "condor" => Ok(SchedulerKind::HTCondor),
            "slurm" => Ok(SchedulerKind::Slurm),
            other => Err(format!("Unknown scheduler type: {other}")),
        }
    }
}

/// Operations shared by every supported scheduler
pub trait Scheduler {
    fn kind(&self) -> SchedulerKind;

    /// Submit one unit of work and return its scheduler id
    fn submit(&self, job: &JobDescription) -> Result<JobId, SchedulerError>;

    /// Remove a job. Removing a job the scheduler no longer knows about is not an error.
    fn delete(&self, job_id: &JobId) -> Result<(), SchedulerError>;

    /// Status of a single job, or [`SchedulerError::NotFound`] if it has aged out of history
    fn query(&self, job_id: &JobId) -> Result<Job, SchedulerError>;

    /// Status of every job owned by the configured user, served from a TTL cache
    fn query_all_jobs(&self) -> Result<Vec<Job>, SchedulerError>;

    /// Submit a job graph that is already in this scheduler's native format
    fn submit_native_dag(&self, path: &Path, batch_name: &str) -> Result<JobId, SchedulerError>;

    /// Submit a job graph in either format, translating it first if needed
    fn submit_dag(&self, path: &Path, batch_name: &str) -> Result<JobId, SchedulerError> {
        let native = self.kind().dag_format();
        let found = format::detect_file(path)?;
        if found == native {
            return self.submit_native_dag(path, batch_name);
        }

        info!("{} is a {found}, translating to {native} for {}", path.display(), self.kind());
        let out_dir = translation_dir(path, batch_name, native);
        let translated = translate::translate_file(path, native, &out_dir, batch_name, None)?;
        self.submit_native_dag(&translated, batch_name)
    }
}

/// Translated graphs are written next to their source, in a directory named after the batch
pub(crate) fn translation_dir(source: &Path, batch_name: &str, target: DagFormat) -> PathBuf {
    let parent = source.parent().unwrap_or_else(|| Path::new("."));
    parent.join(format!("{}-{}", sanitise(batch_name), target.slug()))
}

/// Build the configured scheduler, driving the real command line tools
pub fn from_config(config: &ClusterConfig) -> Box<dyn Scheduler> {
    with_runner(config, Box::new(SystemRunner))
}

/// Build the configured scheduler on top of a custom command runner
pub fn with_runner(config: &ClusterConfig, runner: Box<dyn CommandRunner>) -> Box<dyn Scheduler> {
    info!("Using {} scheduler", config.scheduler);
    match config.scheduler {
        SchedulerKind::HTCondor => Box::new(htcondor::HTCondor::new(config, runner)),
        SchedulerKind::Slurm => Box::new(slurm::Slurm::new(config, runner)),
    }
}
