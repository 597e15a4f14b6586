//! Pipeline hooks called by the monitor as an analysis moves through its life
//!
//! A pipeline only overrides the hooks it cares about; every hook has a
//! default that does nothing (or, for the questions, answers conservatively).
//! Pipelines are registered by name and looked up through the analysis'
//! `pipeline` field.

/// Pipeline driven entirely by analysis metadata
pub mod generic;

use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::error::{PipelineError, SchedulerError};
use crate::job::{JobDescription, JobId};
use crate::ledger::Analysis;
use crate::scheduler::Scheduler;

/// What the `ready` handler hands to the scheduler
#[derive(Clone, Debug, PartialEq)]
pub enum Submission {
    Job(JobDescription),
    /// A job graph file in either native format
    Dag { path: PathBuf, batch_name: String },
}

impl Submission {
    pub fn submit(&self, scheduler: &dyn Scheduler) -> Result<JobId, SchedulerError> {
        match self {
            Submission::Job(job) => scheduler.submit(job),
            Submission::Dag { path, batch_name } => scheduler.submit_dag(path, batch_name),
        }
    }
}

pub trait Pipeline {
    /// What to submit when the analysis becomes ready; `None` means there is nothing to run yet
    fn submission(&self, _analysis: &Analysis) -> Result<Option<Submission>, PipelineError> {
        Ok(None)
    }

    /// Called every cycle while the scheduler reports the job queued or running
    fn while_running(&self, _analysis: &Analysis) -> Result<(), PipelineError> {
        Ok(())
    }

    /// Whether the analysis produced its results. Consulted once the scheduler
    /// no longer runs the job; `false` sends the analysis to `stuck`.
    fn detect_completion(&self, _analysis: &Analysis) -> Result<bool, PipelineError> {
        Ok(false)
    }

    /// Start post-processing of a finished analysis
    fn after_completion(&self, _analysis: &mut Analysis) -> Result<(), PipelineError> {
        Ok(())
    }

    /// Whether post-processing and archival are done
    fn after_processing(&self, _analysis: &mut Analysis) -> Result<bool, PipelineError> {
        Ok(true)
    }

    /// Try to bring a stuck analysis back, returning the id of any new submission
    fn resurrect(&self, _analysis: &mut Analysis, _scheduler: &dyn Scheduler) -> Result<Option<JobId>, PipelineError> {
        Ok(None)
    }
}

/// Pipelines by name, handed to the monitor at construction
#[derive(Default)]
pub struct PipelineRegistry {
    pipelines: BTreeMap<String, Box<dyn Pipeline>>,
}

impl PipelineRegistry {
    pub fn new() -> Self {
        PipelineRegistry::default()
    }

    /// The built-in pipelines
    pub fn standard() -> Self {
        let mut registry = PipelineRegistry::new();
        registry.register(generic::NAME, Box::new(generic::GenericPipeline));
        registry
    }

    pub fn register(&mut self, name: &str, pipeline: Box<dyn Pipeline>) {
        self.pipelines.insert(name.to_string(), pipeline);
    }

    pub fn get(&self, name: &str) -> Option<&dyn Pipeline> {
        self.pipelines.get(name).map(|p| p.as_ref())
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.pipelines.keys().map(String::as_str)
    }
}
