use std::collections::HashMap;

use log::{debug, info};

use crate::config::RetryPolicy;
use crate::error::{MonitorError, SchedulerError};
use crate::job::status::{Job, JobStatus};
use crate::job::JobId;
use crate::ledger::Analysis;
use crate::monitor::state::LifecycleState;
use crate::pipeline::{Pipeline, PipelineRegistry};
use crate::scheduler::Scheduler;

/// The scheduler queue as seen at the start of a cycle.
///
/// Shared read-only by every analysis in the cycle, so no analysis observes
/// the effect of another's action until the next cycle.
#[derive(Debug, Default)]
pub struct JobSnapshot {
    jobs: Option<HashMap<JobId, Job>>,
}

impl JobSnapshot {
    pub fn available(jobs: Vec<Job>) -> Self {
        JobSnapshot { jobs: Some(jobs.into_iter().map(|job| (job.id.clone(), job)).collect()) }
    }

    /// The bulk query failed; every lookup falls through to a direct query
    pub fn unavailable() -> Self {
        JobSnapshot { jobs: None }
    }

    pub fn is_available(&self) -> bool {
        self.jobs.is_some()
    }

    pub fn get(&self, id: &JobId) -> Option<&Job> {
        self.jobs.as_ref()?.get(id)
    }

    pub fn len(&self) -> usize {
        self.jobs.as_ref().map_or(0, HashMap::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Everything a state handler may look at or change for one analysis in one cycle
pub struct MonitorContext<'a> {
    analysis: Analysis,
    snapshot: &'a JobSnapshot,
    scheduler: &'a dyn Scheduler,
    pipelines: &'a PipelineRegistry,
    /// Every analysis' state at the start of the cycle
    peers: &'a HashMap<String, LifecycleState>,
    retry: RetryPolicy,
    dry_run: bool,
    dirty: bool,
    transition: Option<(LifecycleState, LifecycleState)>,
}

impl<'a> MonitorContext<'a> {
    pub fn new(
        analysis: Analysis,
        snapshot: &'a JobSnapshot,
        scheduler: &'a dyn Scheduler,
        pipelines: &'a PipelineRegistry,
        peers: &'a HashMap<String, LifecycleState>,
        retry: RetryPolicy,
        dry_run: bool,
    ) -> Self {
        MonitorContext {
            analysis,
            snapshot,
            scheduler,
            pipelines,
            peers,
            retry,
            dry_run,
            dirty: false,
            transition: None,
        }
    }

    pub fn analysis(&self) -> &Analysis {
        &self.analysis
    }

    /// Mutable access to the analysis; any change is written back at the end of the cycle
    pub fn analysis_mut(&mut self) -> &mut Analysis {
        self.dirty = true;
        &mut self.analysis
    }

    pub fn name(&self) -> &str {
        &self.analysis.name
    }

    pub fn state(&self) -> LifecycleState {
        self.analysis.state
    }

    /// When set, handlers report what they would do without submitting,
    /// removing jobs, running hooks or changing state
    pub fn dry_run(&self) -> bool {
        self.dry_run
    }

    pub fn scheduler(&self) -> &'a dyn Scheduler {
        self.scheduler
    }

    pub fn retry(&self) -> RetryPolicy {
        self.retry
    }

    pub fn pipeline(&self) -> Result<&'a dyn Pipeline, MonitorError> {
        self.pipelines
            .get(&self.analysis.pipeline)
            .ok_or_else(|| MonitorError::UnknownPipeline(self.analysis.pipeline.clone()))
    }

    /// State of another analysis when this cycle began
    pub fn peer_state(&self, name: &str) -> Option<LifecycleState> {
        self.peers.get(name).copied()
    }

    pub fn job_id(&self) -> Result<JobId, MonitorError> {
        self.analysis.job_id.clone().ok_or(MonitorError::MissingJobId(self.analysis.state))
    }

    /// Current status of `id`: from the cycle snapshot when it's there,
    /// otherwise from a direct query retried on transient failures.
    /// [`SchedulerError::NotFound`] means the scheduler has forgotten the job.
    pub fn job_status(&self, id: &JobId) -> Result<JobStatus, SchedulerError> {
        if let Some(job) = self.snapshot.get(id) {
            return Ok(job.status);
        }
        debug!("{}: job {id} not in snapshot, querying directly", self.name());
        let job = self.retry.run(&format!("query of job {id}"), || self.scheduler.query(id))?;
        Ok(job.status)
    }

    /// Move to `to` and mark the analysis for write-back. In a dry run the
    /// transition is only logged.
    pub fn transition(&mut self, to: LifecycleState) {
        let from = self.analysis.state;
        if self.dry_run {
            info!("{}: {from} -> {to} (dry run, not applied)", self.analysis.name);
            return;
        }
        info!("{}: {from} -> {to}", self.analysis.name);
        self.analysis.state = to;
        self.transition = Some((from, to));
        self.dirty = true;
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn transitioned(&self) -> Option<(LifecycleState, LifecycleState)> {
        self.transition
    }

    pub fn into_analysis(self) -> Analysis {
        self.analysis
    }
}
