//! Each handler looks at one analysis in one state, takes at most one
//! outward action (submit, remove, or a pipeline hook) and decides whether
//! to move it on.
//!
//! A handler returns `Ok(true)` when it did what the state asks for (which
//! may be nothing), `Ok(false)` when it couldn't tell or couldn't act this
//! cycle, and `Err` for failures the driver should log against the analysis.

use std::collections::HashMap;

use log::{debug, info, warn};

use crate::error::{MonitorError, SchedulerError};
use crate::job::status::JobStatus;
use crate::ledger::Request;
use crate::monitor::context::MonitorContext;
use crate::monitor::state::LifecycleState;

pub trait StateHandler {
    fn handle(&self, ctx: &mut MonitorContext<'_>) -> Result<bool, MonitorError>;
}

/// `wait -> ready` once every analysis listed in `needs` has finished
pub struct WaitHandler;

impl StateHandler for WaitHandler {
    fn handle(&self, ctx: &mut MonitorContext<'_>) -> Result<bool, MonitorError> {
        let mut pending = Vec::new();
        for need in &ctx.analysis().needs {
            match ctx.peer_state(need) {
                Some(state) if state.satisfies_dependents() => {}
                Some(_) => pending.push(need.clone()),
                None => {
                    warn!("{}: depends on unknown analysis {need}", ctx.name());
                    return Ok(false);
                }
            }
        }

        if pending.is_empty() {
            ctx.transition(LifecycleState::Ready);
        } else {
            debug!("{}: still waiting for {}", ctx.name(), pending.join(", "));
        }
        Ok(true)
    }
}

/// `ready -> running` by submitting whatever the pipeline asks for
pub struct ReadyHandler;

impl StateHandler for ReadyHandler {
    fn handle(&self, ctx: &mut MonitorContext<'_>) -> Result<bool, MonitorError> {
        let pipeline = ctx.pipeline()?;
        let Some(submission) = pipeline.submission(ctx.analysis())? else {
            warn!("{}: pipeline has nothing to submit", ctx.name());
            return Ok(false);
        };

        if ctx.dry_run() {
            info!("{}: would submit {submission:?}", ctx.name());
            ctx.transition(LifecycleState::Running);
            return Ok(true);
        }

        // a rejected submission leaves the analysis in ready
        let id = submission.submit(ctx.scheduler())?;
        info!("{}: submitted as {id}", ctx.name());
        ctx.analysis_mut().job_id = Some(id);
        ctx.transition(LifecycleState::Running);
        Ok(true)
    }
}

/// Follows a submitted job until it stops running
pub struct RunningHandler;

impl RunningHandler {
    fn stop(&self, ctx: &mut MonitorContext<'_>) -> Result<bool, MonitorError> {
        if ctx.dry_run() {
            info!("{}: would remove job {:?}", ctx.name(), ctx.analysis().job_id);
        } else {
            if let Some(id) = ctx.analysis().job_id.clone() {
                // best effort, as for cancellation
                if let Err(err) = ctx.retry().run(&format!("removal of job {id}"), || ctx.scheduler().delete(&id)) {
                    warn!("{}: could not remove job {id}, stopping anyway: {err}", ctx.name());
                }
            }
            ctx.analysis_mut().request = None;
        }
        ctx.transition(LifecycleState::Stopped);
        Ok(true)
    }

    /// The scheduler is done with the job: only the pipeline can say whether it worked
    fn confirm_completion(&self, ctx: &mut MonitorContext<'_>, status: &str) -> Result<bool, MonitorError> {
        let pipeline = ctx.pipeline()?;
        if pipeline.detect_completion(ctx.analysis())? {
            ctx.transition(LifecycleState::Finished);
        } else {
            warn!("{}: job is {status} but the pipeline did not confirm completion", ctx.name());
            ctx.transition(LifecycleState::Stuck);
        }
        Ok(true)
    }
}

impl StateHandler for RunningHandler {
    fn handle(&self, ctx: &mut MonitorContext<'_>) -> Result<bool, MonitorError> {
        if ctx.analysis().request == Some(Request::Stop) {
            return self.stop(ctx);
        }

        let id = ctx.job_id()?;
        match ctx.job_status(&id) {
            Ok(JobStatus::Idle | JobStatus::Running) => {
                if !ctx.dry_run() {
                    ctx.pipeline()?.while_running(ctx.analysis())?;
                }
                Ok(true)
            }
            Ok(JobStatus::Held) => {
                warn!("{}: job {id} is held", ctx.name());
                ctx.transition(LifecycleState::Stuck);
                Ok(true)
            }
            Ok(status @ (JobStatus::Completed | JobStatus::Removed)) => {
                self.confirm_completion(ctx, &status.to_string())
            }
            Ok(JobStatus::Unknown) => {
                warn!("{}: scheduler reports an unknown status for job {id}, trying again next cycle", ctx.name());
                Ok(false)
            }
            Err(SchedulerError::NotFound(_)) => self.confirm_completion(ctx, "gone from the scheduler"),
            Err(err) if err.is_transient() => {
                warn!("{}: can't get status of job {id}, leaving as is: {err}", ctx.name());
                Ok(false)
            }
            Err(err) => Err(err.into()),
        }
    }
}

/// `finished -> processing` by starting post-processing
pub struct FinishedHandler;

impl StateHandler for FinishedHandler {
    fn handle(&self, ctx: &mut MonitorContext<'_>) -> Result<bool, MonitorError> {
        let pipeline = ctx.pipeline()?;
        if ctx.dry_run() {
            info!("{}: would start post-processing", ctx.name());
        } else {
            let mut analysis = ctx.analysis().clone();
            pipeline.after_completion(&mut analysis)?;
            *ctx.analysis_mut() = analysis;
        }
        ctx.transition(LifecycleState::Processing);
        Ok(true)
    }
}

/// `processing -> uploaded` once the pipeline reports results archived
pub struct ProcessingHandler;

impl StateHandler for ProcessingHandler {
    fn handle(&self, ctx: &mut MonitorContext<'_>) -> Result<bool, MonitorError> {
        if ctx.dry_run() {
            info!("{}: would check post-processing", ctx.name());
            return Ok(true);
        }
        let pipeline = ctx.pipeline()?;
        let mut analysis = ctx.analysis().clone();
        let done = pipeline.after_processing(&mut analysis)?;
        if analysis != *ctx.analysis() {
            *ctx.analysis_mut() = analysis;
        }
        if done {
            ctx.transition(LifecycleState::Uploaded);
        } else {
            debug!("{}: post-processing still under way", ctx.name());
        }
        Ok(true)
    }
}

/// `stuck -> running` when the job recovers or the pipeline resubmits it,
/// `stuck -> ready` on an explicit resubmit request
pub struct StuckHandler;

impl StateHandler for StuckHandler {
    fn handle(&self, ctx: &mut MonitorContext<'_>) -> Result<bool, MonitorError> {
        if ctx.analysis().request == Some(Request::Resubmit) {
            if !ctx.dry_run() {
                ctx.analysis_mut().request = None;
            }
            ctx.transition(LifecycleState::Ready);
            return Ok(true);
        }

        // a held job released by hand picks up where it left off
        if let Some(id) = ctx.analysis().job_id.clone() {
            match ctx.job_status(&id) {
                Ok(JobStatus::Idle | JobStatus::Running) => {
                    info!("{}: job {id} is running again", ctx.name());
                    ctx.transition(LifecycleState::Running);
                    return Ok(true);
                }
                Err(err) if err.is_transient() => {
                    warn!("{}: can't get status of job {id}, leaving as is: {err}", ctx.name());
                    return Ok(false);
                }
                _ => {}
            }
        }

        if ctx.dry_run() {
            info!("{}: would ask the pipeline to resurrect it", ctx.name());
            return Ok(true);
        }
        let pipeline = ctx.pipeline()?;
        let scheduler = ctx.scheduler();
        let mut analysis = ctx.analysis().clone();
        if let Some(id) = pipeline.resurrect(&mut analysis, scheduler)? {
            analysis.job_id = Some(id);
            *ctx.analysis_mut() = analysis;
            ctx.transition(LifecycleState::Running);
        } else {
            debug!("{}: no automatic remediation, waiting for an operator", ctx.name());
        }
        Ok(true)
    }
}

/// `stopped -> ready` on an explicit resubmit request
pub struct StoppedHandler;

impl StateHandler for StoppedHandler {
    fn handle(&self, ctx: &mut MonitorContext<'_>) -> Result<bool, MonitorError> {
        if ctx.analysis().request == Some(Request::Resubmit) {
            if !ctx.dry_run() {
                let analysis = ctx.analysis_mut();
                analysis.request = None;
                analysis.job_id = None;
            }
            ctx.transition(LifecycleState::Ready);
        }
        Ok(true)
    }
}

/// Handlers by the state they serve, handed to the monitor at construction
pub struct HandlerRegistry {
    handlers: HashMap<LifecycleState, Box<dyn StateHandler>>,
}

impl HandlerRegistry {
    pub fn empty() -> Self {
        HandlerRegistry { handlers: HashMap::new() }
    }

    pub fn register(&mut self, state: LifecycleState, handler: Box<dyn StateHandler>) {
        self.handlers.insert(state, handler);
    }

    pub fn remove(&mut self, state: LifecycleState) -> Option<Box<dyn StateHandler>> {
        self.handlers.remove(&state)
    }

    pub fn get(&self, state: LifecycleState) -> Option<&dyn StateHandler> {
        self.handlers.get(&state).map(|h| h.as_ref())
    }
}

impl Default for HandlerRegistry {
    /// A handler for every non-terminal state except `manual`
    fn default() -> Self {
        let mut registry = HandlerRegistry::empty();
        registry.register(LifecycleState::Wait, Box::new(WaitHandler));
        registry.register(LifecycleState::Ready, Box::new(ReadyHandler));
        registry.register(LifecycleState::Running, Box::new(RunningHandler));
        registry.register(LifecycleState::Finished, Box::new(FinishedHandler));
        registry.register(LifecycleState::Processing, Box::new(ProcessingHandler));
        registry.register(LifecycleState::Stuck, Box::new(StuckHandler));
        registry.register(LifecycleState::Stopped, Box::new(StoppedHandler));
        registry
    }
}
