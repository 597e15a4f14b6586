use std::collections::{BTreeMap, HashMap};
use std::fmt;

use log::{debug, error, info, warn};

use crate::config::RetryPolicy;
use crate::error::LedgerError;
use crate::ledger::{Analysis, Ledger};
use crate::monitor::context::{JobSnapshot, MonitorContext};
use crate::monitor::handlers::HandlerRegistry;
use crate::monitor::state::LifecycleState;
use crate::pipeline::PipelineRegistry;
use crate::scheduler::Scheduler;

/// Tallies from one monitor cycle
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Analyses handed to a handler
    pub visited: usize,
    /// Analyses skipped because they are `manual` or terminal
    pub skipped: usize,
    pub transitions: usize,
    /// Handlers that failed or couldn't decide, plus analyses with no handler
    pub failures: usize,
    pub ledger_writes: usize,
    /// Analyses per state at the end of the cycle
    pub states: BTreeMap<LifecycleState, usize>,
}

impl fmt::Display for CycleReport {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "visited {}, skipped {}, {} transitions, {} failures, {} ledger writes",
            self.visited, self.skipped, self.transitions, self.failures, self.ledger_writes
        )?;
        for (state, count) in &self.states {
            write!(f, ", {state}: {count}")?;
        }
        Ok(())
    }
}

/// Drives every tracked analysis one step per cycle
pub struct Monitor {
    scheduler: Box<dyn Scheduler>,
    handlers: HandlerRegistry,
    pipelines: PipelineRegistry,
    retry: RetryPolicy,
    dry_run: bool,
}

impl Monitor {
    pub fn new(
        scheduler: Box<dyn Scheduler>,
        handlers: HandlerRegistry,
        pipelines: PipelineRegistry,
        retry: RetryPolicy,
        dry_run: bool,
    ) -> Self {
        Monitor { scheduler, handlers, pipelines, retry, dry_run }
    }

    pub fn scheduler(&self) -> &dyn Scheduler {
        self.scheduler.as_ref()
    }

    /// Query the scheduler once, then give every analysis to its state's handler.
    ///
    /// A failing analysis is logged and counted; it never stops the others.
    /// Only failing to read the ledger aborts the cycle.
    pub fn run_cycle(&self, ledger: &mut dyn Ledger) -> Result<CycleReport, LedgerError> {
        let analyses = ledger.analyses()?;
        let mut report = CycleReport::default();

        let snapshot = match self.retry.run("bulk job query", || self.scheduler.query_all_jobs()) {
            Ok(jobs) => {
                debug!("Cycle snapshot holds {} jobs", jobs.len());
                JobSnapshot::available(jobs)
            }
            Err(err) => {
                warn!("Can't list scheduler jobs, querying each job directly this cycle: {err}");
                JobSnapshot::unavailable()
            }
        };
        let peers: HashMap<String, LifecycleState> = analyses.iter().map(|a| (a.name.clone(), a.state)).collect();

        for analysis in analyses {
            let state = analysis.state;
            if state == LifecycleState::Manual || state.is_terminal() {
                debug!("{}: {state}, skipping", analysis.name);
                report.skipped += 1;
                *report.states.entry(state).or_default() += 1;
                continue;
            }

            let Some(handler) = self.handlers.get(state) else {
                error!("{}: no handler for state {state}", analysis.name);
                report.failures += 1;
                *report.states.entry(state).or_default() += 1;
                continue;
            };

            report.visited += 1;
            let name = analysis.name.clone();
            let mut ctx = MonitorContext::new(
                analysis,
                &snapshot,
                self.scheduler.as_ref(),
                &self.pipelines,
                &peers,
                self.retry,
                self.dry_run,
            );

            match handler.handle(&mut ctx) {
                Ok(true) => {}
                Ok(false) => {
                    warn!("{name}: no progress in {state} this cycle");
                    report.failures += 1;
                }
                Err(err) => {
                    error!("{name}: {state} handler failed: {err}");
                    report.failures += 1;
                }
            }

            if ctx.transitioned().is_some() {
                report.transitions += 1;
            }
            let dirty = ctx.is_dirty();
            let analysis = ctx.into_analysis();
            *report.states.entry(analysis.state).or_default() += 1;

            if dirty {
                match ledger.update(&analysis) {
                    Ok(()) => report.ledger_writes += 1,
                    Err(err) => {
                        error!("{name}: can't write back to ledger: {err}");
                        report.failures += 1;
                    }
                }
            }
        }

        info!("Monitor cycle done: {report}");
        Ok(report)
    }

    /// Move an analysis straight to `cancelled`.
    ///
    /// Removing its job from the scheduler is attempted once; a failure is
    /// logged and does not block the cancellation.
    pub fn cancel(&self, ledger: &mut dyn Ledger, name: &str) -> Result<Analysis, LedgerError> {
        let mut analysis = ledger.get(name)?;
        if analysis.state == LifecycleState::Cancelled {
            info!("{name} is already cancelled");
            return Ok(analysis);
        }

        if let Some(id) = &analysis.job_id {
            if self.dry_run {
                info!("{name}: would remove job {id}");
            } else if let Err(err) = self.scheduler.delete(id) {
                warn!("{name}: couldn't remove job {id}, cancelling anyway: {err}");
            }
        }

        if self.dry_run {
            info!("{name}: {} -> cancelled (dry run, not applied)", analysis.state);
            return Ok(analysis);
        }
        info!("{name}: {} -> cancelled", analysis.state);
        analysis.state = LifecycleState::Cancelled;
        analysis.request = None;
        ledger.update(&analysis)?;
        Ok(analysis)
    }
}
