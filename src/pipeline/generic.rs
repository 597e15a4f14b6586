use std::path::{Path, PathBuf};

use log::{info, warn};
use serde::Deserialize;

use crate::error::PipelineError;
use crate::job::{JobDescription, JobId};
use crate::ledger::Analysis;
use crate::pipeline::{Pipeline, Submission};
use crate::scheduler::Scheduler;

pub const NAME: &str = "generic";

/// `meta.dag` of a generic analysis
#[derive(Deserialize)]
struct DagRef {
    path: PathBuf,
    #[serde(default)]
    batch_name: Option<String>,
}

/// Runs whatever the analysis metadata describes.
///
/// Recognised `meta` keys:
/// - `job`: a [`JobDescription`] to submit as a single job
/// - `dag`: `{"path": ..., "batch_name": ...}`, a job graph in either format
/// - `completion_marker`: file whose existence means the analysis succeeded
/// - `max_resubmits`: how many times a stuck analysis is resubmitted automatically
pub struct GenericPipeline;

fn meta<T: for<'de> Deserialize<'de>>(analysis: &Analysis, key: &str) -> Result<Option<T>, PipelineError> {
    analysis
        .meta
        .get(key)
        .map(|value| {
            serde_json::from_value(value.clone())
                .map_err(|err| PipelineError::new(format!("{}: bad `{key}` metadata: {err}", analysis.name)))
        })
        .transpose()
}

impl Pipeline for GenericPipeline {
    fn submission(&self, analysis: &Analysis) -> Result<Option<Submission>, PipelineError> {
        if let Some(job) = meta::<JobDescription>(analysis, "job")? {
            return Ok(Some(Submission::Job(job)));
        }
        Ok(meta::<DagRef>(analysis, "dag")?.map(|dag| Submission::Dag {
            path: dag.path,
            batch_name: dag.batch_name.unwrap_or_else(|| analysis.name.clone()),
        }))
    }

    fn detect_completion(&self, analysis: &Analysis) -> Result<bool, PipelineError> {
        match meta::<PathBuf>(analysis, "completion_marker")? {
            Some(marker) => Ok(Path::new(&marker).exists()),
            None => {
                warn!("{}: no completion_marker, completion can't be confirmed", analysis.name);
                Ok(false)
            }
        }
    }

    fn resurrect(&self, analysis: &mut Analysis, scheduler: &dyn Scheduler) -> Result<Option<JobId>, PipelineError> {
        let limit: u64 = meta(analysis, "max_resubmits")?.unwrap_or(0);
        let done: u64 = meta(analysis, "resubmits")?.unwrap_or(0);
        if done >= limit {
            return Ok(None);
        }
        let Some(submission) = self.submission(analysis)? else {
            return Ok(None);
        };

        if let Some(old) = &analysis.job_id {
            if let Err(err) = scheduler.delete(old) {
                warn!("{}: couldn't remove old job {old}: {err}", analysis.name);
            }
        }
        let id = submission.submit(scheduler)?;
        info!("{}: resubmitted as {id} (attempt {} of {limit})", analysis.name, done + 1);
        analysis.meta.insert("resubmits".to_string(), (done + 1).into());
        Ok(Some(id))
    }
}
