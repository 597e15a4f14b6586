use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::job::JobId;

/// Failures raised while talking to a cluster scheduler
#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("Scheduler rejected submission: {0}")]
    Submission(String),

    #[error("Job {0} is unknown to the scheduler")]
    NotFound(JobId),

    #[error("{program} did not finish within {after:?}")]
    Timeout { program: String, after: Duration },

    #[error("{program} failed: {message}")]
    Command { program: String, message: String },

    #[error("Can't parse scheduler output: {0}")]
    Parse(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Job graph translation failed: {0}")]
    Translation(#[from] DagError),
}

impl SchedulerError {
    /// Errors worth retrying within the same monitor cycle
    pub fn is_transient(&self) -> bool {
        matches!(self, SchedulerError::Timeout { .. } | SchedulerError::Command { .. })
    }
}

/// Failures raised while parsing, ordering or writing a job graph
#[derive(Error, Debug)]
pub enum DagError {
    #[error("{0} is neither a DAGMan file nor a Slurm submission script")]
    FormatDetection(PathBuf),

    #[error("Dependency cycle between jobs: {}", .0.join(", "))]
    Cycle(Vec<String>),

    #[error("Line {line}: job {name} is referenced but never declared")]
    UnknownNode { name: String, line: usize },

    #[error("Job {0} is declared more than once")]
    DuplicateNode(String),

    #[error("{}:{line}: {message}", path.display())]
    Parse { path: PathBuf, line: usize, message: String },

    #[error("I/O error on {}: {source}", path.display())]
    Io { path: PathBuf, source: io::Error },

    #[error("Template error: {0}")]
    Template(#[from] tinytemplate::error::Error),
}

impl DagError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        DagError::Io { path: path.into(), source }
    }

    pub(crate) fn parse(path: impl Into<PathBuf>, line: usize, message: impl Into<String>) -> Self {
        DagError::Parse { path: path.into(), line, message: message.into() }
    }
}

/// Failures raised by a ledger backend
#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Can't (de)serialise analysis manifest: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("No analysis named {0}")]
    UnknownAnalysis(String),

    #[error("An analysis named {0} already exists")]
    DuplicateAnalysis(String),
}

/// A pipeline hook could not complete
#[derive(Error, Debug)]
#[error("{0}")]
pub struct PipelineError(pub String);

impl PipelineError {
    pub fn new(message: impl Into<String>) -> Self {
        PipelineError(message.into())
    }
}

impl From<SchedulerError> for PipelineError {
    fn from(err: SchedulerError) -> Self {
        PipelineError(err.to_string())
    }
}

/// Why a state handler could not finish its work for one analysis
#[derive(Error, Debug)]
pub enum MonitorError {
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    #[error("Pipeline hook failed: {0}")]
    Pipeline(#[from] PipelineError),

    #[error("No pipeline registered as {0}")]
    UnknownPipeline(String),

    #[error("Analysis is {0} but has no scheduler job id")]
    MissingJobId(crate::monitor::state::LifecycleState),
}
