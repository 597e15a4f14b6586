//! Persistent record of every tracked analysis
//!
//! The monitor reads all analyses once per cycle and writes each one back at
//! most once. Nothing else in the monitor touches storage.

/// SQLite-backed ledger
pub mod sqlite;
/// In-process ledger for tests and one-off runs
pub mod memory;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::LedgerError;
use crate::job::JobId;
use crate::monitor::state::LifecycleState;

/// An operator request, consumed by the next handler that acts on it
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Request {
    /// Remove the running job and park the analysis in `stopped`
    Stop,
    /// Send a `stopped` or `stuck` analysis back to `ready`
    Resubmit,
}

/// A tracked unit of work
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Analysis {
    pub name: String,
    /// Name of the pipeline that builds and checks this analysis
    pub pipeline: String,
    pub state: LifecycleState,
    /// Scheduler id of the current submission (a single job or a whole DAG)
    #[serde(default)]
    pub job_id: Option<JobId>,
    /// Analyses that must finish before this one becomes ready
    #[serde(default)]
    pub needs: Vec<String>,
    #[serde(default)]
    pub request: Option<Request>,
    /// Free-form pipeline metadata
    #[serde(default)]
    pub meta: BTreeMap<String, serde_json::Value>,
}

impl Analysis {
    pub fn new(name: impl Into<String>, pipeline: impl Into<String>) -> Self {
        Analysis {
            name: name.into(),
            pipeline: pipeline.into(),
            state: LifecycleState::Wait,
            job_id: None,
            needs: Vec::new(),
            request: None,
            meta: BTreeMap::new(),
        }
    }

    pub fn with_state(mut self, state: LifecycleState) -> Self {
        self.state = state;
        self
    }

    pub fn with_job(mut self, job_id: impl Into<JobId>) -> Self {
        self.job_id = Some(job_id.into());
        self
    }

    pub fn with_meta(mut self, key: &str, value: serde_json::Value) -> Self {
        self.meta.insert(key.to_string(), value);
        self
    }
}

/// Storage for analyses. One writer per ledger: running two monitors against
/// the same ledger is not supported.
pub trait Ledger {
    /// Every analysis, in insertion order
    fn analyses(&self) -> Result<Vec<Analysis>, LedgerError>;

    fn get(&self, name: &str) -> Result<Analysis, LedgerError>;

    /// Add a new analysis; fails if the name is taken
    fn insert(&mut self, analysis: &Analysis) -> Result<(), LedgerError>;

    /// Replace a stored analysis with `analysis`
    fn update(&mut self, analysis: &Analysis) -> Result<(), LedgerError>;
}
