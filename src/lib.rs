//! Run job graphs on HTCondor or Slurm and follow each analysis until its results are archived
//!
//! - [`dag`] reads and writes the two job graph formats (DAGMan files and
//!   `sbatch` wrapper scripts) and converts between them
//! - [`scheduler`] submits, queries and removes jobs through either scheduler's tools
//! - [`monitor`] moves every tracked analysis through its lifecycle, one cycle at a time

pub mod config;
pub mod dag;
pub mod error;
pub mod job;
/// Storage for tracked analyses
pub mod ledger;
pub mod monitor;
pub mod pipeline;
pub mod scheduler;
/// Shell word quoting for generated scripts
pub mod shell;
