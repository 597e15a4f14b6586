//! Scheduler-agnostic description of a unit of work, and the identity it gets once submitted

/// Canonical job status and the post-submission job record
pub mod status;

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Conservative CPU request used when nothing better is known
pub const DEFAULT_CPUS: u32 = 1;
/// Conservative memory request (MB) used when nothing better is known
pub const DEFAULT_MEMORY_MB: u64 = 1024;

/// Opaque scheduler-assigned identifier (HTCondor cluster id or Slurm job id)
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn new(id: impl Into<String>) -> Self {
        JobId(id.into().trim().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for JobId {
    fn from(id: u64) -> Self {
        JobId(id.to_string())
    }
}

impl From<&str> for JobId {
    fn from(id: &str) -> Self {
        JobId::new(id)
    }
}

/// Resource requests attached to a job
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Resources {
    pub cpus: u32,
    pub memory_mb: u64,
    pub disk_mb: Option<u64>,
    pub gpus: Option<u32>,
    /// Slurm partition; HTCondor has no equivalent and ignores it
    pub partition: Option<String>,
}

impl Default for Resources {
    fn default() -> Self {
        Resources {
            cpus: DEFAULT_CPUS,
            memory_mb: DEFAULT_MEMORY_MB,
            disk_mb: None,
            gpus: None,
            partition: None,
        }
    }
}

/// Everything a scheduler needs to run one unit of work.
///
/// Treated as immutable once handed to [`crate::scheduler::Scheduler::submit`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JobDescription {
    #[serde(default)]
    pub name: Option<String>,
    pub executable: PathBuf,
    #[serde(default)]
    pub arguments: Vec<String>,
    #[serde(default = "default_working_dir")]
    pub working_dir: PathBuf,
    #[serde(default)]
    pub output: Option<PathBuf>,
    #[serde(default)]
    pub error: Option<PathBuf>,
    #[serde(default)]
    pub log: Option<PathBuf>,
    #[serde(default)]
    pub resources: Resources,
    #[serde(default)]
    pub batch_name: Option<String>,
    /// Export the submitting environment to the job
    #[serde(default)]
    pub getenv: bool,
    /// Names of jobs that must complete before this one starts
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Set when resources could not be recovered from a source file and defaults were used
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub resources_defaulted: bool,
}

fn default_working_dir() -> PathBuf {
    PathBuf::from(".")
}

impl JobDescription {
    pub fn new(executable: impl Into<PathBuf>) -> Self {
        JobDescription {
            name: None,
            executable: executable.into(),
            arguments: Vec::new(),
            working_dir: default_working_dir(),
            output: None,
            error: None,
            log: None,
            resources: Resources::default(),
            batch_name: None,
            getenv: false,
            dependencies: Vec::new(),
            resources_defaulted: false,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.arguments = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = dir.into();
        self
    }

    pub fn with_streams(
        mut self,
        output: impl Into<PathBuf>,
        error: impl Into<PathBuf>,
        log: impl Into<PathBuf>,
    ) -> Self {
        self.output = Some(output.into());
        self.error = Some(error.into());
        self.log = Some(log.into());
        self
    }

    pub fn with_resources(mut self, resources: Resources) -> Self {
        self.resources = resources;
        self
    }

    pub fn with_dependency(mut self, name: impl Into<String>) -> Self {
        self.dependencies.push(name.into());
        self
    }

    /// Name used for generated files and batch labels
    pub fn display_name(&self) -> &str {
        self.name
            .as_deref()
            .or(self.batch_name.as_deref())
            .unwrap_or("job")
    }

    /// Path of a generated file named after this job inside its working directory
    pub fn sibling_file(&self, extension: &str) -> PathBuf {
        self.working_dir
            .join(format!("{}.{extension}", sanitise(self.display_name())))
    }
}

/// Replace characters that don't belong in file names
pub fn sanitise(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || "-_.".contains(c) { c } else { '_' })
        .collect()
}

/// Parse a memory or disk request into megabytes.
///
/// Accepts `K`, `M`, `G` and `T` suffixes with an optional trailing `B`
/// (case-insensitive). A bare number is taken to be megabytes, matching
/// both HTCondor's `request_memory` and Slurm's `--mem`.
pub fn parse_megabytes(value: &str) -> Option<u64> {
    let value = value.trim().trim_matches('"');
    let split = value
        .find(|c: char| c.is_ascii_alphabetic())
        .unwrap_or(value.len());
    let (number, unit) = value.split_at(split);
    let number: f64 = number.trim().parse().ok()?;
    if number < 0.0 {
        return None;
    }

    let unit = unit.trim().to_ascii_uppercase();
    let factor = match unit.trim_end_matches('B') {
        "" | "M" => 1.0,
        "K" => 1.0 / 1024.0,
        "G" => 1024.0,
        "T" => 1024.0 * 1024.0,
        _ => return None,
    };

    Some((number * factor).ceil() as u64)
}

/// Resolve `path` against `base` unless it is already absolute
pub fn resolve(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}
