//! Cluster configuration, loaded once at startup and handed to constructors
//!
//! Nothing inside the core reads the environment or global state: `main`
//! resolves everything here and passes a [`ClusterConfig`] down.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::error::SchedulerError;
use crate::scheduler::SchedulerKind;

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ClusterConfig {
    #[serde(default)]
    pub scheduler: SchedulerKind,

    /// Owner whose jobs are returned by `query_all_jobs`
    #[serde(default)]
    pub user: String,

    /// Slurm partition applied to every submission
    #[serde(default)]
    pub partition: Option<String>,

    /// Named HTCondor schedd, passed as `-name`
    #[serde(default)]
    pub schedd_name: Option<String>,

    #[serde(default = "default_cache_ttl")]
    pub cache_ttl_secs: u64,

    /// Attempts per scheduler call within one monitor cycle
    #[serde(default = "default_retries")]
    pub retries: u32,

    /// Per-call limit for every scheduler command
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// Holds the ledger database and translated job graphs
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,
}

fn default_cache_ttl() -> u64 {
    60
}

fn default_retries() -> u32 {
    3
}

fn default_timeout() -> u64 {
    30
}

fn default_work_dir() -> PathBuf {
    PathBuf::from(".")
}

impl Default for ClusterConfig {
    fn default() -> Self {
        ClusterConfig {
            scheduler: SchedulerKind::default(),
            user: String::new(),
            partition: None,
            schedd_name: None,
            cache_ttl_secs: default_cache_ttl(),
            retries: default_retries(),
            timeout_secs: default_timeout(),
            work_dir: default_work_dir(),
        }
    }
}

impl ClusterConfig {
    /// Read a TOML config file, falling back to defaults when no path is given
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => {
                info!("Reading configuration from {}", path.display());
                let content = fs::read_to_string(path)
                    .with_context(|| format!("failed to read config: {}", path.display()))?;
                toml::from_str(&content)
                    .with_context(|| format!("failed to parse config: {}", path.display()))
            }
            None => {
                debug!("No configuration file given, using defaults");
                Ok(ClusterConfig::default())
            }
        }
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy { attempts: self.retries.max(1) }
    }
}

/// How often a transient scheduler failure is retried within a single cycle
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy { attempts: default_retries() }
    }
}

impl RetryPolicy {
    /// Call `op` until it succeeds, fails permanently, or runs out of attempts
    pub fn run<T, F>(&self, what: &str, mut op: F) -> Result<T, SchedulerError>
    where
        F: FnMut() -> Result<T, SchedulerError>,
    {
        let mut attempt = 1;
        loop {
            match op() {
                Err(err) if err.is_transient() && attempt < self.attempts => {
                    warn!("{what} failed (attempt {attempt} of {}): {err}", self.attempts);
                    attempt += 1;
                }
                result => return result,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_to_missing_fields() {
        let cfg: ClusterConfig = toml::from_str("scheduler = \"slurm\"\nuser = \"albert\"").unwrap();
        assert_eq!(cfg.scheduler, SchedulerKind::Slurm);
        assert_eq!(cfg.user, "albert");
        assert_eq!(cfg.cache_ttl_secs, 60);
        assert_eq!(cfg.retries, 3);
        assert_eq!(cfg.timeout(), Duration::from_secs(30));
        assert_eq!(cfg.work_dir, PathBuf::from("."));
    }

    #[test]
    fn empty_file_is_default_config() {
        let cfg: ClusterConfig = toml::from_str("").unwrap();
        assert_eq!(cfg, ClusterConfig::default());
        assert_eq!(cfg.scheduler, SchedulerKind::HTCondor);
    }

    #[test]
    fn unknown_fields_are_rejected() {
        assert!(toml::from_str::<ClusterConfig>("shedular = \"slurm\"").is_err());
    }

    #[test]
    fn retry_policy_always_makes_one_attempt() {
        let cfg = ClusterConfig { retries: 0, ..Default::default() };
        assert_eq!(cfg.retry_policy().attempts, 1);
    }

    #[test]
    fn transient_failures_are_retried_up_to_the_limit() {
        let mut calls = 0;
        let result: Result<(), _> = RetryPolicy { attempts: 3 }.run("squeue", || {
            calls += 1;
            Err(SchedulerError::Timeout { program: "squeue".into(), after: Duration::from_secs(1) })
        });
        assert!(result.is_err());
        assert_eq!(calls, 3);

        let mut calls = 0;
        let result = RetryPolicy { attempts: 3 }.run("squeue", || {
            calls += 1;
            if calls < 2 {
                Err(SchedulerError::Command { program: "squeue".into(), message: "busy".into() })
            } else {
                Ok(calls)
            }
        });
        assert_eq!(result.unwrap(), 2);
    }

    #[test]
    fn permanent_failures_are_not_retried() {
        let mut calls = 0;
        let result: Result<(), _> = RetryPolicy { attempts: 5 }.run("condor_q", || {
            calls += 1;
            Err(SchedulerError::NotFound("7".into()))
        });
        assert!(matches!(result, Err(SchedulerError::NotFound(_))));
        assert_eq!(calls, 1);
    }

    #[test]
    fn load_reads_toml_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clusterflow.toml");
        fs::write(&path, "partition = \"compute\"\ncache_ttl_secs = 5\n").unwrap();
        let cfg = ClusterConfig::load(Some(&path)).unwrap();
        assert_eq!(cfg.partition.as_deref(), Some("compute"));
        assert_eq!(cfg.cache_ttl(), Duration::from_secs(5));
    }
}
