use std::cell::RefCell;
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use log::{debug, info, warn};
use serde::Deserialize;

use crate::config::ClusterConfig;
use crate::dag::condor::write_submit_file;
use crate::error::SchedulerError;
use crate::job::status::{Job, JobStatus};
use crate::job::{JobDescription, JobId};
use crate::scheduler::cache::JobCache;
use crate::scheduler::command::CommandRunner;
use crate::scheduler::{Scheduler, SchedulerKind};

const ATTRIBUTES: &str = "ClusterId,ProcId,JobStatus,JobBatchName,DAGManJobId,CurrentHosts";

/// The subset of a job ClassAd we read from `condor_q -json`
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ClassAd {
    cluster_id: u64,
    #[serde(default)]
    proc_id: u64,
    job_status: i64,
    #[serde(default)]
    job_batch_name: Option<String>,
    #[serde(rename = "DAGManJobId", default)]
    dagman_job_id: Option<u64>,
    #[serde(default)]
    current_hosts: Option<u32>,
}

impl ClassAd {
    fn into_job(self) -> Job {
        let mut job = Job::polled(
            JobId::from(self.cluster_id),
            SchedulerKind::HTCondor,
            JobStatus::from_htcondor_code(self.job_status),
        );
        job.name = self.job_batch_name;
        job.hosts = self.current_hosts.unwrap_or(0);
        job.dag_id = self.dagman_job_id.map(JobId::from);
        job
    }
}

/// HTCondor driven through `condor_submit`, `condor_q`, `condor_history` and `condor_rm`
pub struct HTCondor {
    runner: Box<dyn CommandRunner>,
    user: String,
    schedd_name: Option<String>,
    timeout: Duration,
    cache: RefCell<JobCache>,
}

impl HTCondor {
    pub fn new(config: &ClusterConfig, runner: Box<dyn CommandRunner>) -> Self {
        HTCondor {
            runner,
            user: config.user.clone(),
            schedd_name: config.schedd_name.clone(),
            timeout: config.timeout(),
            cache: RefCell::new(JobCache::new(config.cache_ttl())),
        }
    }

    /// `-name <schedd>` when a specific schedd is configured
    fn schedd_args(&self) -> Vec<String> {
        match &self.schedd_name {
            Some(name) => vec!["-name".to_string(), name.clone()],
            None => Vec::new(),
        }
    }

    fn run(&self, program: &str, args: Vec<String>) -> Result<String, SchedulerError> {
        let output = self.runner.run(program, &args, self.timeout)?.checked(program)?;
        Ok(output.stdout)
    }

    fn fetch_all(&self) -> Result<Vec<Job>, SchedulerError> {
        let mut args = self.schedd_args();
        if !self.user.is_empty() {
            args.push(self.user.clone());
        }
        args.extend(["-json", "-attributes", ATTRIBUTES].map(String::from));
        let jobs = collapse_clusters(parse_classads(&self.run("condor_q", args)?)?);
        debug!("condor_q reported {} clusters", jobs.len());
        Ok(jobs)
    }
}

/// `condor_q -json` prints nothing at all for an empty queue
fn parse_classads(stdout: &str) -> Result<Vec<ClassAd>, SchedulerError> {
    if stdout.trim().is_empty() {
        return Ok(Vec::new());
    }
    serde_json::from_str(stdout).map_err(|err| SchedulerError::Parse(format!("condor JSON output: {err}")))
}

/// One [`Job`] per cluster. A cluster with several procs reports the status
/// needing the most attention: held, then running, then idle.
fn collapse_clusters(ads: Vec<ClassAd>) -> Vec<Job> {
    let mut clusters: BTreeMap<u64, Vec<ClassAd>> = BTreeMap::new();
    for ad in ads {
        clusters.entry(ad.cluster_id).or_default().push(ad);
    }

    clusters
        .into_values()
        .filter_map(|mut procs| {
            procs.sort_by_key(|ad| ad.proc_id);
            let status = procs
                .iter()
                .map(|ad| JobStatus::from_htcondor_code(ad.job_status))
                .min_by_key(|status| match status {
                    JobStatus::Held => 0,
                    JobStatus::Running => 1,
                    JobStatus::Idle => 2,
                    JobStatus::Unknown => 3,
                    JobStatus::Removed => 4,
                    JobStatus::Completed => 5,
                });
            let hosts: u32 = procs.iter().filter_map(|ad| ad.current_hosts).sum();
            let first = procs.into_iter().next()?;
            let mut job = first.into_job();
            job.status = status.unwrap_or(job.status);
            job.hosts = hosts;
            Some(job)
        })
        .collect()
}

/// Cluster id from `condor_submit` / `condor_submit_dag` output, e.g.
/// `1 job(s) submitted to cluster 4242.`
fn parse_cluster_id(stdout: &str) -> Result<JobId, SchedulerError> {
    stdout
        .lines()
        .find_map(|line| {
            let (_, rest) = line.split_once("submitted to cluster")?;
            let digits: String = rest.trim().chars().take_while(char::is_ascii_digit).collect();
            (!digits.is_empty()).then(|| JobId::new(digits))
        })
        .ok_or_else(|| SchedulerError::Submission(format!("no cluster id in output: {}", stdout.trim())))
}

impl Scheduler for HTCondor {
    fn kind(&self) -> SchedulerKind {
        SchedulerKind::HTCondor
    }

    fn submit(&self, job: &JobDescription) -> Result<JobId, SchedulerError> {
        let submit_file = job.sibling_file("sub");
        write_submit_file(job, &submit_file)?;

        let mut args = self.schedd_args();
        args.push(submit_file.display().to_string());
        let output = self.runner.run("condor_submit", &args, self.timeout)?;
        if !output.success() {
            return Err(SchedulerError::Submission(output.describe_failure()));
        }
        let id = parse_cluster_id(&output.stdout)?;
        info!("Submitted {} as HTCondor cluster {id}", job.display_name());
        Ok(id)
    }

    fn delete(&self, job_id: &JobId) -> Result<(), SchedulerError> {
        let mut args = self.schedd_args();
        args.push(job_id.to_string());
        let output = self.runner.run("condor_rm", &args, self.timeout)?;
        if output.success() {
            info!("Removed HTCondor cluster {job_id}");
            return Ok(());
        }

        let failure = output.describe_failure();
        if failure.contains("Couldn't find") || failure.contains("not found") {
            debug!("Cluster {job_id} already gone from the queue");
            Ok(())
        } else {
            Err(SchedulerError::Command { program: "condor_rm".to_string(), message: failure })
        }
    }

    fn query(&self, job_id: &JobId) -> Result<Job, SchedulerError> {
        let mut args = self.schedd_args();
        args.extend([job_id.to_string(), "-json".into(), "-attributes".into(), ATTRIBUTES.into()]);
        if let Some(job) = collapse_clusters(parse_classads(&self.run("condor_q", args)?)?).pop() {
            return Ok(job);
        }

        // finished jobs leave the queue but stay in history for a while
        debug!("Cluster {job_id} not in queue, checking history");
        let mut args = self.schedd_args();
        args.extend([
            job_id.to_string(),
            "-json".into(),
            "-limit".into(),
            "1".into(),
            "-attributes".into(),
            ATTRIBUTES.into(),
        ]);
        collapse_clusters(parse_classads(&self.run("condor_history", args)?)?)
            .pop()
            .ok_or_else(|| SchedulerError::NotFound(job_id.clone()))
    }

    fn query_all_jobs(&self) -> Result<Vec<Job>, SchedulerError> {
        self.cache.borrow_mut().get_or_fetch(|| self.fetch_all())
    }

    fn submit_native_dag(&self, path: &Path, batch_name: &str) -> Result<JobId, SchedulerError> {
        let mut args = self.schedd_args();
        args.extend(["-batch-name".to_string(), batch_name.to_string(), path.display().to_string()]);
        let output = self.runner.run("condor_submit_dag", &args, self.timeout)?;
        if !output.success() {
            warn!("condor_submit_dag refused {}", path.display());
            return Err(SchedulerError::Submission(output.describe_failure()));
        }
        let id = parse_cluster_id(&output.stdout)?;
        info!("Submitted DAG {batch_name} as HTCondor cluster {id}");
        Ok(id)
    }
}
