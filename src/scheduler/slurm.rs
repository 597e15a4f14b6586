use std::cell::RefCell;
use std::fs;
use std::path::Path;
use std::time::Duration;

use log::{debug, info};

use crate::config::ClusterConfig;
use crate::dag::format::DagFormat;
use crate::dag::slurm::render_batch_script;
use crate::dag::translate;
use crate::error::SchedulerError;
use crate::job::status::{Job, JobStatus};
use crate::job::{JobDescription, JobId};
use crate::scheduler::cache::JobCache;
use crate::scheduler::command::CommandRunner;
use crate::scheduler::{translation_dir, Scheduler, SchedulerKind};

/// id | name | compact state | node list | node count
const SQUEUE_FORMAT: &str = "%i|%j|%t|%N|%D";
const SACCT_FIELDS: &str = "JobID,JobName,State,NNodes";

/// Slurm driven through `sbatch`, `squeue`, `sacct` and `scancel`
pub struct Slurm {
    runner: Box<dyn CommandRunner>,
    user: String,
    partition: Option<String>,
    timeout: Duration,
    cache: RefCell<JobCache>,
}

impl Slurm {
    pub fn new(config: &ClusterConfig, runner: Box<dyn CommandRunner>) -> Self {
        Slurm {
            runner,
            user: config.user.clone(),
            partition: config.partition.clone(),
            timeout: config.timeout(),
            cache: RefCell::new(JobCache::new(config.cache_ttl())),
        }
    }

    fn run(&self, program: &str, args: Vec<String>) -> Result<String, SchedulerError> {
        let output = self.runner.run(program, &args, self.timeout)?.checked(program)?;
        Ok(output.stdout)
    }

    fn sbatch(&self, args: Vec<String>) -> Result<JobId, SchedulerError> {
        let output = self.runner.run("sbatch", &args, self.timeout)?;
        if !output.success() {
            return Err(SchedulerError::Submission(output.describe_failure()));
        }
        parse_submitted_id(&output.stdout)
    }

    fn fetch_all(&self) -> Result<Vec<Job>, SchedulerError> {
        let mut args = vec!["-h".to_string()];
        if !self.user.is_empty() {
            args.extend(["-u".to_string(), self.user.clone()]);
        }
        args.extend(["-o".to_string(), SQUEUE_FORMAT.to_string()]);
        let jobs = parse_rows(&self.run("squeue", args)?)?;
        debug!("squeue reported {} jobs", jobs.len());
        Ok(jobs)
    }

    fn accounting(&self, job_id: &JobId) -> Result<Option<Job>, SchedulerError> {
        let args = ["-n", "-P", "-X", "-j", job_id.as_str(), "-o", SACCT_FIELDS].map(String::from).to_vec();
        Ok(parse_rows(&self.run("sacct", args)?)?.into_iter().next())
    }
}

/// `sbatch --parsable` prints `id` or `id;cluster`; without it, `Submitted batch job id`
fn parse_submitted_id(stdout: &str) -> Result<JobId, SchedulerError> {
    let line = stdout.lines().map(str::trim).find(|l| !l.is_empty()).unwrap_or_default();
    let candidate = line
        .strip_prefix("Submitted batch job")
        .unwrap_or(line)
        .split(';')
        .next()
        .unwrap_or_default()
        .trim();
    if !candidate.is_empty() && candidate.chars().all(|c| c.is_ascii_digit()) {
        Ok(JobId::new(candidate))
    } else {
        Err(SchedulerError::Submission(format!("no job id in sbatch output: {}", stdout.trim())))
    }
}

/// Pipe-separated `squeue`/`sacct` rows: id, name, state, then optionally nodes
fn parse_rows(stdout: &str) -> Result<Vec<Job>, SchedulerError> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| {
            let fields: Vec<&str> = line.split('|').collect();
            if fields.len() < 3 {
                return Err(SchedulerError::Parse(format!("unexpected Slurm row: {line}")));
            }
            let mut job = Job::polled(
                JobId::new(fields[0]),
                SchedulerKind::Slurm,
                JobStatus::from_slurm_state(fields[2]),
            );
            job.name = Some(fields[1].to_string()).filter(|n| !n.is_empty());
            job.hosts = fields.last().and_then(|n| n.trim().parse().ok()).unwrap_or(0);
            Ok(job)
        })
        .collect()
}

impl Scheduler for Slurm {
    fn kind(&self) -> SchedulerKind {
        SchedulerKind::Slurm
    }

    fn submit(&self, job: &JobDescription) -> Result<JobId, SchedulerError> {
        let script = job.sibling_file("sh");
        fs::write(&script, render_batch_script(job, self.partition.as_deref())?)?;
        let id = self.sbatch(vec!["--parsable".to_string(), script.display().to_string()])?;
        info!("Submitted {} as Slurm job {id}", job.display_name());
        Ok(id)
    }

    fn delete(&self, job_id: &JobId) -> Result<(), SchedulerError> {
        let output = self.runner.run("scancel", &[job_id.to_string()], self.timeout)?;
        if output.success() {
            info!("Cancelled Slurm job {job_id}");
            return Ok(());
        }

        let failure = output.describe_failure();
        if failure.contains("Invalid job id") {
            debug!("Slurm job {job_id} already gone");
            Ok(())
        } else {
            Err(SchedulerError::Command { program: "scancel".to_string(), message: failure })
        }
    }

    fn query(&self, job_id: &JobId) -> Result<Job, SchedulerError> {
        let args = ["-h", "-j", job_id.as_str(), "-o", SQUEUE_FORMAT].map(String::from).to_vec();
        let output = self.runner.run("squeue", &args, self.timeout)?;
        if output.success() {
            if let Some(job) = parse_rows(&output.stdout)?.into_iter().next() {
                return Ok(job);
            }
        } else if !output.describe_failure().contains("Invalid job id") {
            return Err(SchedulerError::Command { program: "squeue".to_string(), message: output.describe_failure() });
        }

        // squeue forgets jobs shortly after they end
        debug!("Slurm job {job_id} not in queue, checking accounting");
        self.accounting(job_id)?.ok_or_else(|| SchedulerError::NotFound(job_id.clone()))
    }

    fn query_all_jobs(&self) -> Result<Vec<Job>, SchedulerError> {
        self.cache.borrow_mut().get_or_fetch(|| self.fetch_all())
    }

    fn submit_native_dag(&self, path: &Path, batch_name: &str) -> Result<JobId, SchedulerError> {
        let mut args = vec!["--parsable".to_string(), format!("--job-name={batch_name}")];
        if let Some(partition) = &self.partition {
            args.push(format!("--partition={partition}"));
        }
        args.push(path.display().to_string());
        let id = self.sbatch(args)?;
        info!("Submitted job graph {batch_name} as Slurm job {id}");
        Ok(id)
    }

    /// Native scripts are rewritten too, so every job gets the configured
    /// partition and the wrapper ends with the barrier waiting for the final jobs.
    fn submit_dag(&self, path: &Path, batch_name: &str) -> Result<JobId, SchedulerError> {
        let out_dir = translation_dir(path, batch_name, DagFormat::SlurmScript);
        let script = translate::translate_file(
            path,
            DagFormat::SlurmScript,
            &out_dir,
            batch_name,
            self.partition.as_deref(),
        )?;
        self.submit_native_dag(&script, batch_name)
    }
}

#[cfg(test)]
mod tests {
    use std::rc::Rc;

    use super::*;
    use crate::scheduler::command::fake::{fail, ok, Reply, ScriptedRunner};

    fn slurm(runner: &Rc<ScriptedRunner>) -> Slurm {
        let config = ClusterConfig {
            scheduler: SchedulerKind::Slurm,
            user: "bob".into(),
            partition: Some("compute".into()),
            ..Default::default()
        };
        Slurm::new(&config, Box::new(runner.clone()))
    }

    #[test]
    fn submitted_ids_in_every_output_style() {
        assert_eq!(parse_submitted_id("12345\n").unwrap().as_str(), "12345");
        assert_eq!(parse_submitted_id("12345;cluster1\n").unwrap().as_str(), "12345");
        assert_eq!(parse_submitted_id("Submitted batch job 12345\n").unwrap().as_str(), "12345");
        assert!(parse_submitted_id("sbatch: error: bad\n").is_err());
    }

    #[test]
    fn submit_writes_a_batch_script() {
        let dir = tempfile::tempdir().unwrap();
        let runner = ScriptedRunner::new(vec![ok("777\n")]);
        let job = JobDescription::new("/bin/hostname").with_name("hostname").with_working_dir(dir.path());

        assert_eq!(slurm(&runner).submit(&job).unwrap().as_str(), "777");
        let script = dir.path().join("hostname.sh");
        assert_eq!(runner.args(0), vec!["--parsable".to_string(), script.display().to_string()]);
        let text = fs::read_to_string(script).unwrap();
        assert!(text.contains("#SBATCH --partition=compute"));
        assert!(text.contains("/bin/hostname"));
    }

    #[test]
    fn rejected_submission() {
        let dir = tempfile::tempdir().unwrap();
        let runner = ScriptedRunner::new(vec![fail(1, "sbatch: error: invalid partition")]);
        let job = JobDescription::new("/bin/true").with_working_dir(dir.path());
        assert!(matches!(slurm(&runner).submit(&job), Err(SchedulerError::Submission(_))));
    }

    #[test]
    fn queue_rows_are_parsed_and_cached() {
        let runner = ScriptedRunner::new(vec![ok("101|align|R|node01|1\n102|call|PD||1\n103|merge|S|node02|2\n")]);
        let slurm = slurm(&runner);

        let jobs = slurm.query_all_jobs().unwrap();
        let status: Vec<JobStatus> = jobs.iter().map(|j| j.status).collect();
        assert_eq!(status, vec![JobStatus::Running, JobStatus::Idle, JobStatus::Held]);
        assert_eq!(jobs[2].hosts, 2);

        for _ in 0..3 {
            assert_eq!(slurm.query_all_jobs().unwrap().len(), 3);
        }
        assert_eq!(runner.programs(), vec!["squeue"]);
        assert_eq!(runner.args(0), vec!["-h", "-u", "bob", "-o", SQUEUE_FORMAT]);
    }

    #[test]
    fn finished_jobs_come_from_accounting() {
        let runner = ScriptedRunner::new(vec![
            fail(1, "slurm_load_jobs error: Invalid job id specified"),
            ok("55|align|COMPLETED|1\n"),
        ]);
        let job = slurm(&runner).query(&JobId::from(55u64)).unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(runner.programs(), vec!["squeue", "sacct"]);
    }

    #[test]
    fn aged_out_jobs_are_not_found() {
        let runner = ScriptedRunner::new(vec![ok(""), ok("")]);
        assert!(matches!(slurm(&runner).query(&JobId::from(1u64)), Err(SchedulerError::NotFound(_))));
    }

    #[test]
    fn scancel_of_unknown_job_is_fine() {
        let runner = ScriptedRunner::new(vec![fail(1, "scancel: error: Kill job error on job id 9: Invalid job id specified")]);
        slurm(&runner).delete(&JobId::from(9u64)).unwrap();
        assert_eq!(runner.args(0), vec!["9"]);
    }

    #[test]
    fn squeue_timeout_is_transient() {
        let runner = ScriptedRunner::new(vec![Reply::Timeout]);
        assert!(slurm(&runner).query_all_jobs().unwrap_err().is_transient());
    }

    #[test]
    fn graph_wrapper_is_submitted_with_batch_name() {
        let runner = ScriptedRunner::new(vec![ok("900\n")]);
        let id = slurm(&runner).submit_native_dag(Path::new("/w/run.sh"), "run").unwrap();
        assert_eq!(id.as_str(), "900");
        assert_eq!(runner.args(0), vec!["--parsable", "--job-name=run", "--partition=compute", "/w/run.sh"]);
    }

    #[test]
    fn graph_is_rewritten_with_partition_and_barrier() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.sub"), "executable = /bin/a\nrequest_cpus = 1\nrequest_memory = 100\nqueue\n").unwrap();
        fs::write(dir.path().join("b.sub"), "executable = /bin/b\nrequest_cpus = 1\nrequest_memory = 100\nqueue\n").unwrap();
        let dag = dir.path().join("run.dag");
        fs::write(&dag, "JOB a a.sub\nJOB b b.sub\nPARENT a CHILD b\n").unwrap();
        let runner = ScriptedRunner::new(vec![ok("900\n")]);

        let id = slurm(&runner).submit_dag(&dag, "run").unwrap();

        assert_eq!(id.as_str(), "900");
        let script = dir.path().join("run-slurm").join("run.sh");
        assert_eq!(runner.args(0).last().unwrap(), &script.display().to_string());
        let text = fs::read_to_string(&script).unwrap();
        for name in ["a", "b"] {
            let prefix = format!("job_ids[{name}]=");
            let line = text.lines().find(|l| l.starts_with(&prefix)).unwrap();
            assert!(line.contains("--partition=compute"), "{line}");
        }
        let barrier = text.lines().find(|l| l.contains("--wait")).unwrap();
        assert!(barrier.contains("--dependency=afterok:${job_ids[b]} "));
    }
}
