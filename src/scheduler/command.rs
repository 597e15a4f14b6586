use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::process::{Command, Stdio};
use std::rc::Rc;
use std::time::{Duration, Instant};

use log::{debug, warn};
use wait_timeout::ChildExt;

use crate::error::SchedulerError;

/// Captured result of one scheduler command
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Turn a non-zero exit into a [`SchedulerError::Command`]
    pub fn checked(self, program: &str) -> Result<CommandOutput, SchedulerError> {
        if self.success() {
            Ok(self)
        } else {
            Err(SchedulerError::Command {
                program: program.to_string(),
                message: self.describe_failure(),
            })
        }
    }

    pub fn describe_failure(&self) -> String {
        let detail = if self.stderr.trim().is_empty() { &self.stdout } else { &self.stderr };
        match self.code {
            Some(code) => format!("exit status {code}: {}", detail.trim()),
            None => format!("killed by signal: {}", detail.trim()),
        }
    }
}

/// Runs an external program, giving up after `timeout`.
///
/// Every scheduler interaction goes through this seam, so tests can replace
/// the real cluster tools with scripted replies.
pub trait CommandRunner {
    fn run(&self, program: &str, args: &[String], timeout: Duration) -> Result<CommandOutput, SchedulerError>;
}

impl<R: CommandRunner + ?Sized> CommandRunner for Rc<R> {
    fn run(&self, program: &str, args: &[String], timeout: Duration) -> Result<CommandOutput, SchedulerError> {
        (**self).run(program, args, timeout)
    }
}

/// Spawns real processes.
///
/// Output is captured into anonymous temporary files rather than pipes so a
/// chatty command (e.g. `condor_q -json` on a busy schedd) can never block on
/// a full pipe while we wait for it.
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn run(&self, program: &str, args: &[String], timeout: Duration) -> Result<CommandOutput, SchedulerError> {
        debug!("Running {program} {}", args.join(" "));
        let mut stdout = tempfile::tempfile()?;
        let mut stderr = tempfile::tempfile()?;

        let start = Instant::now();
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout.try_clone()?))
            .stderr(Stdio::from(stderr.try_clone()?))
            .spawn()
            .map_err(|err| SchedulerError::Command {
                program: program.to_string(),
                message: format!("can't start process: {err}"),
            })?;

        let status = match child.wait_timeout(timeout)? {
            Some(status) => status,
            None => {
                warn!("{program} still running after {timeout:?}, killing it");
                // the child may have exited between the timeout and the kill
                let _ = child.kill();
                let _ = child.wait();
                return Err(SchedulerError::Timeout { program: program.to_string(), after: timeout });
            }
        };
        debug!("{program} exited with {status} after {:?}", start.elapsed());

        Ok(CommandOutput {
            code: status.code(),
            stdout: read_back(&mut stdout)?,
            stderr: read_back(&mut stderr)?,
        })
    }
}

fn read_back(file: &mut File) -> Result<String, SchedulerError> {
    file.seek(SeekFrom::Start(0))?;
    let mut bytes = Vec::new();
    file.read_to_end(&mut bytes)?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

/// Scripted stand-in for the cluster tools, used by the scheduler unit tests
#[cfg(test)]
pub(crate) mod fake {
    use std::cell::RefCell;
    use std::collections::VecDeque;

    use super::*;

    pub(crate) enum Reply {
        Output(CommandOutput),
        Timeout,
    }

    pub(crate) fn ok(stdout: &str) -> Reply {
        Reply::Output(CommandOutput { code: Some(0), stdout: stdout.to_string(), stderr: String::new() })
    }

    pub(crate) fn fail(code: i32, stderr: &str) -> Reply {
        Reply::Output(CommandOutput { code: Some(code), stdout: String::new(), stderr: stderr.to_string() })
    }

    #[derive(Default)]
    pub(crate) struct ScriptedRunner {
        replies: RefCell<VecDeque<Reply>>,
        pub(crate) calls: RefCell<Vec<(String, Vec<String>)>>,
    }

    impl ScriptedRunner {
        pub(crate) fn new(replies: Vec<Reply>) -> Rc<Self> {
            Rc::new(ScriptedRunner { replies: RefCell::new(replies.into()), calls: RefCell::default() })
        }

        pub(crate) fn programs(&self) -> Vec<String> {
            self.calls.borrow().iter().map(|(p, _)| p.clone()).collect()
        }

        pub(crate) fn args(&self, call: usize) -> Vec<String> {
            self.calls.borrow()[call].1.clone()
        }
    }

    impl CommandRunner for ScriptedRunner {
        fn run(&self, program: &str, args: &[String], timeout: Duration) -> Result<CommandOutput, SchedulerError> {
            self.calls.borrow_mut().push((program.to_string(), args.to_vec()));
            match self.replies.borrow_mut().pop_front() {
                Some(Reply::Output(output)) => Ok(output),
                Some(Reply::Timeout) => Err(SchedulerError::Timeout { program: program.to_string(), after: timeout }),
                None => panic!("unexpected call to {program} {args:?}"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_runner_captures_output_and_status() {
        let out = SystemRunner
            .run("sh", &["-c".into(), "echo hello; echo oops >&2; exit 3".into()], Duration::from_secs(10))
            .unwrap();
        assert_eq!(out.code, Some(3));
        assert_eq!(out.stdout.trim(), "hello");
        assert_eq!(out.stderr.trim(), "oops");
        assert!(!out.success());
    }

    #[test]
    fn system_runner_times_out() {
        let err = SystemRunner
            .run("sleep", &["5".into()], Duration::from_millis(100))
            .unwrap_err();
        assert!(matches!(err, SchedulerError::Timeout { .. }));
        assert!(err.is_transient());
    }

    #[test]
    fn missing_program_is_a_command_error() {
        let err = SystemRunner
            .run("definitely-not-a-scheduler-tool", &[], Duration::from_secs(1))
            .unwrap_err();
        assert!(matches!(err, SchedulerError::Command { .. }));
    }

    #[test]
    fn checked_reports_stderr() {
        let out = CommandOutput { code: Some(1), stdout: String::new(), stderr: "bad\n".into() };
        let err = out.checked("sbatch").unwrap_err();
        assert_eq!(err.to_string(), "sbatch failed: exit status 1: bad");
    }
}
