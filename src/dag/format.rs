use std::fmt;
use std::fs;
use std::path::Path;

use log::debug;

use crate::error::DagError;

/// How many non-blank lines are inspected before giving up
const DETECTION_WINDOW: usize = 50;

/// The two job graph text formats
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum DagFormat {
    /// HTCondor DAGMan: declarative `JOB` / `PARENT ... CHILD ...` lines
    DagMan,
    /// Bash script issuing `sbatch` calls chained with `--dependency`
    SlurmScript,
}

impl DagFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            DagFormat::DagMan => "dag",
            DagFormat::SlurmScript => "sh",
        }
    }

    pub fn slug(&self) -> &'static str {
        match self {
            DagFormat::DagMan => "dagman",
            DagFormat::SlurmScript => "slurm",
        }
    }
}

impl fmt::Display for DagFormat {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            DagFormat::DagMan => write!(f, "DAGMan file"),
            DagFormat::SlurmScript => write!(f, "Slurm script"),
        }
    }
}

/// Identify the format from the first marker line found, or `None` if there is none
pub fn detect(text: &str) -> Option<DagFormat> {
    for line in text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .take(DETECTION_WINDOW)
    {
        let keyword = line.split_whitespace().next().unwrap_or_default().to_ascii_uppercase();
        if matches!(keyword.as_str(), "JOB" | "PARENT" | "CHILD") {
            return Some(DagFormat::DagMan);
        }
        if line.starts_with("#SBATCH") {
            return Some(DagFormat::SlurmScript);
        }
        // a comment that merely mentions sbatch is not an invocation
        if line.starts_with('#') {
            continue;
        }
        if invokes_sbatch(line) {
            return Some(DagFormat::SlurmScript);
        }
    }
    None
}

pub(crate) fn invokes_sbatch(line: &str) -> bool {
    line.split(|c: char| c.is_whitespace() || "();=`|&".contains(c))
        .any(|word| word == "sbatch" || word.ends_with("/sbatch"))
}

/// Read a file and detect its format; never guesses
pub fn detect_file(path: &Path) -> Result<DagFormat, DagError> {
    let text = fs::read_to_string(path).map_err(|err| DagError::io(path, err))?;
    let format = detect(&text).ok_or_else(|| DagError::FormatDetection(path.to_path_buf()))?;
    debug!("{} looks like a {format}", path.display());
    Ok(format)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dagman_keywords_are_detected() {
        assert_eq!(detect("# comment\n\nJOB a a.sub\n"), Some(DagFormat::DagMan));
        assert_eq!(detect("   parent a child b"), Some(DagFormat::DagMan));
        assert_eq!(detect("Job a a.sub"), Some(DagFormat::DagMan));
    }

    #[test]
    fn sbatch_directives_and_invocations_are_detected() {
        assert_eq!(detect("#!/bin/bash\n#SBATCH --job-name=x\n"), Some(DagFormat::SlurmScript));
        assert_eq!(
            detect("#!/bin/bash\nA=$(sbatch --parsable --wrap=\"echo\")\n"),
            Some(DagFormat::SlurmScript)
        );
        assert_eq!(detect("/usr/bin/sbatch job.sh"), Some(DagFormat::SlurmScript));
    }

    #[test]
    fn comments_mentioning_sbatch_do_not_count() {
        assert_eq!(detect("#!/bin/bash\n# run sbatch later\necho hi\n"), None);
    }

    #[test]
    fn unrelated_text_is_not_guessed() {
        assert_eq!(detect(""), None);
        assert_eq!(detect("hello world\nexecutable = /bin/echo\nqueue\n"), None);
        assert_eq!(detect("jobless = true"), None);
    }

    #[test]
    fn markers_beyond_the_window_are_ignored() {
        let mut text = "echo filler\n".repeat(DETECTION_WINDOW);
        text.push_str("JOB a a.sub\n");
        assert_eq!(detect(&text), None);
    }

    #[test]
    fn detect_file_reports_the_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mystery.txt");
        fs::write(&path, "nothing to see\n").unwrap();
        match detect_file(&path).unwrap_err() {
            DagError::FormatDetection(p) => assert_eq!(p, path),
            other => panic!("unexpected {other:?}"),
        }
    }
}
