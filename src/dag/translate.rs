use std::path::{Path, PathBuf};

use log::info;

use crate::dag::format::{detect_file, DagFormat};
use crate::dag::{condor, slurm, DependencyGraph};
use crate::error::DagError;
use crate::job::resolve;

/// Detect the format of a job graph file and parse it
pub fn load(path: &Path) -> Result<(DagFormat, DependencyGraph), DagError> {
    let format = detect_file(path)?;
    let graph = match format {
        DagFormat::DagMan => condor::parse_dag_file(path)?,
        DagFormat::SlurmScript => slurm::parse_script_file(path)?,
    };
    info!("Read {} jobs and {} dependencies from {format} {}", graph.len(), graph.edges().len(), path.display());
    Ok((format, graph))
}

/// Write `graph` in `format` under `out_dir`, returning the file to submit.
/// `partition` is given to every Slurm job that names none; DAGMan ignores it.
pub fn write(
    graph: &DependencyGraph,
    format: DagFormat,
    out_dir: &Path,
    batch_name: &str,
    partition: Option<&str>,
) -> Result<PathBuf, DagError> {
    match format {
        DagFormat::DagMan => condor::write_dag(graph, out_dir, batch_name),
        DagFormat::SlurmScript => slurm::write_script(graph, out_dir, batch_name, partition),
    }
}

/// Relative working directories are taken from where the source file lives,
/// so the translated graph runs the same from wherever it is written.
fn anchor(graph: &DependencyGraph, source: &Path) -> Result<DependencyGraph, DagError> {
    let base = source.parent().unwrap_or(Path::new("."));
    let jobs = graph.topological().map(|node| {
        let mut job = node.description.clone();
        job.working_dir = resolve(base, &job.working_dir);
        job.dependencies = node.predecessors.iter().cloned().collect();
        job
    });
    DependencyGraph::from_jobs(jobs)
}

/// Convert the job graph at `path` into `target`.
///
/// Translating to the format the file is already in is allowed and simply
/// rewrites it, which normalises layout.
pub fn translate_file(
    path: &Path,
    target: DagFormat,
    out_dir: &Path,
    batch_name: &str,
    partition: Option<&str>,
) -> Result<PathBuf, DagError> {
    let (source, graph) = load(path)?;
    let graph = anchor(&graph, path)?;
    let written = write(&graph, target, out_dir, batch_name, partition)?;
    info!("Translated {source} {} into {target} {}", path.display(), written.display());
    Ok(written)
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    #[test]
    fn dagman_translates_to_slurm_and_back() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.sub"), "executable = /bin/a\nrequest_cpus = 2\nrequest_memory = 4GB\nqueue\n").unwrap();
        fs::write(dir.path().join("b.sub"), "executable = /bin/b\nqueue\n").unwrap();
        let dag = dir.path().join("pipeline.dag");
        fs::write(&dag, "JOB a a.sub\nJOB b b.sub\nPARENT a CHILD b\n").unwrap();

        let script = translate_file(&dag, DagFormat::SlurmScript, &dir.path().join("slurm"), "pipeline", None).unwrap();
        assert_eq!(script.extension().unwrap(), "sh");
        let text = fs::read_to_string(&script).unwrap();
        assert!(text.contains("--cpus-per-task=2 --mem=4096"));

        let back = translate_file(&script, DagFormat::DagMan, &dir.path().join("dagman"), "pipeline", None).unwrap();
        let (format, graph) = load(&back).unwrap();
        assert_eq!(format, DagFormat::DagMan);
        let (_, original) = load(&dag).unwrap();
        assert!(graph.same_dependencies(&original));
        assert_eq!(graph.node("a").unwrap().description.resources.memory_mb, 4096);
    }

    #[test]
    fn relative_working_dirs_follow_the_source() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("run.sh");
        fs::write(&script, "A=$(sbatch --parsable -c 1 --mem=100 --wrap=\"cd data && ./go\")\n").unwrap();

        let dag = translate_file(&script, DagFormat::DagMan, dir.path(), "run", None).unwrap();
        let (_, graph) = load(&dag).unwrap();
        assert_eq!(graph.node("A").unwrap().description.working_dir, dir.path().join("data"));
    }

    #[test]
    fn unrecognised_files_are_refused() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.txt");
        fs::write(&path, "nothing here\n").unwrap();
        assert!(matches!(
            translate_file(&path, DagFormat::DagMan, dir.path(), "x", None),
            Err(DagError::FormatDetection(_))
        ));
    }
}
