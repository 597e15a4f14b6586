//! Slurm submission scripts
//!
//! Slurm has no job graph file of its own, so a graph is expressed as a bash
//! script that submits each job in topological order, capturing the id
//! `sbatch --parsable` prints into a shell variable:
//!
//! ```text
//! job_ids[analyse]=$(sbatch --parsable --dependency=afterok:${job_ids[align]} --wrap="cd /w && ./analyse")
//! ```
//!
//! The script ends with a blocking `sbatch --wait` that depends on every job
//! without dependents, so the wrapper job finishes with the graph.
//!
//! Parsing maps each such variable back to a node and each dependency
//! reference back to an edge.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, info, warn};
use serde::Serialize;

use crate::dag::condor::logical_lines;
use crate::dag::format::invokes_sbatch;
use crate::dag::{render, DependencyGraph, GraphBuilder, GraphNode};
use crate::error::DagError;
use crate::job::{parse_megabytes, sanitise, JobDescription, DEFAULT_CPUS, DEFAULT_MEMORY_MB};
use crate::shell;

static BATCH: &str = include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/data/templates/slurm_batch.txt"));
static DAG_HEADER: &str = include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/data/templates/slurm_dag_header.txt"));

const BARRIER_MEMORY_MB: u64 = 16;

/// Rendering context for a single-job batch script
#[derive(Serialize)]
struct BatchContext {
    name: String,
    partition: Option<String>,
    output: Option<String>,
    error: Option<String>,
    cpus: u32,
    memory_mb: u64,
    gpus: Option<u32>,
    getenv: bool,
    working_dir: String,
    command: String,
}

/// Rendering context for the wrapper script header
#[derive(Serialize)]
struct HeaderContext {
    batch_name: String,
    partition: Option<String>,
    job_count: usize,
}

/// Render a batch script running one job. `partition` applies when the job names none.
pub fn render_batch_script(job: &JobDescription, partition: Option<&str>) -> Result<String, DagError> {
    let mut command = vec![job.executable.display().to_string()];
    command.extend(job.arguments.iter().cloned());

    let context = BatchContext {
        name: job.display_name().to_string(),
        partition: job.resources.partition.clone().or(partition.map(str::to_string)),
        output: job.output.as_ref().map(|p| p.display().to_string()),
        error: job.error.as_ref().map(|p| p.display().to_string()),
        cpus: job.resources.cpus,
        memory_mb: job.resources.memory_mb,
        gpus: job.resources.gpus,
        getenv: job.getenv,
        working_dir: shell::quote(&job.working_dir.display().to_string()),
        command: shell::join(&command),
    };
    render("slurm_batch", BATCH, &context)
}

/// Shell variable holding the id of `name`'s submission
fn variable(name: &str) -> String {
    format!("job_ids[{name}]")
}

/// `${job_ids[a]}:${job_ids[b]}` for the given nodes
fn references<'a>(names: impl Iterator<Item = &'a str>) -> String {
    names.map(|name| format!("${{{}}}", variable(name))).collect::<Vec<_>>().join(":")
}

/// `partition` applies when the job names none
fn submission_line(node: &GraphNode, partition: Option<&str>) -> String {
    let job = &node.description;
    let mut args = vec![
        "sbatch".to_string(),
        "--parsable".to_string(),
        format!("--job-name={}", shell::quote(&node.name)),
    ];
    if let Some(partition) = job.resources.partition.as_deref().or(partition) {
        args.push(format!("--partition={}", shell::quote(partition)));
    }
    if let Some(output) = &job.output {
        args.push(format!("--output={}", shell::quote(&output.display().to_string())));
    }
    if let Some(error) = &job.error {
        args.push(format!("--error={}", shell::quote(&error.display().to_string())));
    }
    args.push(format!("--cpus-per-task={}", job.resources.cpus));
    args.push(format!("--mem={}", job.resources.memory_mb));
    if let Some(gpus) = job.resources.gpus {
        args.push(format!("--gres=gpu:{gpus}"));
    }
    if job.getenv {
        args.push("--export=ALL".to_string());
    }
    if !node.predecessors.is_empty() {
        args.push(format!("--dependency=afterok:{}", references(node.predecessors.iter().map(String::as_str))));
    }

    let mut command = vec![job.executable.display().to_string()];
    command.extend(job.arguments.iter().cloned());
    let wrapped = format!(
        "cd {} && {}",
        shell::quote(&job.working_dir.display().to_string()),
        shell::join(&command)
    );
    args.push(format!("--wrap=\"{}\"", shell::escape_double_quoted(&wrapped)));

    format!("{}=$({})\n", variable(&node.name), args.join(" "))
}

/// Blocking submission that keeps the wrapper job alive until every final job
/// has succeeded, so the wrapper's own job id stands for the whole graph. A
/// failed job leaves the barrier with an unsatisfiable dependency, which
/// cancels it and fails the wrapper under `set -e`.
fn barrier_line(graph: &DependencyGraph, batch_name: &str, partition: Option<&str>) -> String {
    let mut args = vec![
        "sbatch".to_string(),
        "--parsable".to_string(),
        "--wait".to_string(),
        "--kill-on-invalid-dep=yes".to_string(),
        format!("--job-name={}-done", sanitise(batch_name)),
    ];
    if let Some(partition) = partition {
        args.push(format!("--partition={}", shell::quote(partition)));
    }
    args.push("--cpus-per-task=1".to_string());
    args.push(format!("--mem={BARRIER_MEMORY_MB}"));
    let sinks = graph.sinks();
    args.push(format!("--dependency=afterok:{}", references(sinks.iter().map(|node| node.name.as_str()))));
    args.push("--wrap=\"true\"".to_string());
    format!("\n# Wait for the final jobs\n{}\n", args.join(" "))
}

/// Whether an `sbatch` call is the wrapper's barrier rather than a job of the graph
fn is_barrier(invocation: &Invocation) -> bool {
    invocation.options.iter().any(|(key, _)| key == "--wait" || key == "-W")
}

/// Render a wrapper script submitting every job in topological order
pub fn render_script(graph: &DependencyGraph, batch_name: &str, partition: Option<&str>) -> Result<String, DagError> {
    let header = HeaderContext {
        batch_name: sanitise(batch_name),
        partition: partition.map(str::to_string),
        job_count: graph.len(),
    };
    let mut script = render("slurm_dag_header", DAG_HEADER, &header)?;

    for node in graph.topological() {
        if node.description.resources_defaulted {
            warn!("{}: resources were not recoverable, submitting with defaults (1 CPU, 1 GB)", node.name);
            script.push_str(&format!(
                "# {}: resources could not be recovered from the source graph; requesting defaults (1 CPU, 1 GB)\n",
                node.name
            ));
        }
        script.push_str(&submission_line(node, partition));
    }
    if !graph.is_empty() {
        script.push_str(&barrier_line(graph, batch_name, partition));
    }
    script.push_str(&format!("\necho \"Submitted {} jobs for {}\"\n", graph.len(), sanitise(batch_name)));
    Ok(script)
}

/// Write the wrapper script for `graph` into `out_dir`, returning its path
pub fn write_script(
    graph: &DependencyGraph,
    out_dir: &Path,
    batch_name: &str,
    partition: Option<&str>,
) -> Result<PathBuf, DagError> {
    fs::create_dir_all(out_dir).map_err(|err| DagError::io(out_dir, err))?;
    let path = out_dir.join(format!("{}.sh", sanitise(batch_name)));
    let script = render_script(graph, batch_name, partition)?;
    info!("Writing Slurm submission script to {}", path.display());
    fs::write(&path, script).map_err(|err| DagError::io(&path, err))?;
    Ok(path)
}

/// Text inside the first `$( ... )`, honouring quotes and nested parentheses
fn command_substitution(line: &str) -> Option<(usize, &str)> {
    let start = line.find("$(")?;
    let body = &line[start + 2..];
    let mut depth = 1;
    let mut quote: Option<char> = None;
    let mut escaped = false;

    for (i, c) in body.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match (quote, c) {
            (Some('\''), '\'') => quote = None,
            (Some('\''), _) => {}
            (_, '\\') => escaped = true,
            (Some('"'), '"') => quote = None,
            (Some(_), _) => {}
            (None, '\'' | '"') => quote = Some(c),
            (None, '(') => depth += 1,
            (None, ')') => {
                depth -= 1;
                if depth == 0 {
                    return Some((start, &body[..i]));
                }
            }
            _ => {}
        }
    }
    None
}

/// `${job_ids[a]}`, `$A` or `${A}` reduced to the variable expression (`job_ids[a]`, `A`)
fn variable_reference(token: &str) -> Option<&str> {
    let rest = token.strip_prefix('$')?;
    let rest = rest
        .strip_prefix('{')
        .and_then(|r| r.strip_suffix('}'))
        .unwrap_or(rest);
    (!rest.is_empty()).then_some(rest)
}

/// Node name for the variable a submission is assigned to
fn node_name(variable: &str) -> &str {
    match (variable.find('['), variable.strip_suffix(']')) {
        (Some(open), Some(trimmed)) => &trimmed[open + 1..],
        _ => variable,
    }
}

/// Options taking a separate value when not written as `--opt=value`
fn takes_value(option: &str) -> bool {
    matches!(
        option,
        "-J" | "--job-name" | "-o" | "--output" | "-e" | "--error" | "-c" | "--cpus-per-task"
            | "--mem" | "-p" | "--partition" | "-d" | "--dependency" | "-D" | "--chdir" | "--gres"
            | "--wrap" | "-A" | "--account" | "-t" | "--time" | "-N" | "--nodes" | "-n" | "--ntasks"
            | "-q" | "--qos"
    )
}

/// `-c4` split into `-c` and `4`, for the short options taking a value
fn glued_short_option(word: &str) -> Option<(&str, &str)> {
    if word.starts_with("--") || word.len() <= 2 {
        return None;
    }
    let option = word.get(..2)?;
    (option.starts_with('-') && takes_value(option)).then(|| (option, &word[2..]))
}

struct Invocation {
    options: Vec<(String, String)>,
    script: Vec<String>,
}

fn parse_invocation(words: &[String]) -> Invocation {
    let mut options = Vec::new();
    let mut script = Vec::new();
    let mut iter = words.iter().skip(1);

    while let Some(word) = iter.next() {
        if !script.is_empty() {
            script.push(word.clone());
        } else if let Some((key, value)) = word.split_once('=').filter(|_| word.starts_with('-')) {
            options.push((key.to_string(), value.to_string()));
        } else if let Some((key, value)) = glued_short_option(word) {
            options.push((key.to_string(), value.to_string()));
        } else if word.starts_with('-') {
            let value = if takes_value(word) { iter.next().cloned().unwrap_or_default() } else { String::new() };
            options.push((word.clone(), value));
        } else {
            script.push(word.clone());
        }
    }
    Invocation { options, script }
}

/// Turn a `--wrap` command back into working directory, executable and arguments
fn unwrap_command(job: &mut JobDescription, command: &str) -> Result<(), String> {
    let mut command = command.trim();
    let mut words = shell::split(command)?;
    if words.len() >= 3 && words[0] == "cd" && words[2] == "&&" {
        job.working_dir = PathBuf::from(&words[1]);
        words.drain(..3);
        command = command.split_once("&&").map_or("", |(_, rest)| rest.trim());
    }

    let compound = words.iter().any(|w| matches!(w.as_str(), "&&" | "||" | ";" | "|"));
    if compound || words.is_empty() {
        job.executable = PathBuf::from("/bin/bash");
        job.arguments = vec!["-c".to_string(), command.to_string()];
    } else {
        job.executable = PathBuf::from(&words[0]);
        job.arguments = words[1..].to_vec();
    }
    Ok(())
}

/// Parse a submission script from disk
pub fn parse_script_file(path: &Path) -> Result<DependencyGraph, DagError> {
    let text = fs::read_to_string(path).map_err(|err| DagError::io(path, err))?;
    parse_script(&text, path)
}

/// Parse a submission script; `path` is only used in error messages
pub fn parse_script(text: &str, path: &Path) -> Result<DependencyGraph, DagError> {
    let mut builder = GraphBuilder::new();
    // shell variable expression -> node name
    let mut variables: HashMap<String, String> = HashMap::new();
    let mut anonymous = 0;

    for (line_no, line) in logical_lines(text) {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || !invokes_sbatch(line) {
            continue;
        }

        let (variable_expr, command) = match command_substitution(line) {
            Some((start, command)) if line[..start].ends_with('=') => {
                let lhs = line[..start - 1].trim();
                let lhs = lhs.strip_prefix("export ").or(lhs.strip_prefix("local ")).unwrap_or(lhs).trim();
                (Some(lhs.to_string()), command.to_string())
            }
            _ => (None, line.to_string()),
        };

        let words = shell::split(&command).map_err(|msg| DagError::parse(path, line_no, msg))?;
        let Some(sbatch_at) = words.iter().position(|w| w == "sbatch" || w.ends_with("/sbatch")) else {
            continue;
        };
        let invocation = parse_invocation(&words[sbatch_at..]);
        if is_barrier(&invocation) {
            debug!("{}:{line_no}: blocking sbatch call is not a job of the graph", path.display());
            continue;
        }

        let name = match &variable_expr {
            Some(expr) => node_name(expr).to_string(),
            None => {
                anonymous += 1;
                let name = invocation
                    .options
                    .iter()
                    .find(|(k, _)| k == "--job-name" || k == "-J")
                    .map(|(_, v)| v.clone())
                    .unwrap_or_else(|| format!("job{anonymous}"));
                warn!("{}:{line_no}: sbatch result is not captured, naming the job {name}", path.display());
                name
            }
        };

        let mut job = JobDescription::new("");
        let mut cpus = None;
        let mut memory = None;
        let mut wrap = None;

        for (key, value) in &invocation.options {
            let invalid = || DagError::parse(path, line_no, format!("invalid {key} `{value}`"));
            match key.as_str() {
                "--wrap" => wrap = Some(value.clone()),
                "-c" | "--cpus-per-task" => cpus = Some(value.parse::<u32>().map_err(|_| invalid())?),
                "--mem" => memory = Some(parse_megabytes(value).ok_or_else(invalid)?),
                "-o" | "--output" => job.output = Some(PathBuf::from(value)),
                "-e" | "--error" => job.error = Some(PathBuf::from(value)),
                "-p" | "--partition" => job.resources.partition = Some(value.clone()),
                "-D" | "--chdir" => job.working_dir = PathBuf::from(value),
                "--export" => job.getenv = value.eq_ignore_ascii_case("ALL"),
                "--gres" => {
                    if let Some(count) = value.strip_prefix("gpu:") {
                        let count = count.rsplit(':').next().unwrap_or(count);
                        job.resources.gpus = Some(count.parse().map_err(|_| invalid())?);
                    }
                }
                "-d" | "--dependency" => {
                    for condition in value.split([',', '?']) {
                        let mut parts = condition.split(':');
                        let kind = parts.next().unwrap_or_default();
                        if kind != "afterok" {
                            warn!("{}:{line_no}: treating `{kind}` dependency of {name} as afterok", path.display());
                        }
                        for reference in parts {
                            match variable_reference(reference) {
                                Some(var) => match variables.get(var) {
                                    Some(parent) => builder.add_edge(parent, &name, line_no),
                                    None => {
                                        return Err(DagError::UnknownNode { name: var.to_string(), line: line_no })
                                    }
                                },
                                None => warn!(
                                    "{}:{line_no}: {name} depends on literal job id {reference}, which can't be translated",
                                    path.display()
                                ),
                            }
                        }
                    }
                }
                _ => {}
            }
        }

        match (wrap, invocation.script.split_first()) {
            (Some(command), _) => {
                unwrap_command(&mut job, &command).map_err(|msg| DagError::parse(path, line_no, msg))?
            }
            (None, Some((script, args))) => {
                job.executable = PathBuf::from(script);
                job.arguments = args.to_vec();
            }
            (None, None) => {
                return Err(DagError::parse(path, line_no, "sbatch call has neither --wrap nor a job script"))
            }
        }

        if cpus.is_none() || memory.is_none() {
            warn!(
                "{}:{line_no}: no per-job resources for {name}, assuming {DEFAULT_CPUS} CPU and {DEFAULT_MEMORY_MB} MB",
                path.display()
            );
            job.resources_defaulted = true;
        }
        job.resources.cpus = cpus.unwrap_or(DEFAULT_CPUS);
        job.resources.memory_mb = memory.unwrap_or(DEFAULT_MEMORY_MB);

        builder.add_job(&name, job)?;
        if let Some(expr) = variable_expr {
            variables.insert(expr, name);
        }
    }

    builder.build()
}
