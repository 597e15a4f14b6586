//! HTCondor DAGMan files and the submit descriptions they reference
//!
//! A DAGMan file declares nodes with `JOB <name> <submit file> [DIR <dir>]`
//! and edges with `PARENT <names...> CHILD <names...>`. Each submit file is
//! a list of `key = value` pairs ending in `queue`.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, info, warn};
use serde::Serialize;

use crate::dag::{render, DependencyGraph, GraphBuilder};
use crate::error::DagError;
use crate::job::{parse_megabytes, resolve, sanitise, JobDescription};

static SUBMIT: &str = include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/data/templates/condor_submit.txt"));

/// Rendering context for a submit description
#[derive(Serialize)]
struct SubmitContext {
    name: String,
    executable: String,
    arguments: String,
    working_dir: String,
    output: Option<String>,
    error: Option<String>,
    log: Option<String>,
    cpus: u32,
    memory_mb: u64,
    disk_mb: Option<u64>,
    gpus: Option<u32>,
    batch_name: Option<String>,
    getenv: bool,
    resources_defaulted: bool,
}

fn display(path: &Option<PathBuf>) -> Option<String> {
    path.as_ref().map(|p| p.display().to_string())
}

/// Render a submit description for one job
pub fn render_submit(job: &JobDescription) -> Result<String, DagError> {
    let context = SubmitContext {
        name: job.display_name().to_string(),
        executable: job.executable.display().to_string(),
        arguments: format_arguments(&job.arguments),
        working_dir: job.working_dir.display().to_string(),
        output: display(&job.output),
        error: display(&job.error),
        log: display(&job.log),
        cpus: job.resources.cpus,
        memory_mb: job.resources.memory_mb,
        disk_mb: job.resources.disk_mb,
        gpus: job.resources.gpus,
        batch_name: job.batch_name.clone(),
        getenv: job.getenv,
        resources_defaulted: job.resources_defaulted,
    };
    render("condor_submit", SUBMIT, &context)
}

pub fn write_submit_file(job: &JobDescription, path: &Path) -> Result<(), DagError> {
    let content = render_submit(job)?;
    info!("Writing submit description to {}", path.display());
    fs::write(path, content).map_err(|err| DagError::io(path, err))
}

/// Format an argument list in HTCondor's quoted ("new") syntax, without the outer double quotes
pub fn format_arguments(args: &[String]) -> String {
    args.iter()
        .map(|arg| {
            let arg = arg.replace('"', "\"\"");
            if arg.is_empty() || arg.contains(|c: char| c.is_whitespace() || c == '\'') {
                format!("'{}'", arg.replace('\'', "''"))
            } else {
                arg
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Split an `arguments` value in either HTCondor syntax.
///
/// Quoted ("new") syntax groups words with single quotes, doubling a quote
/// character to include it literally. Unquoted ("old") syntax is plain
/// whitespace separation.
pub fn parse_arguments(value: &str) -> Result<Vec<String>, String> {
    let value = value.trim();
    let inner = match value.strip_prefix('"').and_then(|v| v.strip_suffix('"')) {
        Some(inner) if value.len() >= 2 => inner,
        _ => return Ok(value.split_whitespace().map(str::to_string).collect()),
    };

    let mut args = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut chars = inner.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '"' if chars.peek() == Some(&'"') => {
                chars.next();
                current.push('"');
                in_word = true;
            }
            '\'' => {
                in_word = true;
                loop {
                    match chars.next() {
                        Some('\'') if chars.peek() == Some(&'\'') => {
                            chars.next();
                            current.push('\'');
                        }
                        Some('\'') => break,
                        Some('"') if chars.peek() == Some(&'"') => {
                            chars.next();
                            current.push('"');
                        }
                        Some(c) => current.push(c),
                        None => return Err("unterminated single quote in arguments".to_string()),
                    }
                }
            }
            c if c.is_whitespace() => {
                if in_word {
                    args.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            c => {
                current.push(c);
                in_word = true;
            }
        }
    }
    if in_word {
        args.push(current);
    }
    Ok(args)
}

/// Join `\`-continued lines, remembering the line number each logical line starts on
pub(crate) fn logical_lines(text: &str) -> Vec<(usize, String)> {
    let mut lines = Vec::new();
    let mut pending: Option<(usize, String)> = None;

    for (idx, raw) in text.lines().enumerate() {
        let (start, mut line) = pending.take().unwrap_or((idx + 1, String::new()));
        match raw.trim_end().strip_suffix('\\') {
            Some(head) => {
                line.push_str(head);
                line.push(' ');
                pending = Some((start, line));
            }
            None => {
                line.push_str(raw);
                lines.push((start, line));
            }
        }
    }
    if let Some(rest) = pending {
        lines.push(rest);
    }
    lines
}

fn parse_bool(value: &str) -> bool {
    matches!(value.trim().to_ascii_lowercase().as_str(), "true" | "t" | "yes" | "1")
}

/// Parse a submit description into a [`JobDescription`].
///
/// Relative paths are kept as written; `initialdir` becomes the working directory.
pub fn parse_submit_file(path: &Path) -> Result<JobDescription, DagError> {
    let text = fs::read_to_string(path).map_err(|err| DagError::io(path, err))?;
    parse_submit(&text, path)
}

pub(crate) fn parse_submit(text: &str, path: &Path) -> Result<JobDescription, DagError> {
    let mut job = JobDescription::new("");
    let mut executable = None;
    let mut last_line = 0;

    for (line_no, line) in logical_lines(text) {
        last_line = line_no;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if line.split_whitespace().next().map(str::to_ascii_lowercase).as_deref() == Some("queue") {
            break;
        }
        let Some((key, value)) = line.split_once('=') else {
            return Err(DagError::parse(path, line_no, format!("expected `key = value`, found `{line}`")));
        };
        let key = key.trim().to_ascii_lowercase();
        let value = value.trim();
        let invalid = |what: &str| DagError::parse(path, line_no, format!("invalid {what} `{value}`"));

        match key.as_str() {
            "executable" => executable = Some(PathBuf::from(value)),
            "arguments" | "args" => {
                job.arguments = parse_arguments(value).map_err(|msg| DagError::parse(path, line_no, msg))?
            }
            "initialdir" | "initial_dir" => job.working_dir = PathBuf::from(value),
            "output" => job.output = Some(PathBuf::from(value)),
            "error" => job.error = Some(PathBuf::from(value)),
            "log" => job.log = Some(PathBuf::from(value)),
            "request_cpus" => job.resources.cpus = value.parse().map_err(|_| invalid("request_cpus"))?,
            "request_memory" => {
                job.resources.memory_mb = parse_megabytes(value).ok_or_else(|| invalid("request_memory"))?
            }
            "request_disk" => {
                // a bare request_disk number is KiB, unlike request_memory
                let mb = if value.chars().all(|c| c.is_ascii_digit()) {
                    value.parse::<u64>().ok().map(|kb| kb.div_ceil(1024))
                } else {
                    parse_megabytes(value)
                };
                job.resources.disk_mb = Some(mb.ok_or_else(|| invalid("request_disk"))?);
            }
            "request_gpus" => job.resources.gpus = Some(value.parse().map_err(|_| invalid("request_gpus"))?),
            "batch_name" | "+jobbatchname" => job.batch_name = Some(value.trim_matches('"').to_string()),
            "getenv" => job.getenv = parse_bool(value),
            other => debug!("{}: ignoring submit key {other}", path.display()),
        }
    }

    job.executable = executable
        .ok_or_else(|| DagError::parse(path, last_line, "submit description has no executable"))?;
    Ok(job)
}

/// Parse a DAGMan file, reading every referenced submit description
pub fn parse_dag_file(path: &Path) -> Result<DependencyGraph, DagError> {
    let text = fs::read_to_string(path).map_err(|err| DagError::io(path, err))?;
    let base = path.parent().unwrap_or_else(|| Path::new("."));
    let mut builder = GraphBuilder::new();

    for (line_no, line) in logical_lines(&text) {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        let Some(keyword) = tokens.first() else { continue };
        if keyword.starts_with('#') {
            continue;
        }

        match keyword.to_ascii_uppercase().as_str() {
            "JOB" => {
                let (name, submit) = match (tokens.get(1), tokens.get(2)) {
                    (Some(name), Some(submit)) => (*name, *submit),
                    _ => return Err(DagError::parse(path, line_no, "JOB needs a name and a submit file")),
                };
                let dir = tokens
                    .iter()
                    .position(|t| t.eq_ignore_ascii_case("DIR"))
                    .and_then(|i| tokens.get(i + 1))
                    .map(|d| resolve(base, Path::new(d)));
                let node_base = dir.clone().unwrap_or_else(|| base.to_path_buf());

                let mut job = parse_submit_file(&resolve(&node_base, Path::new(submit)))?;
                if let Some(dir) = dir {
                    job.working_dir = resolve(&dir, &job.working_dir);
                }
                builder.add_job(name, job)?;
            }
            "PARENT" => {
                let split = tokens
                    .iter()
                    .position(|t| t.eq_ignore_ascii_case("CHILD"))
                    .ok_or_else(|| DagError::parse(path, line_no, "PARENT without CHILD"))?;
                let parents = &tokens[1..split];
                let children = &tokens[split + 1..];
                if parents.is_empty() || children.is_empty() {
                    return Err(DagError::parse(path, line_no, "PARENT and CHILD each need at least one job"));
                }
                for parent in parents {
                    for child in children {
                        builder.add_edge(parent, child, line_no);
                    }
                }
            }
            "SUBDAG" | "SPLICE" => {
                return Err(DagError::parse(path, line_no, format!("{keyword} is not supported")));
            }
            other => warn!("{}:{line_no}: ignoring {other} line", path.display()),
        }
    }

    builder.build()
}

/// Write a DAGMan file and one submit description per job into `out_dir`.
///
/// Returns the path of the DAGMan file.
pub fn write_dag(graph: &DependencyGraph, out_dir: &Path, dag_name: &str) -> Result<PathBuf, DagError> {
    fs::create_dir_all(out_dir).map_err(|err| DagError::io(out_dir, err))?;
    let out_dir = fs::canonicalize(out_dir).map_err(|err| DagError::io(out_dir, err))?;

    let mut dag = format!(
        "# DAGMan description of {dag_name}: {} jobs, {} dependencies\n",
        graph.len(),
        graph.edges().len()
    );

    // distinct node names can sanitise to the same file name
    let mut stems = HashSet::new();
    for node in graph.topological() {
        let base = sanitise(&node.name);
        let mut stem = base.clone();
        let mut suffix = 1;
        while !stems.insert(stem.clone()) {
            suffix += 1;
            stem = format!("{base}-{suffix}");
        }
        let submit = out_dir.join(format!("{stem}.sub"));
        if node.description.resources_defaulted {
            warn!("{}: resources were not recoverable, submitting with defaults (1 CPU, 1 GB)", node.name);
        }
        write_submit_file(&node.description, &submit)?;
        dag.push_str(&format!("JOB {} {}\n", node.name, submit.display()));
    }

    for (parent, child) in graph.edges() {
        dag.push_str(&format!("PARENT {parent} CHILD {child}\n"));
    }

    let path = out_dir.join(format!("{}.dag", sanitise(dag_name)));
    info!("Writing DAGMan file to {}", path.display());
    fs::write(&path, dag).map_err(|err| DagError::io(&path, err))?;
    Ok(path)
}
