use std::fs;
use std::path::Path;

use clusterflow::dag::format::DagFormat;
use clusterflow::dag::{condor, slurm, translate, DependencyGraph};
use clusterflow::error::DagError;
use clusterflow::job::JobDescription;

fn write_submit(dir: &Path, name: &str, extra: &str) {
    let text = format!("executable = /opt/bin/{name}\narguments = \"--sample s1\"\n{extra}queue\n");
    fs::write(dir.join(format!("{name}.sub")), text).unwrap();
}

fn three_step_dag(dir: &Path) -> std::path::PathBuf {
    write_submit(dir, "align", "request_cpus = 4\nrequest_memory = 8GB\n");
    write_submit(dir, "analyse", "request_cpus = 2\nrequest_memory = 2048\n");
    write_submit(dir, "postprocess", "request_cpus = 1\nrequest_memory = 512\n");
    let dag = dir.join("pipeline.dag");
    fs::write(
        &dag,
        "JOB align align.sub\nJOB analyse analyse.sub\nJOB postprocess postprocess.sub\n\
         PARENT align CHILD analyse\nPARENT analyse CHILD postprocess\n",
    )
    .unwrap();
    dag
}

#[test]
fn linear_dagman_graph_becomes_chained_sbatch_calls() {
    let dir = tempfile::tempdir().unwrap();
    let dag = three_step_dag(dir.path());

    let script = translate::translate_file(&dag, DagFormat::SlurmScript, &dir.path().join("out"), "pipeline", None).unwrap();
    let text = fs::read_to_string(&script).unwrap();

    let dependent: Vec<&str> =
        text.lines().filter(|l| l.starts_with("job_ids[") && l.contains("--dependency=")).collect();
    assert_eq!(dependent.len(), 2);
    for line in &dependent {
        assert_eq!(line.matches("${job_ids[").count(), 1, "{line}");
    }
    assert!(dependent[0].starts_with("job_ids[analyse]="));
    assert!(dependent[0].contains("--dependency=afterok:${job_ids[align]}"));
    assert!(dependent[1].starts_with("job_ids[postprocess]="));
    assert!(dependent[1].contains("--dependency=afterok:${job_ids[analyse]}"));

    // submitted in dependency order
    let align = text.find("job_ids[align]=").unwrap();
    let analyse = text.find("job_ids[analyse]=").unwrap();
    let postprocess = text.find("job_ids[postprocess]=").unwrap();
    assert!(align < analyse && analyse < postprocess);
    assert!(text.contains("--cpus-per-task=4 --mem=8192"));
    assert!(text.contains("--wait --kill-on-invalid-dep=yes --job-name=pipeline-done"));
    assert!(text.contains("--dependency=afterok:${job_ids[postprocess]} --wrap=\"true\""));
}

#[test]
fn sbatch_script_with_two_parents() {
    let text = "#!/bin/bash\n\
                declare -A job_ids\n\
                job_ids[a]=$(sbatch --parsable -c 1 --mem=100 --wrap=\"/bin/a\")\n\
                job_ids[b]=$(sbatch --parsable -c 1 --mem=100 --wrap=\"/bin/b\")\n\
                job_ids[x]=$(sbatch --parsable -c 2 --mem=200 \\\n    --dependency=afterok:${job_ids[a]}:${job_ids[b]} --wrap=\"/bin/x\")\n";
    let graph = slurm::parse_script(text, Path::new("two_parents.sh")).unwrap();

    assert_eq!(graph.len(), 3);
    let x = graph.node("x").unwrap();
    let preds: Vec<&str> = x.predecessors.iter().map(String::as_str).collect();
    assert_eq!(preds, vec!["a", "b"]);
    assert!(graph.node("a").unwrap().predecessors.is_empty());
    assert_eq!(x.description.resources.cpus, 2);
}

#[test]
fn single_job_graph_in_both_formats() {
    let dir = tempfile::tempdir().unwrap();
    let job = JobDescription::new("/bin/hostname").with_name("only").with_working_dir(dir.path());
    let graph = DependencyGraph::from_jobs(vec![job]).unwrap();

    for format in [DagFormat::DagMan, DagFormat::SlurmScript] {
        let out = dir.path().join(format.slug());
        let path = translate::write(&graph, format, &out, "single", None).unwrap();
        let (detected, back) = translate::load(&path).unwrap();
        assert_eq!(detected, format);
        assert_eq!(back.len(), 1);
        assert!(back.edges().is_empty());
        assert!(back.same_dependencies(&graph));
    }
}

#[test]
fn round_trip_through_slurm_keeps_the_graph() {
    let dir = tempfile::tempdir().unwrap();
    let dag = three_step_dag(dir.path());
    let original = condor::parse_dag_file(&dag).unwrap();

    let script = translate::translate_file(&dag, DagFormat::SlurmScript, &dir.path().join("slurm"), "pipeline", None).unwrap();
    let back = translate::translate_file(&script, DagFormat::DagMan, &dir.path().join("dagman"), "pipeline", None).unwrap();
    let graph = condor::parse_dag_file(&back).unwrap();

    assert!(graph.same_dependencies(&original));
    for name in ["align", "analyse", "postprocess"] {
        let before = &original.node(name).unwrap().description;
        let after = &graph.node(name).unwrap().description;
        assert_eq!(after.executable, before.executable);
        assert_eq!(after.arguments, before.arguments);
        assert_eq!(after.resources, before.resources);
    }
}

#[test]
fn translation_is_deterministic() {
    let dir = tempfile::tempdir().unwrap();
    let dag = three_step_dag(dir.path());
    let out = dir.path().join("out");

    let first = fs::read_to_string(translate::translate_file(&dag, DagFormat::SlurmScript, &out, "p", None).unwrap()).unwrap();
    let second = fs::read_to_string(translate::translate_file(&dag, DagFormat::SlurmScript, &out, "p", None).unwrap()).unwrap();
    assert_eq!(first, second);

    let script = out.join("p.sh");
    let dagman = dir.path().join("dagman");
    let first = fs::read_to_string(translate::translate_file(&script, DagFormat::DagMan, &dagman, "p", None).unwrap()).unwrap();
    let second = fs::read_to_string(translate::translate_file(&script, DagFormat::DagMan, &dagman, "p", None).unwrap()).unwrap();
    assert_eq!(first, second);
}

#[test]
fn cyclic_dagman_file_is_refused() {
    let dir = tempfile::tempdir().unwrap();
    write_submit(dir.path(), "a", "");
    write_submit(dir.path(), "b", "");
    let dag = dir.path().join("loop.dag");
    fs::write(&dag, "JOB a a.sub\nJOB b b.sub\nPARENT a CHILD b\nPARENT b CHILD a\n").unwrap();

    match translate::translate_file(&dag, DagFormat::SlurmScript, dir.path(), "loop", None) {
        Err(DagError::Cycle(nodes)) => assert_eq!(nodes, vec!["a".to_string(), "b".to_string()]),
        other => panic!("expected a cycle, got {other:?}"),
    }
}
