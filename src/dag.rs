//! Scheduler-neutral job graphs and their two native text formats
//!
//! A [`DependencyGraph`] is only ever built through [`GraphBuilder::build`],
//! which rejects unknown nodes and dependency cycles, so every graph in hand
//! has a valid topological order.

/// Detect which native format a job graph file is written in
pub mod format;
/// HTCondor DAGMan files and submit descriptions
pub mod condor;
/// Slurm submission scripts chaining `sbatch --dependency`
pub mod slurm;
/// Convert a job graph file from one format to the other
pub mod translate;

use std::collections::{BTreeSet, HashMap};

use indexmap::{IndexMap, IndexSet};
use serde::Serialize;
use tinytemplate::TinyTemplate;

use crate::error::DagError;
use crate::job::JobDescription;

/// One job in a graph and the jobs it waits for
#[derive(Clone, Debug, PartialEq)]
pub struct GraphNode {
    pub name: String,
    pub description: JobDescription,
    /// Direct predecessors, in the order they were declared
    pub predecessors: IndexSet<String>,
}

/// Collects jobs and edges in declaration order before validating them
#[derive(Debug, Default)]
pub struct GraphBuilder {
    nodes: IndexMap<String, GraphNode>,
    /// (parent, child, source line)
    edges: Vec<(String, String, usize)>,
}

impl GraphBuilder {
    pub fn new() -> Self {
        GraphBuilder::default()
    }

    pub fn add_job(&mut self, name: &str, mut description: JobDescription) -> Result<(), DagError> {
        if self.nodes.contains_key(name) {
            return Err(DagError::DuplicateNode(name.to_string()));
        }
        description.name = Some(name.to_string());
        let node = GraphNode { name: name.to_string(), description, predecessors: IndexSet::new() };
        self.nodes.insert(name.to_string(), node);
        Ok(())
    }

    /// Record that `child` waits for `parent`; both are resolved in [`GraphBuilder::build`]
    pub fn add_edge(&mut self, parent: &str, child: &str, line: usize) {
        self.edges.push((parent.to_string(), child.to_string(), line));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.nodes.contains_key(name)
    }

    pub fn build(mut self) -> Result<DependencyGraph, DagError> {
        for (parent, child, line) in std::mem::take(&mut self.edges) {
            if !self.nodes.contains_key(&parent) {
                return Err(DagError::UnknownNode { name: parent, line });
            }
            match self.nodes.get_mut(&child) {
                Some(node) => {
                    node.predecessors.insert(parent);
                }
                None => return Err(DagError::UnknownNode { name: child, line }),
            }
        }

        let order = topological_order(&self.nodes)?;
        Ok(DependencyGraph { nodes: self.nodes, order })
    }
}

/// Kahn's algorithm. Among ready nodes the earliest declared goes first, so the
/// same input always yields the same order.
fn topological_order(nodes: &IndexMap<String, GraphNode>) -> Result<Vec<usize>, DagError> {
    let mut in_degree = vec![0usize; nodes.len()];
    let mut successors: Vec<Vec<usize>> = vec![Vec::new(); nodes.len()];

    for (child, node) in nodes.values().enumerate() {
        for parent in &node.predecessors {
            // build() has already checked that every parent exists
            if let Some(parent) = nodes.get_index_of(parent) {
                successors[parent].push(child);
                in_degree[child] += 1;
            }
        }
    }

    let mut ready: BTreeSet<usize> = (0..nodes.len()).filter(|&i| in_degree[i] == 0).collect();
    let mut order = Vec::with_capacity(nodes.len());

    while let Some(next) = ready.pop_first() {
        order.push(next);
        for &succ in &successors[next] {
            in_degree[succ] -= 1;
            if in_degree[succ] == 0 {
                ready.insert(succ);
            }
        }
    }

    if order.len() < nodes.len() {
        let stuck = nodes
            .values()
            .enumerate()
            .filter(|(i, _)| in_degree[*i] > 0)
            .map(|(_, node)| node.name.clone())
            .collect();
        return Err(DagError::Cycle(stuck));
    }
    Ok(order)
}

/// Validated, acyclic job graph
#[derive(Clone, Debug)]
pub struct DependencyGraph {
    nodes: IndexMap<String, GraphNode>,
    order: Vec<usize>,
}

impl DependencyGraph {
    /// Build a graph from named job descriptions, using their `dependencies` as edges
    pub fn from_jobs<I>(jobs: I) -> Result<Self, DagError>
    where
        I: IntoIterator<Item = JobDescription>,
    {
        let mut builder = GraphBuilder::new();
        let mut unnamed = 0;
        for job in jobs {
            let name = match &job.name {
                Some(name) => name.clone(),
                None => {
                    unnamed += 1;
                    format!("job{unnamed}")
                }
            };
            for parent in &job.dependencies {
                builder.add_edge(parent, &name, 0);
            }
            builder.add_job(&name, job)?;
        }
        builder.build()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, name: &str) -> Option<&GraphNode> {
        self.nodes.get(name)
    }

    /// Nodes in declaration order
    pub fn nodes(&self) -> impl Iterator<Item = &GraphNode> {
        self.nodes.values()
    }

    /// Nodes ordered so every job comes after all of its predecessors
    pub fn topological(&self) -> impl Iterator<Item = &GraphNode> {
        self.order.iter().filter_map(|&i| self.nodes.get_index(i).map(|(_, node)| node))
    }

    /// (parent, child) pairs, children in topological order
    pub fn edges(&self) -> Vec<(&str, &str)> {
        self.topological()
            .flat_map(|node| {
                node.predecessors
                    .iter()
                    .map(move |parent| (parent.as_str(), node.name.as_str()))
            })
            .collect()
    }

    /// Nodes no other job depends on, in topological order
    pub fn sinks(&self) -> Vec<&GraphNode> {
        let parents: BTreeSet<&str> = self.edges().into_iter().map(|(parent, _)| parent).collect();
        self.topological().filter(|node| !parents.contains(node.name.as_str())).collect()
    }

    pub fn node_names(&self) -> BTreeSet<String> {
        self.nodes.keys().cloned().collect()
    }

    pub fn edge_set(&self) -> BTreeSet<(String, String)> {
        self.edges()
            .into_iter()
            .map(|(p, c)| (p.to_string(), c.to_string()))
            .collect()
    }

    /// Same jobs and same dependencies, regardless of text layout or job details
    pub fn same_dependencies(&self, other: &DependencyGraph) -> bool {
        self.node_names() == other.node_names() && self.edge_set() == other.edge_set()
    }

    /// Topological position of each node, for ordering checks
    pub fn positions(&self) -> HashMap<&str, usize> {
        self.topological()
            .enumerate()
            .map(|(i, node)| (node.name.as_str(), i))
            .collect()
    }
}

/// Render one of the bundled templates without HTML escaping
pub(crate) fn render<C: Serialize>(name: &'static str, template: &'static str, context: &C) -> Result<String, DagError> {
    let mut tt = TinyTemplate::new();
    tt.set_default_formatter(&tinytemplate::format_unescaped);
    tt.add_template(name, template)?;
    Ok(tt.render(name, context)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(name: &str, deps: &[&str]) -> JobDescription {
        let mut job = JobDescription::new("/bin/true").with_name(name);
        job.dependencies = deps.iter().map(|d| d.to_string()).collect();
        job
    }

    #[test]
    fn diamond_orders_parents_first() {
        let graph = DependencyGraph::from_jobs(vec![
            job("A", &[]),
            job("B", &["A"]),
            job("C", &["A"]),
            job("D", &["B", "C"]),
        ])
        .unwrap();

        let pos = graph.positions();
        assert!(pos["A"] < pos["B"]);
        assert!(pos["A"] < pos["C"]);
        assert!(pos["B"] < pos["D"]);
        assert!(pos["C"] < pos["D"]);
        assert_eq!(graph.edges().len(), 4);
    }

    #[test]
    fn sinks_are_jobs_without_dependents() {
        let graph = DependencyGraph::from_jobs(vec![
            job("A", &[]),
            job("B", &["A"]),
            job("lone", &[]),
            job("C", &["A"]),
        ])
        .unwrap();
        let sinks: Vec<&str> = graph.sinks().iter().map(|node| node.name.as_str()).collect();
        assert_eq!(sinks, vec!["B", "lone", "C"]);
    }

    #[test]
    fn ties_keep_declaration_order() {
        let graph = DependencyGraph::from_jobs(vec![
            job("late", &["root"]),
            job("root", &[]),
            job("early", &["root"]),
            job("independent", &[]),
        ])
        .unwrap();

        let order: Vec<&str> = graph.topological().map(|n| n.name.as_str()).collect();
        assert_eq!(order, vec!["root", "late", "early", "independent"]);
    }

    #[test]
    fn cycles_are_rejected() {
        let err = DependencyGraph::from_jobs(vec![job("A", &["C"]), job("B", &["A"]), job("C", &["B"])])
            .unwrap_err();
        match err {
            DagError::Cycle(names) => assert_eq!(names, vec!["A", "B", "C"]),
            other => panic!("expected a cycle, got {other:?}"),
        }
    }

    #[test]
    fn two_node_cycle_is_rejected() {
        let mut builder = GraphBuilder::new();
        builder.add_job("A", JobDescription::new("/bin/true")).unwrap();
        builder.add_job("B", JobDescription::new("/bin/true")).unwrap();
        builder.add_edge("A", "B", 3);
        builder.add_edge("B", "A", 4);
        assert!(matches!(builder.build(), Err(DagError::Cycle(_))));
    }

    #[test]
    fn self_dependency_is_a_cycle() {
        assert!(matches!(DependencyGraph::from_jobs(vec![job("A", &["A"])]), Err(DagError::Cycle(_))));
    }

    #[test]
    fn unknown_parent_reports_line() {
        let mut builder = GraphBuilder::new();
        builder.add_job("B", JobDescription::new("/bin/true")).unwrap();
        builder.add_edge("ghost", "B", 7);
        match builder.build().unwrap_err() {
            DagError::UnknownNode { name, line } => {
                assert_eq!(name, "ghost");
                assert_eq!(line, 7);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn duplicate_jobs_are_rejected() {
        let mut builder = GraphBuilder::new();
        builder.add_job("A", JobDescription::new("/bin/true")).unwrap();
        assert!(matches!(
            builder.add_job("A", JobDescription::new("/bin/false")),
            Err(DagError::DuplicateNode(_))
        ));
    }

    #[test]
    fn single_job_has_no_edges() {
        let graph = DependencyGraph::from_jobs(vec![job("solo", &[])]).unwrap();
        assert_eq!(graph.len(), 1);
        assert!(graph.edges().is_empty());
    }

    #[test]
    fn repeated_edges_collapse() {
        let mut builder = GraphBuilder::new();
        builder.add_job("A", JobDescription::new("/bin/true")).unwrap();
        builder.add_job("B", JobDescription::new("/bin/true")).unwrap();
        builder.add_edge("A", "B", 1);
        builder.add_edge("A", "B", 2);
        assert_eq!(builder.build().unwrap().edges(), vec![("A", "B")]);
    }
}
