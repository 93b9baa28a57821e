//! Dependency graph over a project's tasks.

use cimple_core::project::Task;
use cimple_core::{ConfigError, Error, Result};
use petgraph::Direction;
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::{HashMap, HashSet};
use std::fmt::Write;
use std::future::Future;

/// Anything with an id and a list of ids it depends on.
pub trait TaskNode {
    fn id(&self) -> &str;
    fn dependencies(&self) -> &[String];
}

impl TaskNode for Task {
    fn id(&self) -> &str {
        &self.name
    }

    fn dependencies(&self) -> &[String] {
        &self.depends
    }
}

/// Edges point from a dependency to the task that depends on it.
#[derive(Debug)]
pub struct BuildGraph {
    graph: DiGraph<String, ()>,
    name_to_index: HashMap<String, NodeIndex>,
}

impl BuildGraph {
    /// Build the graph, rejecting duplicate ids, unknown dependencies and cycles.
    pub fn populate<T: TaskNode>(tasks: &[T]) -> Result<Self> {
        let mut graph = DiGraph::new();
        let mut name_to_index = HashMap::new();

        for task in tasks {
            let id = task.id().to_string();
            if name_to_index.contains_key(&id) {
                return Err(Error::Config(ConfigError::new(vec![format!(
                    "Duplicate task name: {}",
                    id
                )])));
            }
            let idx = graph.add_node(id.clone());
            name_to_index.insert(id, idx);
        }

        for task in tasks {
            let task_idx = name_to_index[task.id()];
            for dep in task.dependencies() {
                let dep_idx = name_to_index
                    .get(dep)
                    .ok_or_else(|| Error::UnknownDependency(dep.clone()))?;
                graph.update_edge(*dep_idx, task_idx, ());
            }
        }

        toposort(&graph, None)
            .map_err(|cycle| Error::CycleDetected(graph[cycle.node_id()].clone()))?;

        Ok(Self {
            graph,
            name_to_index,
        })
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub fn contains(&self, id: &str) -> bool {
        self.name_to_index.contains_key(id)
    }

    /// Tasks without dependencies, sorted by id.
    pub fn entry_points(&self) -> Vec<&str> {
        let mut entries: Vec<&str> = self
            .graph
            .node_indices()
            .filter(|&idx| {
                self.graph
                    .neighbors_directed(idx, Direction::Incoming)
                    .next()
                    .is_none()
            })
            .map(|idx| self.graph[idx].as_str())
            .collect();
        entries.sort_unstable();
        entries
    }

    /// Direct dependencies of `id`, sorted.
    pub fn sources(&self, id: &str) -> Vec<&str> {
        self.neighbors(id, Direction::Incoming)
    }

    /// Direct dependents of `id`, sorted.
    pub fn targets(&self, id: &str) -> Vec<&str> {
        self.neighbors(id, Direction::Outgoing)
    }

    fn neighbors(&self, id: &str, direction: Direction) -> Vec<&str> {
        let Some(&idx) = self.name_to_index.get(id) else {
            return Vec::new();
        };
        let mut ids: Vec<&str> = self
            .graph
            .neighbors_directed(idx, direction)
            .map(|n| self.graph[n].as_str())
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Order in which [`BuildGraph::build`] runs the tasks.
    ///
    /// Starting from each entry point in order, a node first visits its
    /// dependencies, then runs if it has not run yet, then visits its
    /// dependents. Every node appears exactly once.
    pub fn execution_order(&self) -> Vec<String> {
        let mut built = HashSet::new();
        let mut order = Vec::with_capacity(self.len());
        for entry in self.entry_points() {
            self.visit(entry, &mut built, &mut order);
        }
        order
    }

    fn visit<'a>(&'a self, id: &'a str, built: &mut HashSet<&'a str>, order: &mut Vec<String>) {
        for source in self.sources(id) {
            self.visit(source, built, order);
        }

        if !built.insert(id) {
            return;
        }
        order.push(id.to_string());

        for target in self.targets(id) {
            self.visit(target, built, order);
        }
    }

    /// Run every task once, in dependency order. The first error aborts the build.
    pub async fn build<F, Fut>(&self, mut runner: F) -> Result<()>
    where
        F: FnMut(String) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        for id in self.execution_order() {
            runner(id).await?;
        }
        Ok(())
    }

    /// Render the graph in Graphviz dot format.
    pub fn to_graphviz(&self) -> String {
        let mut names: Vec<&String> = self.name_to_index.keys().collect();
        names.sort();

        let mut dot = String::from("digraph build {\n");
        for name in &names {
            let _ = writeln!(dot, "  \"{}\";", name);
        }
        for name in &names {
            for target in self.targets(name) {
                let _ = writeln!(dot, "  \"{}\" -> \"{}\";", name, target);
            }
        }
        dot.push_str("}\n");
        dot
    }
}
