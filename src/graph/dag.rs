//! The resource dependency graph and its queries.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::fmt::Write as _;

use petgraph::Direction;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;

/// A node of the resource graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraphNode {
    /// Logical resource name.
    pub name: String,
    /// Resource type.
    pub resource_type: String,
}

/// Why an edge exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeKind {
    /// Inferred from a reference expression.
    Reference,
    /// Declared through `depends_on`.
    Explicit,
}

/// Directed acyclic graph of resources.
///
/// Edges point from a dependency to its dependent. Node indices follow
/// declaration order, which is used to break ties deterministically.
#[derive(Debug, Clone, Default)]
pub struct ResourceGraph {
    pub(super) graph: DiGraph<GraphNode, EdgeKind>,
    pub(super) indices: HashMap<String, NodeIndex>,
    pub(super) order: Vec<NodeIndex>,
}

impl ResourceGraph {
    pub(super) fn add_node(&mut self, name: &str, resource_type: &str) -> NodeIndex {
        let idx = self.graph.add_node(GraphNode {
            name: name.to_string(),
            resource_type: resource_type.to_string(),
        });
        self.indices.insert(name.to_string(), idx);
        idx
    }

    pub(super) fn add_edge(&mut self, dependency: NodeIndex, dependent: NodeIndex, kind: EdgeKind) {
        if self.graph.find_edge(dependency, dependent).is_none() {
            self.graph.add_edge(dependency, dependent, kind);
        }
    }

    /// Computes the deterministic topological order.
    ///
    /// Among ready nodes the earliest declared goes first. Returns `None`
    /// when the graph has a cycle.
    pub(super) fn compute_order(&self) -> Option<Vec<NodeIndex>> {
        let mut in_degree: Vec<usize> = self
            .graph
            .node_indices()
            .map(|n| self.graph.neighbors_directed(n, Direction::Incoming).count())
            .collect();

        let mut ready: BTreeSet<NodeIndex> = self
            .graph
            .node_indices()
            .filter(|n| in_degree[n.index()] == 0)
            .collect();

        let mut order = Vec::with_capacity(self.graph.node_count());
        while let Some(next) = ready.pop_first() {
            order.push(next);
            for dependent in self.graph.neighbors_directed(next, Direction::Outgoing) {
                let degree = &mut in_degree[dependent.index()];
                *degree -= 1;
                if *degree == 0 {
                    ready.insert(dependent);
                }
            }
        }

        (order.len() == self.graph.node_count()).then_some(order)
    }

    fn name_of(&self, idx: NodeIndex) -> &str {
        &self.graph[idx].name
    }

    fn sorted_names(&self, mut nodes: Vec<NodeIndex>) -> Vec<&str> {
        nodes.sort_unstable();
        nodes.dedup();
        nodes.into_iter().map(|n| self.name_of(n)).collect()
    }

    /// Returns the number of resources.
    #[must_use]
    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    /// Returns true if the graph has no resources.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    /// Returns the number of dependency edges.
    #[must_use]
    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// Returns true if the graph contains `name`.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.indices.contains_key(name)
    }

    /// Returns the type of a resource.
    #[must_use]
    pub fn resource_type(&self, name: &str) -> Option<&str> {
        self.indices
            .get(name)
            .map(|&idx| self.graph[idx].resource_type.as_str())
    }

    /// Resource names with every dependency before its dependents.
    #[must_use]
    pub fn topological_order(&self) -> Vec<&str> {
        self.order.iter().map(|&n| self.name_of(n)).collect()
    }

    /// Resource names with every dependent before its dependencies.
    #[must_use]
    pub fn reverse_order(&self) -> Vec<&str> {
        self.order.iter().rev().map(|&n| self.name_of(n)).collect()
    }

    /// Direct dependencies of a resource, in declaration order.
    #[must_use]
    pub fn dependencies(&self, name: &str) -> Vec<&str> {
        self.indices.get(name).map_or_else(Vec::new, |&idx| {
            self.sorted_names(self.graph.neighbors_directed(idx, Direction::Incoming).collect())
        })
    }

    /// Direct dependents of a resource, in declaration order.
    #[must_use]
    pub fn dependents(&self, name: &str) -> Vec<&str> {
        self.indices.get(name).map_or_else(Vec::new, |&idx| {
            self.sorted_names(self.graph.neighbors_directed(idx, Direction::Outgoing).collect())
        })
    }

    /// Every resource that depends on `name` directly or transitively.
    #[must_use]
    pub fn transitive_dependents(&self, name: &str) -> Vec<&str> {
        let Some(&start) = self.indices.get(name) else {
            return Vec::new();
        };

        let mut seen = HashSet::new();
        let mut queue = VecDeque::from([start]);
        while let Some(current) = queue.pop_front() {
            for next in self.graph.neighbors_directed(current, Direction::Outgoing) {
                if seen.insert(next) {
                    queue.push_back(next);
                }
            }
        }

        self.order
            .iter()
            .filter(|n| seen.contains(n))
            .map(|&n| self.name_of(n))
            .collect()
    }

    /// Groups resources into layers that may run concurrently.
    ///
    /// Every resource sits one layer after its deepest dependency.
    #[must_use]
    pub fn layers(&self) -> Vec<Vec<&str>> {
        let mut depth = vec![0usize; self.graph.node_count()];
        let mut layers: Vec<Vec<&str>> = Vec::new();

        for &idx in &self.order {
            let level = self
                .graph
                .neighbors_directed(idx, Direction::Incoming)
                .map(|d| depth[d.index()] + 1)
                .max()
                .unwrap_or(0);
            depth[idx.index()] = level;
            if layers.len() <= level {
                layers.resize_with(level + 1, Vec::new);
            }
            layers[level].push(self.name_of(idx));
        }

        layers
    }

    /// Renders the graph in Graphviz DOT format.
    #[must_use]
    pub fn to_dot(&self) -> String {
        let mut output = String::from("digraph resources {\n  rankdir=LR;\n  node [shape=box];\n\n");

        for &idx in &self.order {
            let node = &self.graph[idx];
            let _ = writeln!(
                output,
                "  \"{}\" [label=\"{}\\n{}\"];",
                node.name, node.name, node.resource_type
            );
        }

        output.push('\n');

        for edge in self.graph.edge_references() {
            let style = match edge.weight() {
                EdgeKind::Reference => "solid",
                EdgeKind::Explicit => "dashed",
            };
            let _ = writeln!(
                output,
                "  \"{}\" -> \"{}\" [style={style}];",
                self.name_of(edge.source()),
                self.name_of(edge.target())
            );
        }

        output.push_str("}\n");
        output
    }
}
