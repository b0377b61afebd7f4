//! Construction of the resource graph from declarations or recorded state.

use std::collections::{HashMap, HashSet, VecDeque};

use petgraph::Direction;
use petgraph::algo::tarjan_scc;
use petgraph::graph::NodeIndex;
use tracing::debug;

use crate::error::GraphError;
use crate::resource::ResourceDeclaration;
use crate::state::DeploymentState;

use super::dag::{EdgeKind, ResourceGraph};

impl ResourceGraph {
    /// Builds the graph from declarations.
    ///
    /// Names are registered before any edge is added, so a reference may
    /// point at a resource declared further down the file.
    ///
    /// # Errors
    ///
    /// Returns a [`GraphError`] for duplicate names, self references,
    /// malformed or unknown references and cycles.
    pub fn build(declarations: &[ResourceDeclaration]) -> Result<Self, GraphError> {
        let mut graph = Self::default();

        for decl in declarations {
            if graph.contains(&decl.name) {
                return Err(GraphError::DuplicateName {
                    name: decl.name.clone(),
                });
            }
            graph.add_node(&decl.name, &decl.resource_type);
        }

        for decl in declarations {
            let dependent = graph.indices[&decl.name];

            let inferred = decl
                .references()?
                .into_iter()
                .map(|r| (r.reference.resource.clone(), r.reference.to_string(), EdgeKind::Reference));
            let explicit = decl
                .depends_on
                .iter()
                .map(|name| (name.clone(), name.clone(), EdgeKind::Explicit));

            for (target, reference, kind) in inferred.chain(explicit) {
                if target == decl.name {
                    return Err(GraphError::SelfReference {
                        resource: decl.name.clone(),
                    });
                }
                let Some(&dependency) = graph.indices.get(&target) else {
                    return Err(GraphError::UnknownReference {
                        resource: decl.name.clone(),
                        reference,
                        target,
                    });
                };
                graph.add_edge(dependency, dependent, kind);
            }
        }

        graph.finish()?;
        debug!(
            resources = graph.len(),
            edges = graph.edge_count(),
            "Built resource graph"
        );
        Ok(graph)
    }

    /// Builds the graph of resources recorded in state.
    ///
    /// Recorded dependencies on resources no longer tracked are ignored.
    ///
    /// # Errors
    ///
    /// Returns [`GraphError::CyclicDependency`] if the recorded dependencies
    /// form a cycle.
    pub fn from_state(state: &DeploymentState) -> Result<Self, GraphError> {
        let mut graph = Self::default();

        let mut entries: Vec<_> = state.resources.iter().collect();
        entries.sort_by(|(a_name, a), (b_name, b)| a.sequence.cmp(&b.sequence).then(a_name.cmp(b_name)));

        for (name, resource) in &entries {
            graph.add_node(name, &resource.resource_type);
        }

        for (name, resource) in &entries {
            let dependent = graph.indices[name.as_str()];
            for dep in &resource.dependencies {
                if let Some(&dependency) = graph.indices.get(dep) {
                    graph.add_edge(dependency, dependent, EdgeKind::Reference);
                }
            }
        }

        graph.finish()?;
        Ok(graph)
    }

    fn finish(&mut self) -> Result<(), GraphError> {
        if let Some(cycle) = self.find_cycle() {
            return Err(GraphError::CyclicDependency { cycle });
        }
        self.order = self.compute_order().ok_or_else(|| GraphError::CyclicDependency {
            cycle: String::from("unknown"),
        })?;
        Ok(())
    }

    /// Finds one cycle and renders it as `A -> B -> A`, where each arrow
    /// reads "depends on".
    fn find_cycle(&self) -> Option<String> {
        let component = tarjan_scc(&self.graph)
            .into_iter()
            .filter(|scc| scc.len() > 1)
            .min_by_key(|scc| scc.iter().min().copied())?;

        let members: HashSet<NodeIndex> = component.iter().copied().collect();
        let start = component.iter().min().copied()?;

        // BFS over "depends on" edges inside the component until we return to start.
        let mut parent: HashMap<NodeIndex, NodeIndex> = HashMap::new();
        let mut queue = VecDeque::from([start]);
        let mut closing = None;
        while let Some(current) = queue.pop_front() {
            let mut deps: Vec<NodeIndex> = self
                .graph
                .neighbors_directed(current, Direction::Incoming)
                .filter(|n| members.contains(n))
                .collect();
            deps.sort_unstable();

            if deps.contains(&start) {
                closing = Some(current);
                break;
            }
            for dep in deps {
                if dep != start && !parent.contains_key(&dep) {
                    parent.insert(dep, current);
                    queue.push_back(dep);
                }
            }
        }

        let mut path = vec![closing?];
        while let Some(&prev) = path.last().and_then(|n| parent.get(n)) {
            path.push(prev);
        }
        path.reverse();
        path.push(start);

        Some(
            path.iter()
                .map(|&n| self.graph[n].name.as_str())
                .collect::<Vec<_>>()
                .join(" -> "),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn decl(name: &str, refs: &[&str]) -> ResourceDeclaration {
        let mut d = ResourceDeclaration::new(name, "AWS::EC2::Subnet");
        for (i, r) in refs.iter().enumerate() {
            d = d.with_property(format!("Ref{i}"), json!(format!("${{{r}.id}}")));
        }
        d
    }

    #[test]
    fn test_topological_order_respects_dependencies() {
        let decls = vec![
            decl("Route", &["RouteTable", "Igw"]),
            decl("Vpc", &[]),
            decl("RouteTable", &["Vpc"]),
            decl("Igw", &[]),
        ];
        let graph = ResourceGraph::build(&decls).unwrap();
        assert_eq!(graph.topological_order(), vec!["Vpc", "RouteTable", "Igw", "Route"]);
        assert_eq!(graph.reverse_order(), vec!["Route", "Igw", "RouteTable", "Vpc"]);
        assert_eq!(graph.dependencies("Route"), vec!["RouteTable", "Igw"]);
        assert_eq!(graph.dependents("Vpc"), vec!["RouteTable"]);
    }

    #[test]
    fn test_forward_reference_resolves() {
        let decls = vec![decl("Listener", &["TargetGroup"]), decl("TargetGroup", &[])];
        let graph = ResourceGraph::build(&decls).unwrap();
        assert_eq!(graph.topological_order(), vec!["TargetGroup", "Listener"]);
    }

    #[test]
    fn test_unknown_reference() {
        let decls = vec![decl("Subnet", &["Vpcc"])];
        let err = ResourceGraph::build(&decls).unwrap_err();
        assert_eq!(
            err,
            GraphError::UnknownReference {
                resource: String::from("Subnet"),
                reference: String::from("${Vpcc.id}"),
                target: String::from("Vpcc"),
            }
        );
    }

    #[test]
    fn test_unknown_depends_on() {
        let decls = vec![decl("Route", &[]).with_depends_on("Attachment")];
        let err = ResourceGraph::build(&decls).unwrap_err();
        assert!(matches!(err, GraphError::UnknownReference { ref target, .. } if target == "Attachment"));
    }

    #[test]
    fn test_two_resource_cycle() {
        let decls = vec![decl("A", &["B"]), decl("B", &["A"])];
        let err = ResourceGraph::build(&decls).unwrap_err();
        assert_eq!(
            err,
            GraphError::CyclicDependency {
                cycle: String::from("A -> B -> A")
            }
        );
    }

    #[test]
    fn test_longer_cycle_path() {
        let decls = vec![
            decl("Root", &[]),
            decl("A", &["C", "Root"]),
            decl("B", &["A"]),
            decl("C", &["B"]),
        ];
        let err = ResourceGraph::build(&decls).unwrap_err();
        assert_eq!(
            err,
            GraphError::CyclicDependency {
                cycle: String::from("A -> C -> B -> A")
            }
        );
    }

    #[test]
    fn test_self_reference_and_duplicates() {
        let err = ResourceGraph::build(&[decl("A", &["A"])]).unwrap_err();
        assert!(matches!(err, GraphError::SelfReference { .. }));

        let err = ResourceGraph::build(&[decl("A", &[]), decl("A", &[])]).unwrap_err();
        assert!(matches!(err, GraphError::DuplicateName { .. }));
    }

    #[test]
    fn test_layers_and_transitive_dependents() {
        let decls = vec![
            decl("Vpc", &[]),
            decl("SubnetA", &["Vpc"]),
            decl("SubnetB", &["Vpc"]),
            decl("Lb", &["SubnetA", "SubnetB"]),
            decl("Bucket", &[]),
        ];
        let graph = ResourceGraph::build(&decls).unwrap();
        assert_eq!(
            graph.layers(),
            vec![vec!["Vpc", "Bucket"], vec!["SubnetA", "SubnetB"], vec!["Lb"]]
        );
        assert_eq!(graph.transitive_dependents("Vpc"), vec!["SubnetA", "SubnetB", "Lb"]);
        assert!(graph.transitive_dependents("Bucket").is_empty());
        assert!(graph.to_dot().contains("\"Vpc\" -> \"SubnetA\""));
    }
}
