//! Property-based tests for dependency ordering.
//!
//! Random DAGs are declared in random order; creation must never precede a
//! dependency and destruction must never follow one.

use std::collections::BTreeMap;
use std::sync::Arc;

use cumulus::config::{DeployConfig, ExecutionConfig, ProjectConfig, ProviderConfig, RetryConfig, StateConfig};
use cumulus::engine::Engine;
use cumulus::graph::ResourceGraph;
use cumulus::provider::{MemoryProvider, ProviderOperation};
use cumulus::resource::ResourceDeclaration;
use cumulus::state::LocalStateStore;
use proptest::prelude::*;
use serde_json::json;
use tempfile::TempDir;

/// Generate a DAG as a list of (dependent, dependency) pairs over `n` nodes.
fn arb_dag() -> impl Strategy<Value = (usize, Vec<(usize, usize)>)> {
    (2usize..10).prop_flat_map(|n| {
        let pairs = prop::collection::vec((0..n, 0..n), 0..(n * 2));
        pairs.prop_map(move |raw| {
            let mut edges: Vec<(usize, usize)> = raw
                .into_iter()
                .filter(|(a, b)| a != b)
                .map(|(a, b)| (a.max(b), a.min(b)))
                .collect();
            edges.sort_unstable();
            edges.dedup();
            (n, edges)
        })
    })
}

fn node(i: usize) -> String {
    format!("R{i}")
}

/// Declares the nodes in reverse index order, so most references point forward.
fn declarations(n: usize, edges: &[(usize, usize)]) -> Vec<ResourceDeclaration> {
    (0..n)
        .rev()
        .map(|i| {
            let mut decl = ResourceDeclaration::new(node(i), "AWS::Logs::LogGroup")
                .with_property("LogGroupName", json!(node(i)));
            for (_, dependency) in edges.iter().filter(|(dependent, _)| *dependent == i) {
                let reference = format!("${{{}.id}}", node(*dependency));
                decl = decl.with_property(format!("Dep{dependency}"), json!(reference));
            }
            decl
        })
        .collect()
}

fn config(resources: Vec<ResourceDeclaration>, parallelism: usize) -> DeployConfig {
    DeployConfig {
        project: ProjectConfig {
            name: String::from("prop"),
            stack: String::from("dev"),
        },
        state: StateConfig::default(),
        provider: ProviderConfig::default(),
        execution: ExecutionConfig {
            parallelism,
            retry: RetryConfig {
                max_attempts: 1,
                base_delay_ms: 1,
                max_delay_ms: 1,
            },
            ..ExecutionConfig::default()
        },
        variables: BTreeMap::new(),
        resources,
        outputs: BTreeMap::new(),
        checks: Vec::new(),
    }
}

fn position(order: &[String], name: &str) -> usize {
    order.iter().position(|n| n == name).unwrap_or(usize::MAX)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    /// The topological order never lists a resource before its dependencies.
    #[test]
    fn topological_order_respects_edges((n, edges) in arb_dag()) {
        let graph = ResourceGraph::build(&declarations(n, &edges)).unwrap();
        let order: Vec<String> = graph.topological_order().into_iter().map(String::from).collect();
        prop_assert_eq!(order.len(), n);
        for (dependent, dependency) in &edges {
            prop_assert!(position(&order, &node(*dependency)) < position(&order, &node(*dependent)));
        }
    }

    /// Every layer only depends on earlier layers.
    #[test]
    fn layers_are_dependency_closed((n, edges) in arb_dag()) {
        let graph = ResourceGraph::build(&declarations(n, &edges)).unwrap();
        let layers = graph.layers();
        let layer_of = |name: &str| layers.iter().position(|l| l.contains(&name)).unwrap();
        for (dependent, dependency) in &edges {
            prop_assert!(layer_of(&node(*dependency)) < layer_of(&node(*dependent)));
        }
    }

    /// Apply creates dependencies first and destroy deletes them last, at
    /// any parallelism.
    #[test]
    fn apply_and_destroy_respect_edges((n, edges) in arb_dag(), parallelism in 1usize..5) {
        let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        let (creates, deletes) = runtime.block_on(async {
            let dir = TempDir::new().unwrap();
            let store = LocalStateStore::with_base_dir(dir.path());
            let provider = Arc::new(MemoryProvider::new());
            let config = config(declarations(n, &edges), parallelism);
            let engine = Engine::new(&config, &store, provider.clone());

            assert!(engine.apply(false, |_| true).await.unwrap().is_success());
            assert!(engine.destroy(|_| true).await.unwrap().is_success());
            (
                provider.calls_of(ProviderOperation::Create),
                provider.calls_of(ProviderOperation::Delete),
            )
        });

        prop_assert_eq!(creates.len(), n);
        prop_assert_eq!(deletes.len(), n);
        for (dependent, dependency) in &edges {
            prop_assert!(position(&creates, &node(*dependency)) < position(&creates, &node(*dependent)));
            prop_assert!(position(&deletes, &node(*dependent)) < position(&deletes, &node(*dependency)));
        }
    }
}
