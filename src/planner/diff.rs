//! Diff engine for comparing declared resources with recorded state.
//!
//! This module computes, for every declared resource, whether it must be
//! created, updated in place, replaced, or left alone, and which tracked
//! resources are no longer declared.

use std::collections::HashSet;

use serde_json::Value;
use tracing::debug;

use crate::config::{ConfigHasher, DeployConfig};
use crate::graph::ResourceGraph;
use crate::resource::{ResourceDeclaration, registry};
use crate::state::{DeploymentState, ResourceState, ResourceStatus};

/// Engine for computing diffs between declared and recorded state.
#[derive(Debug, Default)]
pub struct DiffEngine {
    /// Configuration hasher.
    hasher: ConfigHasher,
}

/// Difference for a single resource.
#[derive(Debug, Clone)]
pub struct ResourceDiff {
    /// Resource name.
    pub name: String,
    /// Resource type.
    pub resource_type: String,
    /// Type of difference.
    pub diff_type: DiffType,
    /// Property-level details.
    pub details: Vec<DiffDetail>,
    /// Why this diff was chosen.
    pub reason: String,
    /// Identifier recorded in state, if any.
    pub physical_id: Option<String>,
    /// Previous hash (if applicable).
    pub old_hash: Option<String>,
    /// New hash (if applicable).
    pub new_hash: Option<String>,
}

/// Type of difference detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiffType {
    /// Resource needs to be created.
    Create,
    /// Resource needs to be updated in place.
    Update,
    /// Resource needs to be replaced.
    Replace,
    /// Resource needs to be deleted.
    Delete,
    /// Resource is unchanged.
    NoChange,
}

/// Detail about a specific property difference.
#[derive(Debug, Clone, PartialEq)]
pub struct DiffDetail {
    /// Property that differs.
    pub field: String,
    /// Recorded value.
    pub old_value: Option<Value>,
    /// Declared value.
    pub new_value: Option<Value>,
    /// Whether this change cannot be applied in place.
    pub forces_replacement: bool,
}

/// Complete diff result.
#[derive(Debug, Default)]
pub struct DiffResult {
    /// Declared resources in dependency order, then undeclared resources in
    /// reverse dependency order.
    pub diffs: Vec<ResourceDiff>,
    /// Number of resources to create.
    pub creates: usize,
    /// Number of resources to update.
    pub updates: usize,
    /// Number of resources to replace.
    pub replaces: usize,
    /// Number of resources to delete.
    pub deletes: usize,
    /// Number of unchanged resources.
    pub unchanged: usize,
}

impl DiffEngine {
    /// Creates a new diff engine.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            hasher: ConfigHasher::new(),
        }
    }

    /// Computes the diff between the declared configuration and state.
    ///
    /// `graph` is the graph of the declarations and `state_graph` the graph
    /// of the recorded resources. Names in `missing` were found absent
    /// provider-side by a refresh.
    #[must_use]
    pub fn compute_diff(
        &self,
        config: &DeployConfig,
        graph: &ResourceGraph,
        state: Option<&DeploymentState>,
        state_graph: &ResourceGraph,
        missing: &HashSet<String>,
    ) -> DiffResult {
        let mut diffs = Vec::new();
        let mut identity_changes: HashSet<String> = HashSet::new();

        for name in graph.topological_order() {
            let Some(decl) = config.resource(name) else {
                continue;
            };
            let recorded = state.and_then(|s| s.get(name));
            let diff = self.diff_resource(decl, recorded, missing.contains(name), &identity_changes);

            let recreated = recorded.is_some_and(|r| r.physical_id.is_some()) && diff.diff_type == DiffType::Create;
            if diff.diff_type == DiffType::Replace || recreated {
                identity_changes.insert(name.to_string());
            }
            diffs.push(diff);
        }

        if let Some(state) = state {
            for name in state_graph.reverse_order() {
                if graph.contains(name) {
                    continue;
                }
                let Some(recorded) = state.get(name) else {
                    continue;
                };
                debug!("Resource {name} is no longer declared");
                diffs.push(ResourceDiff {
                    name: name.to_string(),
                    resource_type: recorded.resource_type.clone(),
                    diff_type: DiffType::Delete,
                    details: Vec::new(),
                    reason: String::from("no longer declared"),
                    physical_id: recorded.physical_id.clone(),
                    old_hash: Some(recorded.input_hash.clone()),
                    new_hash: None,
                });
            }
        }

        DiffResult::from_diffs(diffs)
    }

    /// Computes the diff for a single declared resource.
    fn diff_resource(
        &self,
        decl: &ResourceDeclaration,
        recorded: Option<&ResourceState>,
        missing: bool,
        identity_changes: &HashSet<String>,
    ) -> ResourceDiff {
        let new_hash = self.hasher.hash_resource(decl);
        let mut diff = ResourceDiff {
            name: decl.name.clone(),
            resource_type: decl.resource_type.clone(),
            diff_type: DiffType::Create,
            details: Vec::new(),
            reason: String::new(),
            physical_id: recorded.and_then(|r| r.physical_id.clone()),
            old_hash: recorded.map(|r| r.input_hash.clone()),
            new_hash: Some(new_hash),
        };

        let Some(recorded) = recorded.filter(|r| r.physical_id.is_some()) else {
            diff.reason = if recorded.is_some() {
                String::from("previous creation did not complete")
            } else {
                String::from("declared but not tracked")
            };
            return diff;
        };

        if missing {
            diff.reason = String::from("missing provider-side");
            diff.physical_id = None;
            return diff;
        }

        if recorded.resource_type != decl.resource_type {
            diff.diff_type = DiffType::Replace;
            diff.reason = format!("type changed from {}", recorded.resource_type);
            return diff;
        }

        diff.details = Self::property_changes(decl, recorded);

        if let Ok(references) = decl.references() {
            for r in references {
                if !identity_changes.contains(&r.reference.resource)
                    || diff.details.iter().any(|d| d.field == r.property)
                {
                    continue;
                }
                let value = decl.properties.get(&r.property).cloned();
                diff.details.push(DiffDetail {
                    field: r.property.clone(),
                    old_value: value.clone(),
                    new_value: value,
                    forces_replacement: registry::is_create_only(&decl.resource_type, &r.property),
                });
                if diff.reason.is_empty() {
                    diff.reason = format!("{} will be replaced", r.reference.resource);
                }
            }
        }

        if diff.details.iter().any(|d| d.forces_replacement) {
            diff.diff_type = DiffType::Replace;
            let fields: Vec<&str> = diff
                .details
                .iter()
                .filter(|d| d.forces_replacement)
                .map(|d| d.field.as_str())
                .collect();
            diff.reason = format!("{} cannot be changed in place", fields.join(", "));
        } else if !diff.details.is_empty() {
            diff.diff_type = DiffType::Update;
            if diff.reason.is_empty() {
                diff.reason = String::from("properties changed");
            }
        } else if recorded.status != ResourceStatus::Applied {
            diff.diff_type = DiffType::Update;
            diff.reason = format!("last run left it {}", recorded.status);
        } else {
            diff.diff_type = DiffType::NoChange;
        }

        diff
    }

    /// Compares declared properties with the recorded ones.
    fn property_changes(decl: &ResourceDeclaration, recorded: &ResourceState) -> Vec<DiffDetail> {
        let ignored = &decl.options.ignore_changes;
        let mut fields: Vec<&String> = decl
            .properties
            .keys()
            .chain(recorded.properties.keys())
            .filter(|k| !ignored.contains(k))
            .collect();
        fields.sort_unstable();
        fields.dedup();

        fields
            .into_iter()
            .filter_map(|field| {
                let old_value = recorded.properties.get(field);
                let new_value = decl.properties.get(field);
                (old_value != new_value).then(|| DiffDetail {
                    field: field.clone(),
                    old_value: old_value.cloned(),
                    new_value: new_value.cloned(),
                    forces_replacement: registry::is_create_only(&decl.resource_type, field),
                })
            })
            .collect()
    }
}

impl DiffResult {
    /// Builds a result and its summary counts.
    #[must_use]
    pub fn from_diffs(diffs: Vec<ResourceDiff>) -> Self {
        let count = |t: DiffType| diffs.iter().filter(|d| d.diff_type == t).count();
        Self {
            creates: count(DiffType::Create),
            updates: count(DiffType::Update),
            replaces: count(DiffType::Replace),
            deletes: count(DiffType::Delete),
            unchanged: count(DiffType::NoChange),
            diffs,
        }
    }

    /// Returns true if nothing has to change.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.diffs.iter().all(|d| d.diff_type == DiffType::NoChange)
    }
}

impl std::fmt::Display for DiffType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Replace => "replace",
            Self::Delete => "delete",
            Self::NoChange => "no change",
        };
        write!(f, "{s}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProjectConfig;
    use serde_json::json;

    fn config(resources: Vec<ResourceDeclaration>) -> DeployConfig {
        DeployConfig {
            project: ProjectConfig {
                name: String::from("web"),
                stack: String::from("dev"),
            },
            state: crate::config::StateConfig::default(),
            provider: crate::config::ProviderConfig::default(),
            execution: crate::config::ExecutionConfig::default(),
            variables: std::collections::BTreeMap::new(),
            resources,
            outputs: std::collections::BTreeMap::new(),
            checks: Vec::new(),
        }
    }

    fn vpc(cidr: &str) -> ResourceDeclaration {
        ResourceDeclaration::new("Vpc", "AWS::EC2::VPC")
            .with_property("CidrBlock", json!(cidr))
            .with_property("EnableDnsSupport", json!(true))
    }

    fn subnet() -> ResourceDeclaration {
        ResourceDeclaration::new("Subnet", "AWS::EC2::Subnet")
            .with_property("VpcId", json!("${Vpc.id}"))
            .with_property("CidrBlock", json!("10.0.0.0/18"))
    }

    fn record(state: &mut DeploymentState, decl: &ResourceDeclaration, deps: &[&str]) {
        let mut r = ResourceState::new(&decl.name, &decl.resource_type, ResourceStatus::Applied);
        r.physical_id = Some(format!("id-{}", decl.name));
        r.properties = decl.properties.clone();
        r.dependencies = deps.iter().map(|d| (*d).to_string()).collect();
        state.set_resource(r);
    }

    fn diff(config: &DeployConfig, state: Option<&DeploymentState>) -> DiffResult {
        let graph = ResourceGraph::build(&config.resources).unwrap();
        let state_graph = state
            .map(|s| ResourceGraph::from_state(s).unwrap())
            .unwrap_or_default();
        DiffEngine::new().compute_diff(config, &graph, state, &state_graph, &HashSet::new())
    }

    #[test]
    fn test_everything_created_without_state() {
        let cfg = config(vec![subnet(), vpc("10.0.0.0/16")]);
        let result = diff(&cfg, None);
        assert_eq!(result.creates, 2);
        let names: Vec<&str> = result.diffs.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["Vpc", "Subnet"]);
    }

    #[test]
    fn test_unchanged_is_no_change() {
        let cfg = config(vec![vpc("10.0.0.0/16"), subnet()]);
        let mut state = DeploymentState::new("web", "dev");
        record(&mut state, &cfg.resources[0], &[]);
        record(&mut state, &cfg.resources[1], &["Vpc"]);

        let result = diff(&cfg, Some(&state));
        assert!(result.is_empty());
        assert_eq!(result.unchanged, 2);
    }

    #[test]
    fn test_mutable_change_is_update() {
        let mut state = DeploymentState::new("web", "dev");
        record(&mut state, &vpc("10.0.0.0/16"), &[]);

        let mut changed = vpc("10.0.0.0/16");
        changed.properties.insert(String::from("EnableDnsSupport"), json!(false));
        let result = diff(&config(vec![changed]), Some(&state));

        assert_eq!(result.diffs[0].diff_type, DiffType::Update);
        assert_eq!(result.diffs[0].details.len(), 1);
        assert!(!result.diffs[0].details[0].forces_replacement);
    }

    #[test]
    fn test_create_only_change_cascades_replacement() {
        let mut state = DeploymentState::new("web", "dev");
        record(&mut state, &vpc("10.0.0.0/16"), &[]);
        record(&mut state, &subnet(), &["Vpc"]);

        let result = diff(&config(vec![vpc("10.1.0.0/16"), subnet()]), Some(&state));
        assert_eq!(result.diffs[0].diff_type, DiffType::Replace);
        assert_eq!(result.diffs[1].diff_type, DiffType::Replace);
        assert!(result.diffs[1].details.iter().any(|d| d.field == "VpcId" && d.forces_replacement));
    }

    #[test]
    fn test_undeclared_resource_is_deleted() {
        let mut state = DeploymentState::new("web", "dev");
        record(&mut state, &vpc("10.0.0.0/16"), &[]);
        record(&mut state, &subnet(), &["Vpc"]);

        let result = diff(&config(vec![vpc("10.0.0.0/16")]), Some(&state));
        assert_eq!(result.deletes, 1);
        assert_eq!(result.diffs[1].name, "Subnet");
        assert_eq!(result.diffs[1].physical_id.as_deref(), Some("id-Subnet"));
    }

    #[test]
    fn test_ignored_changes_and_failed_status() {
        let mut state = DeploymentState::new("web", "dev");
        let mut decl = vpc("10.0.0.0/16");
        record(&mut state, &decl, &[]);

        decl.options.ignore_changes.push(String::from("EnableDnsSupport"));
        decl.properties.insert(String::from("EnableDnsSupport"), json!(false));
        let result = diff(&config(vec![decl.clone()]), Some(&state));
        assert_eq!(result.diffs[0].diff_type, DiffType::NoChange);

        if let Some(r) = state.resources.get_mut("Vpc") {
            r.status = ResourceStatus::Failed;
        }
        let result = diff(&config(vec![decl]), Some(&state));
        assert_eq!(result.diffs[0].diff_type, DiffType::Update);
    }

    #[test]
    fn test_missing_resource_is_recreated() {
        let cfg = config(vec![vpc("10.0.0.0/16")]);
        let mut state = DeploymentState::new("web", "dev");
        record(&mut state, &cfg.resources[0], &[]);

        let graph = ResourceGraph::build(&cfg.resources).unwrap();
        let state_graph = ResourceGraph::from_state(&state).unwrap();
        let missing: HashSet<String> = [String::from("Vpc")].into();
        let result = DiffEngine::new().compute_diff(&cfg, &graph, Some(&state), &state_graph, &missing);
        assert_eq!(result.diffs[0].diff_type, DiffType::Create);
        assert_eq!(result.diffs[0].reason, "missing provider-side");
    }
}
