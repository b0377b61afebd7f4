//! Deployment plan types and construction.
//!
//! This module defines the structure of deployment plans and provides
//! functionality for converting diffs into executable plans.
//!
//! A plan has two phases. The apply phase holds every declared resource in
//! dependency order. The delete phase runs afterwards and holds undeclared
//! resources and old copies of replaced resources, dependents first.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};

use crate::config::{DeployConfig, ReplaceStrategy};
use crate::error::PlanError;
use crate::graph::ResourceGraph;
use crate::resource::Properties;
use crate::state::DeploymentState;

use super::diff::{DiffDetail, DiffResult, DiffType};

/// A complete deployment plan.
#[derive(Debug, Clone)]
pub struct DeploymentPlan {
    /// When the plan was created.
    pub created_at: DateTime<Utc>,
    /// Configuration hash this plan is based on.
    pub config_hash: String,
    /// Planned changes: the apply phase, then the delete phase.
    pub changes: Vec<PlannedChange>,
}

/// A single planned change.
#[derive(Debug, Clone)]
pub struct PlannedChange {
    /// Action to perform.
    pub action: ChangeAction,
    /// Phase this change belongs to.
    pub phase: ChangePhase,
    /// Logical resource name.
    pub resource_name: String,
    /// Resource type.
    pub resource_type: String,
    /// Identifier of the existing copy (if any).
    pub physical_id: Option<String>,
    /// Declared properties, references unresolved.
    pub properties: Properties,
    /// Property-level changes.
    pub details: Vec<DiffDetail>,
    /// Reason for this change.
    pub reason: String,
    /// New property hash (if applicable).
    pub new_hash: Option<String>,
    /// Logical names of the resources this one depends on.
    pub resource_dependencies: Vec<String>,
    /// Dependencies (change indices that must complete first).
    pub dependencies: Vec<usize>,
    /// Order of operations for a replacement.
    pub replace_strategy: ReplaceStrategy,
    /// Whether the resource is protected.
    pub protect: bool,
    /// Whether this deletes the old copy of a replaced resource.
    pub old_copy: bool,
}

/// Types of changes in a plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeAction {
    /// Create a new resource.
    Create,
    /// Update a resource in place.
    Update,
    /// Replace a resource with a new copy.
    Replace,
    /// Delete a resource.
    Delete,
    /// No operation (for tracking).
    NoOp,
}

/// Phase of a plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangePhase {
    /// Creations, updates and replacements, in dependency order.
    Apply,
    /// Deletions, in reverse dependency order.
    Delete,
}

impl DeploymentPlan {
    /// Creates a new plan from a diff result.
    ///
    /// `graph` is built from the declarations and `state_graph` from the
    /// recorded resources.
    ///
    /// # Errors
    ///
    /// Returns [`PlanError::ProtectedResource`] if a protected resource would
    /// be replaced or deleted.
    pub fn from_diff(
        diff: &DiffResult,
        config: &DeployConfig,
        graph: &ResourceGraph,
        state: Option<&DeploymentState>,
        state_graph: &ResourceGraph,
        config_hash: &str,
    ) -> Result<Self, PlanError> {
        let mut changes = Vec::new();
        let mut deletes = Vec::new();

        for resource_diff in &diff.diffs {
            if resource_diff.diff_type == DiffType::Delete {
                let recorded = state.and_then(|s| s.get(&resource_diff.name));
                deletes.push(PlannedChange {
                    protect: recorded.is_some_and(|r| r.protect),
                    resource_dependencies: recorded.map(|r| r.dependencies.clone()).unwrap_or_default(),
                    reason: resource_diff.reason.clone(),
                    ..PlannedChange::delete(&resource_diff.name, &resource_diff.resource_type, resource_diff.physical_id.clone())
                });
                continue;
            }

            let Some(decl) = config.resource(&resource_diff.name) else {
                continue;
            };
            let action = match resource_diff.diff_type {
                DiffType::Create => ChangeAction::Create,
                DiffType::Update => ChangeAction::Update,
                DiffType::Replace => ChangeAction::Replace,
                DiffType::Delete | DiffType::NoChange => ChangeAction::NoOp,
            };
            let replace_strategy = if decl.options.delete_before_replace {
                ReplaceStrategy::DeleteBeforeCreate
            } else {
                config.execution.replace_strategy
            };

            let change = PlannedChange {
                action,
                phase: ChangePhase::Apply,
                resource_name: decl.name.clone(),
                resource_type: decl.resource_type.clone(),
                physical_id: resource_diff.physical_id.clone(),
                properties: decl.properties.clone(),
                details: resource_diff.details.clone(),
                reason: resource_diff.reason.clone(),
                new_hash: resource_diff.new_hash.clone(),
                resource_dependencies: graph.dependencies(&decl.name).into_iter().map(String::from).collect(),
                dependencies: Vec::new(),
                replace_strategy,
                protect: decl.options.protect,
                old_copy: false,
            };

            if action == ChangeAction::Replace {
                if change.protect {
                    return Err(PlanError::ProtectedResource {
                        name: change.resource_name,
                        action: String::from("replaced"),
                    });
                }
                if replace_strategy == ReplaceStrategy::CreateBeforeDelete {
                    deletes.push(PlannedChange {
                        old_copy: true,
                        reason: String::from("replaced by a new copy"),
                        ..PlannedChange::delete(&change.resource_name, &change.resource_type, change.physical_id.clone())
                    });
                }
            }
            changes.push(change);
        }

        let indices: HashMap<&str, usize> = changes
            .iter()
            .enumerate()
            .map(|(i, c)| (c.resource_name.as_str(), i))
            .collect();
        let apply_dependencies: Vec<Vec<usize>> = changes
            .iter()
            .map(|c| {
                graph
                    .dependencies(&c.resource_name)
                    .into_iter()
                    .filter_map(|d| indices.get(d).copied())
                    .collect()
            })
            .collect();
        for (change, deps) in changes.iter_mut().zip(apply_dependencies) {
            change.dependencies = deps;
        }

        if let Some(state) = state {
            let stale = Self::stale_copies(state, &deletes);
            deletes.extend(stale);
        }
        Self::check_protected(&deletes)?;
        Self::push_delete_phase(&mut changes, deletes, state_graph);

        Ok(Self {
            created_at: Utc::now(),
            config_hash: config_hash.to_string(),
            changes,
        })
    }

    /// Creates a plan that deletes every tracked resource.
    ///
    /// # Errors
    ///
    /// Returns [`PlanError::ProtectedResource`] if a tracked resource is
    /// protected.
    pub fn destroy(state: &DeploymentState, state_graph: &ResourceGraph) -> Result<Self, PlanError> {
        let mut deletes: Vec<PlannedChange> = state
            .resources
            .values()
            .map(|r| PlannedChange {
                protect: r.protect,
                resource_dependencies: r.dependencies.clone(),
                reason: String::from("destroy"),
                ..PlannedChange::delete(&r.name, &r.resource_type, r.physical_id.clone())
            })
            .collect();
        let stale = Self::stale_copies(state, &deletes);
        deletes.extend(stale);
        Self::check_protected(&deletes)?;

        let mut changes = Vec::new();
        Self::push_delete_phase(&mut changes, deletes, state_graph);

        Ok(Self {
            created_at: Utc::now(),
            config_hash: state.config_hash.clone(),
            changes,
        })
    }

    /// Old copies left behind by earlier runs.
    fn stale_copies(state: &DeploymentState, planned: &[PlannedChange]) -> Vec<PlannedChange> {
        let known: HashSet<&str> = planned.iter().filter_map(|c| c.physical_id.as_deref()).collect();
        state
            .pending_deletes
            .iter()
            .filter(|p| !known.contains(p.physical_id.as_str()))
            .map(|p| PlannedChange {
                old_copy: true,
                reason: p
                    .last_error
                    .as_ref()
                    .map_or_else(|| String::from("left over from a replacement"), |e| format!("previous delete failed: {e}")),
                ..PlannedChange::delete(&p.name, &p.resource_type, Some(p.physical_id.clone()))
            })
            .collect()
    }

    fn check_protected(deletes: &[PlannedChange]) -> Result<(), PlanError> {
        match deletes.iter().find(|c| c.protect && !c.old_copy) {
            Some(c) => Err(PlanError::ProtectedResource {
                name: c.resource_name.clone(),
                action: String::from("deleted"),
            }),
            None => Ok(()),
        }
    }

    /// Orders deletions dependents first and wires their dependencies.
    ///
    /// A deletion waits for the deletion of every recorded dependent, and is
    /// blocked when the apply-phase change of such a dependent fails.
    fn push_delete_phase(changes: &mut Vec<PlannedChange>, mut deletes: Vec<PlannedChange>, state_graph: &ResourceGraph) {
        let position: HashMap<&str, usize> = state_graph
            .reverse_order()
            .into_iter()
            .enumerate()
            .map(|(i, name)| (name, i))
            .collect();
        deletes.sort_by_key(|c| position.get(c.resource_name.as_str()).copied().unwrap_or(0));

        let apply_count = changes.len();
        let mut by_name: HashMap<String, Vec<usize>> = HashMap::new();
        for (i, change) in changes.iter().enumerate() {
            by_name.entry(change.resource_name.clone()).or_default().push(i);
        }
        for (i, change) in deletes.iter().enumerate() {
            by_name
                .entry(change.resource_name.clone())
                .or_default()
                .push(apply_count + i);
        }

        for (i, mut change) in deletes.into_iter().enumerate() {
            let index = apply_count + i;
            let mut waits_on: Vec<&str> = state_graph.transitive_dependents(&change.resource_name);
            waits_on.push(&change.resource_name);

            let mut deps: Vec<usize> = waits_on
                .iter()
                .filter_map(|name| by_name.get(*name))
                .flatten()
                .copied()
                .filter(|&d| d != index && (d < apply_count || d < index))
                .collect();
            deps.sort_unstable();
            deps.dedup();
            change.dependencies = deps;
            changes.push(change);
        }
    }

    /// Returns true if the plan changes nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.changes.iter().all(|c| c.action == ChangeAction::NoOp)
    }

    /// Returns the number of changes that act on the provider.
    #[must_use]
    pub fn change_count(&self) -> usize {
        self.changes.iter().filter(|c| c.action != ChangeAction::NoOp).count()
    }

    fn count(&self, action: ChangeAction) -> usize {
        self.changes
            .iter()
            .filter(|c| c.action == action && !c.old_copy)
            .count()
    }

    /// Returns the number of create changes.
    #[must_use]
    pub fn create_count(&self) -> usize {
        self.count(ChangeAction::Create)
    }

    /// Returns the number of update changes.
    #[must_use]
    pub fn update_count(&self) -> usize {
        self.count(ChangeAction::Update)
    }

    /// Returns the number of replace changes.
    #[must_use]
    pub fn replace_count(&self) -> usize {
        self.count(ChangeAction::Replace)
    }

    /// Returns the number of delete changes, old copies excluded.
    #[must_use]
    pub fn delete_count(&self) -> usize {
        self.count(ChangeAction::Delete)
    }

    /// Returns the number of unchanged resources.
    #[must_use]
    pub fn unchanged_count(&self) -> usize {
        self.count(ChangeAction::NoOp)
    }

    /// Gets changes that depend on a specific change index.
    #[must_use]
    pub fn dependent_changes(&self, index: usize) -> Vec<(usize, &PlannedChange)> {
        self.changes
            .iter()
            .enumerate()
            .filter(|(_, c)| c.dependencies.contains(&index))
            .collect()
    }
}

impl PlannedChange {
    /// A delete-phase change with no dependencies yet.
    fn delete(name: &str, resource_type: &str, physical_id: Option<String>) -> Self {
        Self {
            action: ChangeAction::Delete,
            phase: ChangePhase::Delete,
            resource_name: name.to_string(),
            resource_type: resource_type.to_string(),
            physical_id,
            properties: Properties::new(),
            details: Vec::new(),
            reason: String::new(),
            new_hash: None,
            resource_dependencies: Vec::new(),
            dependencies: Vec::new(),
            replace_strategy: ReplaceStrategy::default(),
            protect: false,
            old_copy: false,
        }
    }

    /// Returns a human-readable description of the change.
    #[must_use]
    pub fn description(&self) -> String {
        match self.action {
            ChangeAction::Create => format!("Create '{}'", self.resource_name),
            ChangeAction::Update => format!("Update '{}'", self.resource_name),
            ChangeAction::Replace => format!("Replace '{}' ({})", self.resource_name, self.replace_strategy),
            ChangeAction::Delete if self.old_copy => format!("Delete old copy of '{}'", self.resource_name),
            ChangeAction::Delete => format!("Delete '{}'", self.resource_name),
            ChangeAction::NoOp => format!("No change for '{}'", self.resource_name),
        }
    }
}

impl ChangeAction {
    /// Symbol used when rendering plans.
    #[must_use]
    pub const fn symbol(self) -> &'static str {
        match self {
            Self::Create => "+",
            Self::Update => "~",
            Self::Replace => "-/+",
            Self::Delete => "-",
            Self::NoOp => " ",
        }
    }
}

impl std::fmt::Display for ChangeAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Replace => "replace",
            Self::Delete => "delete",
            Self::NoOp => "noop",
        };
        write!(f, "{s}")
    }
}

impl std::fmt::Display for PlannedChange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {} {}", self.action.symbol(), self.resource_name, self.resource_type)?;
        if self.old_copy {
            write!(f, " [old copy]")?;
        }
        if !self.reason.is_empty() {
            write!(f, " ({})", self.reason)?;
        }
        Ok(())
    }
}

impl std::fmt::Display for DeploymentPlan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_empty() {
            return write!(f, "No changes required");
        }

        writeln!(f, "Deployment Plan ({} changes):", self.change_count())?;
        for change in self.changes.iter().filter(|c| c.action != ChangeAction::NoOp) {
            writeln!(f, "  {change}")?;
        }
        write!(
            f,
            "{} to create, {} to update, {} to replace, {} to delete",
            self.create_count(),
            self.update_count(),
            self.replace_count(),
            self.delete_count()
        )
    }
}
