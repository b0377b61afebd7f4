//! Engine for converging a stack to its declared configuration.
//!
//! The engine ties the pieces together: it builds the resource graph,
//! loads the recorded state, plans, and executes the plan while holding the
//! state lock. It also answers the read-only questions (drift, outputs,
//! endpoint health).

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{ConfigHasher, DeployConfig};
use crate::error::{CumulusError, Result};
use crate::graph::ResourceGraph;
use crate::health::{HealthChecker, HealthStatus};
use crate::planner::{ChangeOutcome, DeploymentPlan, DiffEngine, ExecutionReport, PlanExecutor, RetryPolicy};
use crate::provider::CloudProvider;
use crate::state::{
    DeploymentHistoryEntry, DeploymentOperation, DeploymentState, StateStore, generate_holder_id,
    with_state_lock,
};

/// Engine for one deployment.
pub struct Engine<'a> {
    /// Configuration.
    config: &'a DeployConfig,
    /// State store.
    store: &'a dyn StateStore,
    /// Cloud provider.
    provider: Arc<dyn CloudProvider>,
    /// Stops dispatching new work when cancelled.
    cancel: CancellationToken,
    /// Lock holder identifier.
    holder: String,
    /// Maximum concurrent provider calls.
    parallelism: usize,
    /// Configuration hasher.
    hasher: ConfigHasher,
    /// Diff engine.
    diff_engine: DiffEngine,
}

/// Result of an apply or destroy run.
#[derive(Debug)]
pub struct ApplyOutcome {
    /// The plan that was computed.
    pub plan: DeploymentPlan,
    /// Execution report, absent when nothing was executed.
    pub report: Option<ExecutionReport>,
    /// Stack outputs after the run.
    pub outputs: BTreeMap<String, Value>,
}

/// How a recorded resource differs from the live one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DriftKind {
    /// The resource no longer exists provider-side.
    Missing,
    /// Recorded attributes differ from the live ones.
    Modified {
        /// Attributes whose live value differs.
        fields: Vec<String>,
    },
}

/// A drifted resource.
#[derive(Debug, Clone, Serialize)]
pub struct DriftEntry {
    /// Logical name.
    pub name: String,
    /// Resource type.
    pub resource_type: String,
    /// Provider identifier.
    pub physical_id: String,
    /// What drifted.
    #[serde(flatten)]
    pub kind: DriftKind,
}

/// Report of drift detection.
#[derive(Debug, Default, Serialize)]
pub struct DriftReport {
    /// Number of resources read from the provider.
    pub checked: usize,
    /// Resources that have drifted.
    pub drifted: Vec<DriftEntry>,
}

impl<'a> Engine<'a> {
    /// Creates a new engine.
    #[must_use]
    pub fn new(config: &'a DeployConfig, store: &'a dyn StateStore, provider: Arc<dyn CloudProvider>) -> Self {
        Self {
            config,
            store,
            provider,
            cancel: CancellationToken::new(),
            holder: generate_holder_id(),
            parallelism: config.execution.parallelism,
            hasher: ConfigHasher::new(),
            diff_engine: DiffEngine::new(),
        }
    }

    /// Sets the cancellation token.
    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Overrides the configured parallelism.
    #[must_use]
    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism.max(1);
        self
    }

    /// Sets the lock holder identifier.
    #[must_use]
    pub fn with_holder(mut self, holder: impl Into<String>) -> Self {
        self.holder = holder.into();
        self
    }

    fn retry(&self) -> RetryPolicy {
        RetryPolicy::from(&self.config.execution.retry)
    }

    fn empty_state(&self) -> DeploymentState {
        DeploymentState::new(&self.config.project.name, &self.config.project.stack)
    }

    /// Computes the plan without executing it.
    ///
    /// With `refresh`, every tracked resource is read from the provider and
    /// the ones that vanished are planned for creation.
    ///
    /// # Errors
    ///
    /// Returns graph errors, lock conflicts, state errors, provider errors
    /// from the refresh, or a protected-resource error.
    pub async fn plan(&self, refresh: bool) -> Result<DeploymentPlan> {
        let graph = ResourceGraph::build(&self.config.resources)?;

        with_state_lock(self.store, &self.holder, "plan", |_lock| async move {
            let state = self.store.load().await?;
            self.compute_plan(&graph, state.as_ref(), refresh).await
        })
        .await
    }

    async fn compute_plan(
        &self,
        graph: &ResourceGraph,
        state: Option<&DeploymentState>,
        refresh: bool,
    ) -> Result<DeploymentPlan> {
        let state_graph = match state {
            Some(state) => ResourceGraph::from_state(state)?,
            None => ResourceGraph::default(),
        };
        let missing = match state {
            Some(state) if refresh => self.refresh(state).await?,
            _ => HashSet::new(),
        };

        let diff = self
            .diff_engine
            .compute_diff(self.config, graph, state, &state_graph, &missing);
        info!(
            "Diff: {} creates, {} updates, {} replaces, {} deletes, {} unchanged",
            diff.creates, diff.updates, diff.replaces, diff.deletes, diff.unchanged
        );

        let config_hash = self.hasher.hash_config(self.config);
        Ok(DeploymentPlan::from_diff(
            &diff,
            self.config,
            graph,
            state,
            &state_graph,
            &config_hash,
        )?)
    }

    /// Reads every tracked resource, returning the names that no longer exist.
    async fn refresh(&self, state: &DeploymentState) -> Result<HashSet<String>> {
        let retry = self.retry();
        let mut missing = HashSet::new();

        for resource in state.resources.values() {
            let Some(id) = resource.physical_id.as_deref() else {
                continue;
            };
            let label = format!("Read of {}", resource.name);
            let live = retry
                .run(&label, &self.cancel, || self.provider.read(&resource.resource_type, id))
                .await?;
            if live.is_none() {
                warn!("{} ({id}) no longer exists provider-side", resource.name);
                missing.insert(resource.name.clone());
            }
        }

        debug!("Refreshed {} resources, {} missing", state.resources.len(), missing.len());
        Ok(missing)
    }

    /// Plans and applies the configuration under the state lock.
    ///
    /// `confirm` sees the plan before anything runs; returning false leaves
    /// the state untouched. An empty plan is not confirmed.
    ///
    /// # Errors
    ///
    /// Returns fatal errors only: graph and plan errors, lock conflicts,
    /// state save failures, and cancellation before execution started.
    /// Failures of individual changes are reported in the outcome.
    pub async fn apply<C>(&self, refresh: bool, confirm: C) -> Result<ApplyOutcome>
    where
        C: FnOnce(&DeploymentPlan) -> bool + Send,
    {
        let graph = ResourceGraph::build(&self.config.resources)?;

        with_state_lock(self.store, &self.holder, "apply", |_lock| async move {
            let mut state = self.store.load().await?.unwrap_or_else(|| self.empty_state());
            let plan = self.compute_plan(&graph, Some(&state), refresh).await?;

            if !plan.is_empty() && !confirm(&plan) {
                info!("Apply declined");
                return Ok(ApplyOutcome {
                    outputs: state.outputs.clone(),
                    plan,
                    report: None,
                });
            }

            let report = self.execute(&plan, &mut state).await?;
            state.outputs = self.resolve_outputs(&state);
            if report.is_success() {
                state.config_hash.clone_from(&plan.config_hash);
            }
            self.finish(&mut state, &plan, &report, DeploymentOperation::Apply).await?;

            Ok(ApplyOutcome {
                outputs: state.outputs.clone(),
                plan,
                report: Some(report),
            })
        })
        .await
    }

    /// Deletes every tracked resource in reverse dependency order.
    ///
    /// # Errors
    ///
    /// Same as [`Engine::apply`].
    pub async fn destroy<C>(&self, confirm: C) -> Result<ApplyOutcome>
    where
        C: FnOnce(&DeploymentPlan) -> bool + Send,
    {
        with_state_lock(self.store, &self.holder, "destroy", |_lock| async move {
            let mut state = self.store.load().await?.unwrap_or_else(|| self.empty_state());
            let state_graph = ResourceGraph::from_state(&state)?;
            let plan = DeploymentPlan::destroy(&state, &state_graph)?;

            if plan.is_empty() || !confirm(&plan) {
                if plan.is_empty() {
                    info!("Nothing to destroy");
                } else {
                    info!("Destroy declined");
                }
                return Ok(ApplyOutcome {
                    outputs: state.outputs.clone(),
                    plan,
                    report: None,
                });
            }

            let report = self.execute(&plan, &mut state).await?;
            if state.resources.is_empty() {
                state.outputs.clear();
                state.config_hash.clear();
            } else {
                state.outputs = self.resolve_outputs(&state);
            }
            self.finish(&mut state, &plan, &report, DeploymentOperation::Destroy).await?;

            Ok(ApplyOutcome {
                outputs: state.outputs.clone(),
                plan,
                report: Some(report),
            })
        })
        .await
    }

    async fn execute(&self, plan: &DeploymentPlan, state: &mut DeploymentState) -> Result<ExecutionReport> {
        if self.cancel.is_cancelled() {
            return Err(CumulusError::Cancelled {
                reason: String::from("interrupted before execution started"),
            });
        }

        PlanExecutor::new(Arc::clone(&self.provider), self.parallelism, self.retry())
            .with_cancellation(self.cancel.clone())
            .execute(plan, state, Some(self.store))
            .await
    }

    /// Records the run in the history and saves the final state.
    async fn finish(
        &self,
        state: &mut DeploymentState,
        plan: &DeploymentPlan,
        report: &ExecutionReport,
        operation: DeploymentOperation,
    ) -> Result<()> {
        let mut changed: Vec<String> = report
            .results
            .iter()
            .filter(|r| r.outcome == ChangeOutcome::Succeeded)
            .map(|r| r.resource_name.clone())
            .collect();
        changed.dedup();

        let error = (!report.is_success()).then(|| {
            format!(
                "{} failed, {} blocked, {} cancelled",
                report.failed(),
                report.blocked(),
                report.cancelled_count()
            )
        });

        state.add_history(DeploymentHistoryEntry::new(operation, &plan.config_hash, changed, error));
        self.store.save(state).await?;
        info!("{operation} finished, state saved at serial {}", state.serial);
        Ok(())
    }

    /// Resolves the declared outputs against the state. Outputs that cannot
    /// be resolved yet are left out.
    fn resolve_outputs(&self, state: &DeploymentState) -> BTreeMap<String, Value> {
        let mut outputs = BTreeMap::new();
        for (name, expression) in &self.config.outputs {
            match state.resolve_value(expression) {
                Ok(value) => {
                    outputs.insert(name.clone(), value);
                }
                Err(e) => debug!("Output {name} not available: {e}"),
            }
        }
        outputs
    }

    /// Compares recorded attributes with the live resources.
    ///
    /// # Errors
    ///
    /// Returns state load errors or provider read errors.
    pub async fn drift(&self) -> Result<DriftReport> {
        info!("Checking for drift in {}", self.config.project.qualified_name());

        let Some(state) = self.store.load().await? else {
            return Ok(DriftReport::default());
        };

        let retry = self.retry();
        let mut report = DriftReport::default();
        for resource in state.resources.values() {
            let Some(id) = resource.physical_id.as_deref() else {
                continue;
            };
            report.checked += 1;

            let label = format!("Read of {}", resource.name);
            let live = retry
                .run(&label, &self.cancel, || self.provider.read(&resource.resource_type, id))
                .await?;

            let kind = match live {
                None => DriftKind::Missing,
                Some(live) => {
                    let fields: Vec<String> = resource
                        .outputs
                        .iter()
                        .filter(|(key, value)| live.outputs.get(*key) != Some(*value))
                        .map(|(key, _)| key.clone())
                        .collect();
                    if fields.is_empty() {
                        continue;
                    }
                    DriftKind::Modified { fields }
                }
            };

            report.drifted.push(DriftEntry {
                name: resource.name.clone(),
                resource_type: resource.resource_type.clone(),
                physical_id: id.to_string(),
                kind,
            });
        }

        Ok(report)
    }

    /// Returns the stack outputs recorded by the last run.
    ///
    /// # Errors
    ///
    /// Returns an error if the state cannot be loaded.
    pub async fn outputs(&self) -> Result<BTreeMap<String, Value>> {
        Ok(self.store.load().await?.map(|s| s.outputs).unwrap_or_default())
    }

    /// Runs the configured endpoint health checks.
    ///
    /// # Errors
    ///
    /// Returns an error if the state cannot be loaded or the HTTP client
    /// cannot be created.
    pub async fn health(&self) -> Result<Vec<HealthStatus>> {
        let state = self.store.load().await?.unwrap_or_else(|| self.empty_state());
        let checker = HealthChecker::new()?;
        Ok(checker.check_all(&self.config.checks, &state).await)
    }
}

impl std::fmt::Debug for Engine<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("stack", &self.config.project.qualified_name())
            .field("backend", &self.store.backend_type())
            .field("provider", &self.provider.name())
            .field("holder", &self.holder)
            .field("parallelism", &self.parallelism)
            .finish_non_exhaustive()
    }
}

impl ApplyOutcome {
    /// Returns true if the run was declined or had nothing to do.
    #[must_use]
    pub const fn skipped(&self) -> bool {
        self.report.is_none()
    }

    /// Returns true if every change succeeded.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.report.as_ref().is_none_or(ExecutionReport::is_success)
    }
}

impl DriftReport {
    /// Returns true if the state is converged (no drift).
    #[must_use]
    pub const fn is_converged(&self) -> bool {
        self.drifted.is_empty()
    }
}

impl std::fmt::Display for DriftReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_converged() {
            return write!(f, "No drift detected across {} resources", self.checked);
        }
        writeln!(f, "Drift detected:")?;
        for entry in &self.drifted {
            match &entry.kind {
                DriftKind::Missing => writeln!(f, "  - {} ({}): missing", entry.name, entry.physical_id)?,
                DriftKind::Modified { fields } => writeln!(
                    f,
                    "  - {} ({}): {} changed",
                    entry.name,
                    entry.physical_id,
                    fields.join(", ")
                )?,
            }
        }
        Ok(())
    }
}
