//! Plan executor for applying deployment plans.
//!
//! This module runs the changes of a plan against a [`CloudProvider`]:
//! independent changes run concurrently up to a parallelism limit, a failed
//! change blocks everything that depends on it, and the state is recorded
//! after every completed change.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::ReplaceStrategy;
use crate::error::{CumulusError, PlanError, ProviderError, Result};
use crate::provider::{CloudProvider, ProvisionedResource, new_client_token};
use crate::resource::{Properties, TemplateError};
use crate::state::{DeploymentState, PendingDelete, ResourceState, ResourceStatus, StateStore};

use super::plan::{ChangeAction, ChangePhase, DeploymentPlan, PlannedChange};
use super::retry::RetryPolicy;

/// Executor for deployment plans.
pub struct PlanExecutor {
    /// Cloud provider.
    provider: Arc<dyn CloudProvider>,
    /// Maximum number of concurrent provider operations.
    parallelism: usize,
    /// Retry policy for each provider call.
    retry: RetryPolicy,
    /// Stops dispatching new changes when cancelled.
    cancel: CancellationToken,
}

/// Final outcome of a planned change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOutcome {
    /// The provider operation succeeded.
    Succeeded,
    /// Nothing had to be done.
    Unchanged,
    /// The provider operation failed.
    Failed,
    /// Skipped because a dependency did not succeed.
    Blocked,
    /// Skipped because the run was cancelled.
    Cancelled,
}

/// Result of executing a single change.
#[derive(Debug, Clone)]
pub struct ChangeResult {
    /// Change index in the plan.
    pub index: usize,
    /// Resource name.
    pub resource_name: String,
    /// Planned action.
    pub action: ChangeAction,
    /// Whether the change deleted an old copy.
    pub old_copy: bool,
    /// Outcome.
    pub outcome: ChangeOutcome,
    /// Identifier of the resulting resource (if any).
    pub physical_id: Option<String>,
    /// Error message (if failed or blocked).
    pub error: Option<String>,
    /// Time spent on the change.
    pub duration: Duration,
}

/// Result of executing the entire plan.
#[derive(Debug, Clone, Default)]
pub struct ExecutionReport {
    /// Individual change results, in plan order.
    pub results: Vec<ChangeResult>,
    /// Total wall time.
    pub duration: Duration,
    /// Whether the run was cancelled.
    pub cancelled: bool,
}

/// Successful output of a change task.
enum TaskOutput {
    Provisioned(ProvisionedResource),
    Deleted,
}

/// Failed output of a change task.
struct TaskFailure {
    error: ProviderError,
    old_deleted: bool,
}

/// Everything a change task needs, owned.
struct Job {
    action: ChangeAction,
    resource_type: String,
    resource_name: String,
    physical_id: Option<String>,
    old_inputs: Properties,
    inputs: Properties,
    strategy: ReplaceStrategy,
    /// Shared by every attempt of this change's create.
    client_token: String,
}

type TaskResult = std::result::Result<TaskOutput, TaskFailure>;

impl PlanExecutor {
    /// Creates a new plan executor.
    #[must_use]
    pub fn new(provider: Arc<dyn CloudProvider>, parallelism: usize, retry: RetryPolicy) -> Self {
        Self {
            provider,
            parallelism: parallelism.max(1),
            retry,
            cancel: CancellationToken::new(),
        }
    }

    /// Sets the cancellation token.
    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Executes a deployment plan, recording results into `state`.
    ///
    /// The apply phase runs to completion before the delete phase starts.
    /// When a store is given, the state is saved after every completed change.
    ///
    /// # Errors
    ///
    /// Returns an error if saving the state fails or a task panics. Changes
    /// already in flight are awaited first.
    pub async fn execute(
        &self,
        plan: &DeploymentPlan,
        state: &mut DeploymentState,
        store: Option<&dyn StateStore>,
    ) -> Result<ExecutionReport> {
        let started = Instant::now();
        info!(
            "Executing deployment plan with {} changes (parallelism {})",
            plan.change_count(),
            self.parallelism
        );

        let mut run = Run {
            results: vec![None; plan.changes.len()],
            fatal: None,
        };

        for phase in [ChangePhase::Apply, ChangePhase::Delete] {
            self.execute_phase(plan, phase, state, store, &mut run).await;
        }

        if let Some(e) = run.fatal {
            return Err(e);
        }

        let results: Vec<ChangeResult> = run.results.into_iter().flatten().collect();
        let report = ExecutionReport {
            cancelled: results.iter().any(|r| r.outcome == ChangeOutcome::Cancelled),
            results,
            duration: started.elapsed(),
        };
        info!(
            "Execution finished: {} succeeded, {} failed, {} blocked",
            report.succeeded(),
            report.failed(),
            report.blocked()
        );
        Ok(report)
    }

    async fn execute_phase(
        &self,
        plan: &DeploymentPlan,
        phase: ChangePhase,
        state: &mut DeploymentState,
        store: Option<&dyn StateStore>,
        run: &mut Run,
    ) {
        let mut pending: Vec<usize> = plan
            .changes
            .iter()
            .enumerate()
            .filter(|(_, c)| c.phase == phase)
            .map(|(i, _)| i)
            .collect();
        let mut in_flight: JoinSet<(usize, Instant, Properties, TaskResult)> = JoinSet::new();
        let mut cancel_noticed = false;

        loop {
            self.settle(plan, &mut pending, state, run);

            let mut k = 0;
            while k < pending.len() && in_flight.len() < self.parallelism {
                let index = pending[k];
                let change = &plan.changes[index];
                if !change.dependencies.iter().all(|&d| run.is_done_ok(d)) {
                    k += 1;
                    continue;
                }
                pending.remove(k);

                let inputs = match resolve_inputs(change, state) {
                    Ok(inputs) => inputs,
                    Err(e) => {
                        error!("Cannot start {}: {e}", change.description());
                        record_failure(state, change, &e.to_string(), false);
                        run.record(index, change, ChangeOutcome::Failed, None, Some(e.to_string()), Duration::ZERO);
                        self.checkpoint(state, store, run).await;
                        continue;
                    }
                };

                info!("{}", change.description());
                let job = Job {
                    action: change.action,
                    resource_type: change.resource_type.clone(),
                    resource_name: change.resource_name.clone(),
                    physical_id: change.physical_id.clone(),
                    old_inputs: state
                        .get(&change.resource_name)
                        .map(|r| r.inputs.clone())
                        .unwrap_or_default(),
                    inputs: inputs.clone(),
                    strategy: change.replace_strategy,
                    client_token: new_client_token(),
                };
                let provider = Arc::clone(&self.provider);
                let retry = self.retry;
                let cancel = self.cancel.clone();
                let dispatched = Instant::now();
                in_flight.spawn(async move {
                    let result = run_job(provider.as_ref(), retry, &cancel, job).await;
                    (index, dispatched, inputs, result)
                });
            }

            if in_flight.is_empty() {
                if !pending.is_empty() {
                    // Only reachable when dependencies point forward in the plan.
                    for index in pending.drain(..) {
                        let change = &plan.changes[index];
                        run.record(index, change, ChangeOutcome::Blocked, None, Some(String::from("unsatisfiable dependencies")), Duration::ZERO);
                    }
                }
                break;
            }

            let joined = tokio::select! {
                biased;
                joined = in_flight.join_next() => joined,
                () = self.cancel.cancelled(), if !cancel_noticed => {
                    cancel_noticed = true;
                    warn!("Cancellation requested, waiting for {} in-flight operations", in_flight.len());
                    continue;
                }
            };

            match joined {
                Some(Ok((index, dispatched, inputs, result))) => {
                    let change = &plan.changes[index];
                    let elapsed = dispatched.elapsed();
                    match result {
                        Ok(output) => {
                            let physical_id = record_success(state, change, output, inputs);
                            run.record(index, change, ChangeOutcome::Succeeded, physical_id, None, elapsed);
                        }
                        Err(failure) => {
                            error!("{} failed: {}", change.description(), failure.error);
                            let message = failure.error.to_string();
                            record_failure(state, change, &message, failure.old_deleted);
                            run.record(index, change, ChangeOutcome::Failed, None, Some(message), elapsed);
                        }
                    }
                    self.checkpoint(state, store, run).await;
                }
                Some(Err(e)) => {
                    error!("Change task aborted: {e}");
                    run.fatal
                        .get_or_insert_with(|| CumulusError::internal(format!("change task aborted: {e}")));
                }
                None => {}
            }
        }
    }

    /// Resolves pending changes that need no provider call.
    fn settle(&self, plan: &DeploymentPlan, pending: &mut Vec<usize>, state: &mut DeploymentState, run: &mut Run) {
        let halted = self.cancel.is_cancelled() || run.fatal.is_some();
        loop {
            let mut settled = false;
            let mut k = 0;
            while k < pending.len() {
                let index = pending[k];
                let change = &plan.changes[index];

                if change.action == ChangeAction::NoOp {
                    let physical_id = change.physical_id.clone();
                    run.record(index, change, ChangeOutcome::Unchanged, physical_id, None, Duration::ZERO);
                } else if halted {
                    run.record(index, change, ChangeOutcome::Cancelled, None, None, Duration::ZERO);
                } else if let Some(blocker) = change.dependencies.iter().find_map(|&d| run.failed_name(d)) {
                    let message = format!("dependency '{blocker}' did not succeed");
                    warn!("Skipping {}: {message}", change.description());
                    record_blocked(state, change, &message);
                    run.record(index, change, ChangeOutcome::Blocked, None, Some(message), Duration::ZERO);
                } else {
                    k += 1;
                    continue;
                }
                pending.remove(k);
                settled = true;
            }
            if !settled {
                break;
            }
        }
    }

    async fn checkpoint(&self, state: &mut DeploymentState, store: Option<&dyn StateStore>, run: &mut Run) {
        let Some(store) = store else {
            return;
        };
        if run.fatal.is_some() {
            return;
        }
        if let Err(e) = store.save(state).await {
            error!("Failed to record state, stopping: {e}");
            run.fatal = Some(e);
        }
    }
}

impl std::fmt::Debug for PlanExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlanExecutor")
            .field("provider", &self.provider.name())
            .field("parallelism", &self.parallelism)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

/// Bookkeeping for one execution.
struct Run {
    results: Vec<Option<ChangeResult>>,
    fatal: Option<CumulusError>,
}

impl Run {
    fn record(
        &mut self,
        index: usize,
        change: &PlannedChange,
        outcome: ChangeOutcome,
        physical_id: Option<String>,
        error: Option<String>,
        duration: Duration,
    ) {
        self.results[index] = Some(ChangeResult {
            index,
            resource_name: change.resource_name.clone(),
            action: change.action,
            old_copy: change.old_copy,
            outcome,
            physical_id,
            error,
            duration,
        });
    }

    fn is_done_ok(&self, index: usize) -> bool {
        self.results[index]
            .as_ref()
            .is_some_and(|r| matches!(r.outcome, ChangeOutcome::Succeeded | ChangeOutcome::Unchanged))
    }

    fn failed_name(&self, index: usize) -> Option<&str> {
        self.results[index]
            .as_ref()
            .filter(|r| matches!(r.outcome, ChangeOutcome::Failed | ChangeOutcome::Blocked | ChangeOutcome::Cancelled))
            .map(|r| r.resource_name.as_str())
    }
}

fn resolve_inputs(change: &PlannedChange, state: &DeploymentState) -> std::result::Result<Properties, PlanError> {
    if change.phase == ChangePhase::Delete {
        return Ok(Properties::new());
    }
    state.resolve_properties(&change.properties).map_err(|e| match e {
        TemplateError::Unresolved { reference } => PlanError::UnresolvedReference {
            resource: change.resource_name.clone(),
            reference: reference.to_string(),
            reason: String::from("no recorded value"),
        },
        other => PlanError::UnresolvedReference {
            resource: change.resource_name.clone(),
            reference: String::new(),
            reason: other.to_string(),
        },
    })
}

async fn run_job(provider: &dyn CloudProvider, retry: RetryPolicy, cancel: &CancellationToken, job: Job) -> TaskResult {
    let label = format!("{} {}", job.action, job.resource_name);
    let fail = |error| TaskFailure {
        error,
        old_deleted: false,
    };

    match job.action {
        ChangeAction::Create => retry
            .run(&label, cancel, || create(provider, &job))
            .await
            .map(TaskOutput::Provisioned)
            .map_err(fail),
        ChangeAction::Update => {
            let id = job.physical_id.as_deref().ok_or_else(|| fail(missing_id(&job)))?;
            retry
                .run(&label, cancel, || provider.update(&job.resource_type, id, &job.old_inputs, &job.inputs))
                .await
                .map(TaskOutput::Provisioned)
                .map_err(fail)
        }
        ChangeAction::Replace => {
            if job.strategy == ReplaceStrategy::DeleteBeforeCreate
                && let Some(id) = job.physical_id.as_deref()
            {
                delete_tolerant(provider, retry, cancel, &label, &job.resource_type, id)
                    .await
                    .map_err(fail)?;
                debug!("Deleted old copy {id} of {}", job.resource_name);
                return retry
                    .run(&label, cancel, || create(provider, &job))
                    .await
                    .map(TaskOutput::Provisioned)
                    .map_err(|error| TaskFailure {
                        error,
                        old_deleted: true,
                    });
            }
            retry
                .run(&label, cancel, || create(provider, &job))
                .await
                .map(TaskOutput::Provisioned)
                .map_err(fail)
        }
        ChangeAction::Delete => match job.physical_id.as_deref() {
            Some(id) => delete_tolerant(provider, retry, cancel, &label, &job.resource_type, id)
                .await
                .map(|()| TaskOutput::Deleted)
                .map_err(fail),
            None => Ok(TaskOutput::Deleted),
        },
        ChangeAction::NoOp => Err(fail(ProviderError::InvalidRequest {
            message: String::from("no operation to run"),
        })),
    }
}

/// Submits the create of a job. Retries reuse the job's client token, so a
/// create accepted before a transient failure is not submitted twice.
async fn create(provider: &dyn CloudProvider, job: &Job) -> std::result::Result<ProvisionedResource, ProviderError> {
    provider
        .create(&job.resource_type, &job.resource_name, &job.client_token, &job.inputs)
        .await
}

/// Deletes a resource, treating an already missing one as deleted.
async fn delete_tolerant(
    provider: &dyn CloudProvider,
    retry: RetryPolicy,
    cancel: &CancellationToken,
    label: &str,
    resource_type: &str,
    physical_id: &str,
) -> std::result::Result<(), ProviderError> {
    match retry.run(label, cancel, || provider.delete(resource_type, physical_id)).await {
        Err(ProviderError::NotFound { .. }) => {
            debug!("{physical_id} was already gone");
            Ok(())
        }
        other => other,
    }
}

fn missing_id(job: &Job) -> ProviderError {
    ProviderError::NotFound {
        resource_type: job.resource_type.clone(),
        identifier: format!("{} (no recorded identifier)", job.resource_name),
    }
}

/// Records a successful change and returns the resulting identifier.
fn record_success(
    state: &mut DeploymentState,
    change: &PlannedChange,
    output: TaskOutput,
    inputs: Properties,
) -> Option<String> {
    match output {
        TaskOutput::Provisioned(provisioned) => {
            info!("{} done ({})", change.description(), provisioned.physical_id);
            let mut resource = ResourceState::new(&change.resource_name, &change.resource_type, ResourceStatus::Applied);
            resource.physical_id = Some(provisioned.physical_id.clone());
            resource.properties = change.properties.clone();
            resource.inputs = inputs;
            resource.outputs = provisioned.outputs;
            resource.dependencies = change.resource_dependencies.clone();
            resource.input_hash = change.new_hash.clone().unwrap_or_default();
            resource.protect = change.protect;
            state.set_resource(resource);

            if change.action == ChangeAction::Replace
                && change.replace_strategy == ReplaceStrategy::CreateBeforeDelete
                && let Some(old_id) = &change.physical_id
            {
                state.add_pending_delete(PendingDelete {
                    name: change.resource_name.clone(),
                    resource_type: change.resource_type.clone(),
                    physical_id: old_id.clone(),
                    last_error: None,
                    since: Utc::now(),
                });
            }
            Some(provisioned.physical_id)
        }
        TaskOutput::Deleted => {
            info!("{} done", change.description());
            if change.old_copy {
                if let Some(id) = &change.physical_id {
                    state.remove_pending_delete(id);
                }
            } else {
                state.remove_resource(&change.resource_name);
            }
            None
        }
    }
}

fn record_failure(state: &mut DeploymentState, change: &PlannedChange, message: &str, old_deleted: bool) {
    if change.old_copy {
        if let Some(id) = &change.physical_id {
            let since = state
                .pending_deletes
                .iter()
                .find(|p| &p.physical_id == id)
                .map_or_else(Utc::now, |p| p.since);
            state.add_pending_delete(PendingDelete {
                name: change.resource_name.clone(),
                resource_type: change.resource_type.clone(),
                physical_id: id.clone(),
                last_error: Some(message.to_string()),
                since,
            });
        }
        return;
    }
    mark(state, change, ResourceStatus::Failed, message, old_deleted);
}

fn record_blocked(state: &mut DeploymentState, change: &PlannedChange, message: &str) {
    if !change.old_copy {
        mark(state, change, ResourceStatus::Blocked, message, false);
    }
}

fn mark(state: &mut DeploymentState, change: &PlannedChange, status: ResourceStatus, message: &str, clear_id: bool) {
    let mut resource = match state.get(&change.resource_name) {
        Some(existing) => existing.clone(),
        None if change.phase == ChangePhase::Apply => {
            let mut fresh = ResourceState::new(&change.resource_name, &change.resource_type, status);
            fresh.properties = change.properties.clone();
            fresh.dependencies = change.resource_dependencies.clone();
            fresh.protect = change.protect;
            fresh
        }
        None => return,
    };
    resource.status = status;
    resource.last_error = Some(message.to_string());
    resource.updated_at = Utc::now();
    if clear_id {
        resource.physical_id = None;
    }
    state.set_resource(resource);
}

impl ExecutionReport {
    fn count(&self, outcome: ChangeOutcome) -> usize {
        self.results.iter().filter(|r| r.outcome == outcome).count()
    }

    /// Number of changes that succeeded.
    #[must_use]
    pub fn succeeded(&self) -> usize {
        self.count(ChangeOutcome::Succeeded)
    }

    /// Number of changes that failed.
    #[must_use]
    pub fn failed(&self) -> usize {
        self.count(ChangeOutcome::Failed)
    }

    /// Number of changes blocked by a failed dependency.
    #[must_use]
    pub fn blocked(&self) -> usize {
        self.count(ChangeOutcome::Blocked)
    }

    /// Number of changes skipped by cancellation.
    #[must_use]
    pub fn cancelled_count(&self) -> usize {
        self.count(ChangeOutcome::Cancelled)
    }

    /// Returns true if every change succeeded or was unchanged.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.results
            .iter()
            .all(|r| matches!(r.outcome, ChangeOutcome::Succeeded | ChangeOutcome::Unchanged))
    }

    /// Returns the result for a resource's apply-phase change, or its
    /// deletion when it has none.
    #[must_use]
    pub fn result_for(&self, resource_name: &str) -> Option<&ChangeResult> {
        self.results
            .iter()
            .find(|r| r.resource_name == resource_name && !r.old_copy)
    }

    /// Results that did not succeed.
    pub fn problems(&self) -> impl Iterator<Item = &ChangeResult> {
        self.results
            .iter()
            .filter(|r| !matches!(r.outcome, ChangeOutcome::Succeeded | ChangeOutcome::Unchanged))
    }
}

impl std::fmt::Display for ChangeOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Succeeded => "succeeded",
            Self::Unchanged => "unchanged",
            Self::Failed => "failed",
            Self::Blocked => "blocked",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}
