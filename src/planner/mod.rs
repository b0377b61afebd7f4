//! Planning module for deployment operations.
//!
//! This module handles the comparison between declared and recorded state,
//! generating execution plans and running them against a provider.

mod diff;
mod executor;
mod plan;
mod retry;

pub use diff::{DiffDetail, DiffEngine, DiffResult, DiffType, ResourceDiff};
pub use executor::{ChangeOutcome, ChangeResult, ExecutionReport, PlanExecutor};
pub use plan::{ChangeAction, ChangePhase, DeploymentPlan, PlannedChange};
pub use retry::RetryPolicy;
