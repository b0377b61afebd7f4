// ============================================================================
// Strict linting - Dangerous or non-idiomatic practices are forbidden
// ============================================================================

#![deny(warnings)]                    // All warnings are treated as errors
#![deny(unsafe_code)]                 // Unsafe code is forbidden
#![deny(missing_docs)]                // All public items must be documented
#![deny(dead_code)]                   // Unused code is forbidden
#![deny(non_camel_case_types)]        // Types must follow CamelCase convention

// Additional strictness - Leave nothing unchecked
#![deny(unused_imports)]              // Unused imports are forbidden
#![deny(unused_variables)]            // Unused variables are forbidden
#![deny(unused_must_use)]             // Must handle Result and Option explicitly
#![deny(non_snake_case)]              // Variables and functions must be snake_case
#![deny(non_upper_case_globals)]      // Constants must be UPPER_CASE
#![deny(nonstandard_style)]           // Non-standard code style is forbidden
#![forbid(unsafe_op_in_unsafe_fn)]    // Unsafe ops in unsafe fns are forbidden

// Clippy lints (warnings only)
#![warn(clippy::all)]                 // All standard Clippy lints
#![warn(clippy::pedantic)]            // Very strict Clippy lints
#![warn(clippy::nursery)]             // Experimental lints
#![warn(clippy::unwrap_used)]         // unwrap() warning
#![warn(clippy::expect_used)]         // expect() warning
#![warn(clippy::panic)]               // panic!() warning
#![warn(clippy::print_stdout)]        // println!() warning
#![warn(clippy::todo)]                // TODO warning
#![warn(clippy::unimplemented)]       // unimplemented!() warning
#![warn(clippy::missing_const_for_fn)] // Force const when possible
#![warn(clippy::unwrap_in_result)]    // unwrap() in Result warning
#![warn(clippy::module_inception)]    // Module with same name as crate warning
#![warn(clippy::redundant_clone)]     // Useless clones warning
#![warn(clippy::shadow_unrelated)]    // Shadowing unrelated variables warning
#![warn(clippy::too_many_arguments)]  // Limit function arguments
#![warn(clippy::cognitive_complexity)] // Limit cognitive complexity

// Safety and robustness lints
#![deny(overflowing_literals)]        // Overflowing literals are forbidden
#![deny(arithmetic_overflow)]         // Arithmetic overflow is forbidden

// ============================================================================
// Crate Documentation
// ============================================================================

//! # Cumulus
//!
//! A declarative, idempotent provisioning engine for AWS infrastructure.
//!
//! ## Overview
//!
//! Cumulus reads a stack of resource declarations and converges the cloud to
//! it, allowing you to:
//!
//! - Declare VPCs, subnets, instances, load balancers and buckets in YAML
//! - Reference attributes of other resources with `${Name.Attribute}`
//! - Preview every change before it happens
//! - Apply changes concurrently in dependency order, resuming after failures
//! - Track what was provisioned in a versioned, locked state snapshot
//!
//! ## Architecture
//!
//! A run goes through four stages:
//!
//! 1. **Graph**: declarations and their references form a DAG
//! 2. **Diff**: declared properties are compared with the recorded state
//! 3. **Plan**: creates, updates and replacements in dependency order,
//!    deletions in reverse order
//! 4. **Execute**: independent changes run concurrently against the provider
//!
//! ## Modules
//!
//! - [`config`]: Configuration parsing and validation
//! - [`resource`]: Resource declarations, references and the type registry
//! - [`graph`]: Dependency graph construction and ordering
//! - [`state`]: State storage backends (local, S3)
//! - [`provider`]: Cloud provider abstraction (Cloud Control, in-memory)
//! - [`planner`]: Diff computation, planning and execution
//! - [`engine`]: Plan, apply, destroy and drift under the state lock
//! - [`health`]: Endpoint health checks
//! - [`cli`]: Command-line interface
//!
//! ## Example
//!
//! ```yaml
//! project:
//!   name: web
//!   stack: prod
//!
//! resources:
//!   - name: Vpc
//!     type: AWS::EC2::VPC
//!     properties:
//!       CidrBlock: 10.0.0.0/16
//!   - name: Subnet
//!     type: AWS::EC2::Subnet
//!     properties:
//!       VpcId: ${Vpc.id}
//!       CidrBlock: 10.0.0.0/18
//! ```

// ============================================================================
// Modules
// ============================================================================

pub mod cli;
pub mod config;
pub mod engine;
pub mod error;
pub mod graph;
pub mod health;
pub mod planner;
pub mod provider;
pub mod resource;
pub mod state;

// ============================================================================
// Re-exports
// ============================================================================

pub use cli::{Cli, Commands, OutputFormatter};
pub use config::{ConfigHasher, ConfigParser, ConfigValidator, DeployConfig};
pub use engine::{ApplyOutcome, DriftReport, Engine};
pub use error::{CumulusError, Result};
pub use graph::ResourceGraph;
pub use planner::{DeploymentPlan, DiffEngine, ExecutionReport, PlanExecutor};
pub use provider::{CloudControlProvider, CloudProvider, MemoryProvider};
pub use state::{DeploymentState, LocalStateStore, S3StateStore, StateStore};
