//! State management module for Cumulus.
//!
//! This module provides persistent state storage for tracking provisioned
//! resources, their identifiers and outputs, and the operation history.

mod store;
mod local;
mod s3;
mod lock;
mod types;

pub use store::{StateStore, with_state_lock};
pub use local::{LocalStateStore, STATE_DIR};
pub use s3::S3StateStore;
pub use lock::{LOCK_EXPIRY_SECS, LockInfo, generate_holder_id};
pub use types::{
    DeploymentHistoryEntry, DeploymentOperation, DeploymentState, PendingDelete, ResourceState,
    ResourceStatus, STATE_VERSION,
};
