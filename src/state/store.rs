//! State store trait definition.
//!
//! This module defines the common interface for state storage backends and
//! the scoped lock helper used by every mutating operation.

use std::future::Future;

use async_trait::async_trait;
use tracing::warn;

use crate::error::Result;
use super::lock::LockInfo;
use super::types::DeploymentState;

/// Trait for state storage backends.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Loads the deployment state.
    ///
    /// Returns `None` if no state exists yet.
    async fn load(&self) -> Result<Option<DeploymentState>>;

    /// Saves the deployment state.
    ///
    /// The save is refused with `VersionMismatch` when the stored serial is
    /// not the serial `state` was loaded at. On success `state.serial` is
    /// bumped to the stored value.
    async fn save(&self, state: &mut DeploymentState) -> Result<()>;

    /// Deletes the deployment state.
    async fn delete(&self) -> Result<()>;

    /// Checks if state exists.
    async fn exists(&self) -> Result<bool>;

    /// Acquires the state lock for `operation`.
    ///
    /// Fails fast with `LockConflict` when a live lock is held. An expired
    /// lock is taken over.
    async fn acquire_lock(&self, holder: &str, operation: &str) -> Result<LockInfo>;

    /// Releases a lock on the state. A lock id that no longer matches the
    /// stored lock is ignored.
    async fn release_lock(&self, lock_id: &str) -> Result<()>;

    /// Removes whatever lock is held, returning it.
    async fn force_unlock(&self) -> Result<Option<LockInfo>>;

    /// Gets current lock information if locked.
    async fn get_lock_info(&self) -> Result<Option<LockInfo>>;

    /// Checks if the state is locked by a live lock.
    async fn is_locked(&self) -> Result<bool> {
        Ok(self.get_lock_info().await?.is_some_and(|l| !l.is_expired()))
    }

    /// Gets the backend type name.
    fn backend_type(&self) -> &'static str;
}

/// Runs `f` while holding the state lock.
///
/// The lock is released on every exit path of `f`, including errors. A
/// release failure is reported only when `f` itself succeeded.
///
/// # Errors
///
/// Returns the lock acquisition error, the error of `f`, or the release error.
pub async fn with_state_lock<T, F, Fut>(
    store: &dyn StateStore,
    holder: &str,
    operation: &str,
    f: F,
) -> Result<T>
where
    F: FnOnce(LockInfo) -> Fut + Send,
    Fut: Future<Output = Result<T>> + Send,
{
    let lock = store.acquire_lock(holder, operation).await?;
    let lock_id = lock.lock_id.clone();

    let result = f(lock).await;
    let released = store.release_lock(&lock_id).await;

    match (result, released) {
        (Ok(value), Ok(())) => Ok(value),
        (Ok(_), Err(e)) => Err(e),
        (Err(e), Err(release_err)) => {
            warn!("Failed to release state lock {lock_id}: {release_err}");
            Err(e)
        }
        (Err(e), Ok(())) => Err(e),
    }
}
