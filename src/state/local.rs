//! Local file-based state storage backend.
//!
//! This module provides a simple file-based state storage for local development
//! and single-machine deployments.

use async_trait::async_trait;
use serde::Deserialize;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::error::{CumulusError, Result, StateError};

use super::lock::{LOCK_EXPIRY_SECS, LockInfo};
use super::store::StateStore;
use super::types::DeploymentState;

/// Default state directory name.
pub const STATE_DIR: &str = ".cumulus";

/// State file name.
const STATE_FILE: &str = "state.json";

/// Lock file name.
const LOCK_FILE: &str = "state.lock";

/// Just enough of the state file to read its serial.
#[derive(Deserialize)]
struct SerialHeader {
    #[serde(default)]
    serial: u64,
}

/// Local file-based state store.
#[derive(Debug)]
pub struct LocalStateStore {
    /// Base directory for state files.
    base_dir: PathBuf,
    /// Path to the state file.
    state_path: PathBuf,
    /// Path to the lock file.
    lock_path: PathBuf,
}

impl LocalStateStore {
    /// Creates a new local state store under `.cumulus/<stack>` in the
    /// current directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the current directory cannot be determined.
    pub fn new(stack: &str) -> Result<Self> {
        let base_dir = std::env::current_dir()
            .map_err(|e| CumulusError::internal(format!("Cannot determine current directory: {e}")))?
            .join(STATE_DIR)
            .join(stack);

        Ok(Self::with_base_dir(base_dir))
    }

    /// Creates a new local state store with a custom base directory.
    #[must_use]
    pub fn with_base_dir(base_dir: impl Into<PathBuf>) -> Self {
        let base_dir = base_dir.into();
        let state_path = base_dir.join(STATE_FILE);
        let lock_path = base_dir.join(LOCK_FILE);

        Self {
            base_dir,
            state_path,
            lock_path,
        }
    }

    /// Creates a new local state store from a custom state file path.
    #[must_use]
    pub fn with_state_path(state_path: impl Into<PathBuf>) -> Self {
        let state_path = state_path.into();
        let base_dir = state_path
            .parent()
            .map_or_else(|| PathBuf::from("."), Path::to_path_buf);
        let lock_path = base_dir.join(LOCK_FILE);

        Self {
            base_dir,
            state_path,
            lock_path,
        }
    }

    /// Returns the path of the state file.
    #[must_use]
    pub fn state_path(&self) -> &Path {
        &self.state_path
    }

    /// Ensures the state directory exists.
    async fn ensure_dir(&self) -> Result<()> {
        if !self.base_dir.exists() {
            debug!("Creating state directory: {}", self.base_dir.display());
            fs::create_dir_all(&self.base_dir).await.map_err(|e| {
                StateError::backend(format!("Failed to create state directory: {e}"))
            })?;
        }
        Ok(())
    }

    /// Reads the serial currently stored on disk, zero when absent.
    async fn stored_serial(&self) -> Result<u64> {
        match fs::read_to_string(&self.state_path).await {
            Ok(content) => {
                let header: SerialHeader = serde_json::from_str(&content).map_err(|e| {
                    StateError::corrupted(format!("Failed to parse state file: {e}"))
                })?;
                Ok(header.serial)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(0),
            Err(e) => Err(StateError::backend(format!("Failed to read state file: {e}")).into()),
        }
    }

    /// Reads the lock file if it exists.
    async fn read_lock_file(&self) -> Result<Option<LockInfo>> {
        let content = match fs::read_to_string(&self.lock_path).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(StateError::corrupted(format!("Failed to read lock file: {e}")).into());
            }
        };

        let lock_info: LockInfo = serde_json::from_str(&content)
            .map_err(|e| StateError::corrupted(format!("Failed to parse lock file: {e}")))?;

        Ok(Some(lock_info))
    }

    /// Creates the lock file, failing if it already exists.
    ///
    /// Returns `false` when another lock file is present.
    async fn create_lock_file(&self, lock_info: &LockInfo) -> Result<bool> {
        self.ensure_dir().await?;

        let content = serde_json::to_string_pretty(lock_info)
            .map_err(|e| StateError::serialization(format!("Failed to serialize lock: {e}")))?;

        let mut file = match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.lock_path)
            .await
        {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => return Ok(false),
            Err(e) => {
                return Err(StateError::LockFailed {
                    message: format!("Failed to create lock file: {e}"),
                }
                .into());
            }
        };

        file.write_all(content.as_bytes()).await.map_err(|e| StateError::LockFailed {
            message: format!("Failed to write lock file: {e}"),
        })?;

        file.sync_all().await.map_err(|e| StateError::LockFailed {
            message: format!("Failed to sync lock file: {e}"),
        })?;

        Ok(true)
    }

    /// Deletes the lock file.
    async fn delete_lock_file(&self) -> Result<()> {
        match fs::remove_file(&self.lock_path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StateError::LockFailed {
                message: format!("Failed to delete lock file: {e}"),
            }
            .into()),
        }
    }
}

#[async_trait]
impl StateStore for LocalStateStore {
    async fn load(&self) -> Result<Option<DeploymentState>> {
        if !self.state_path.exists() {
            debug!("State file does not exist: {}", self.state_path.display());
            return Ok(None);
        }

        debug!("Loading state from: {}", self.state_path.display());

        let content = fs::read_to_string(&self.state_path)
            .await
            .map_err(|e| StateError::corrupted(format!("Failed to read state file: {e}")))?;

        let state: DeploymentState = serde_json::from_str(&content)
            .map_err(|e| StateError::corrupted(format!("Failed to parse state file: {e}")))?;

        Ok(Some(state))
    }

    async fn save(&self, state: &mut DeploymentState) -> Result<()> {
        self.ensure_dir().await?;

        let found = self.stored_serial().await?;
        if found != state.serial {
            return Err(StateError::VersionMismatch {
                expected: state.serial,
                found,
            }
            .into());
        }

        let mut next = state.clone();
        next.serial = found + 1;

        let content = serde_json::to_string_pretty(&next)
            .map_err(|e| StateError::serialization(format!("Failed to serialize state: {e}")))?;

        // Write to a temporary file first, then rename for atomicity
        let temp_path = self.state_path.with_extension("tmp");

        let mut file = fs::File::create(&temp_path).await.map_err(|e| {
            StateError::backend(format!("Failed to create temp state file: {e}"))
        })?;

        file.write_all(content.as_bytes())
            .await
            .map_err(|e| StateError::backend(format!("Failed to write state file: {e}")))?;

        file.sync_all()
            .await
            .map_err(|e| StateError::backend(format!("Failed to sync state file: {e}")))?;

        fs::rename(&temp_path, &self.state_path)
            .await
            .map_err(|e| StateError::backend(format!("Failed to rename state file: {e}")))?;

        state.serial = next.serial;
        debug!(serial = state.serial, "State saved to {}", self.state_path.display());
        Ok(())
    }

    async fn delete(&self) -> Result<()> {
        if self.state_path.exists() {
            info!("Deleting state file: {}", self.state_path.display());
            fs::remove_file(&self.state_path)
                .await
                .map_err(|e| StateError::backend(format!("Failed to delete state file: {e}")))?;
        }

        self.delete_lock_file().await?;

        Ok(())
    }

    async fn exists(&self) -> Result<bool> {
        Ok(self.state_path.exists())
    }

    async fn acquire_lock(&self, holder: &str, operation: &str) -> Result<LockInfo> {
        let lock_info = LockInfo::new(holder, operation);

        if !self.create_lock_file(&lock_info).await? {
            match self.read_lock_file().await? {
                Some(existing) if !existing.is_expired() => {
                    return Err(existing.conflict().into());
                }
                _ => {
                    debug!("Expired lock found, taking over");
                    self.delete_lock_file().await?;
                    if !self.create_lock_file(&lock_info).await? {
                        let holder = self
                            .read_lock_file()
                            .await?
                            .map_or_else(|| String::from("unknown"), |l| l.holder);
                        return Err(StateError::LockFailed {
                            message: format!("lock taken by {holder} while replacing an expired lock"),
                        }
                        .into());
                    }
                }
            }
        }

        info!(
            "Acquired state lock: {} (expires in {}s)",
            lock_info.lock_id, LOCK_EXPIRY_SECS
        );

        Ok(lock_info)
    }

    async fn release_lock(&self, lock_id: &str) -> Result<()> {
        if let Some(existing) = self.read_lock_file().await? {
            if existing.lock_id == lock_id {
                self.delete_lock_file().await?;
                info!("Released state lock: {lock_id}");
            } else {
                debug!(
                    "Lock ID mismatch: expected {lock_id}, found {}",
                    existing.lock_id
                );
            }
        }
        Ok(())
    }

    async fn force_unlock(&self) -> Result<Option<LockInfo>> {
        let existing = self.read_lock_file().await?;
        self.delete_lock_file().await?;
        Ok(existing)
    }

    async fn get_lock_info(&self) -> Result<Option<LockInfo>> {
        self.read_lock_file().await
    }

    fn backend_type(&self) -> &'static str {
        "local"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::with_state_lock;
    use tempfile::TempDir;

    fn create_test_store() -> (LocalStateStore, TempDir) {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let store = LocalStateStore::with_base_dir(temp_dir.path());
        (store, temp_dir)
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let (store, _temp) = create_test_store();

        let mut state = DeploymentState::new("test-project", "dev");
        store.save(&mut state).await.expect("Failed to save state");
        assert_eq!(state.serial, 1);

        let loaded = store
            .load()
            .await
            .expect("Failed to load state")
            .expect("State should exist");

        assert_eq!(loaded.project, "test-project");
        assert_eq!(loaded.stack, "dev");
        assert_eq!(loaded.serial, 1);
    }

    #[tokio::test]
    async fn test_load_nonexistent() {
        let (store, _temp) = create_test_store();

        let result = store.load().await.expect("Load should not fail");
        assert!(result.is_none());
        assert!(!store.exists().await.expect("exists check failed"));
    }

    #[tokio::test]
    async fn test_stale_snapshot_is_rejected() {
        let (store, _temp) = create_test_store();

        let mut first = DeploymentState::new("test-project", "dev");
        store.save(&mut first).await.expect("initial save");

        let mut a = store.load().await.unwrap().unwrap();
        let mut b = store.load().await.unwrap().unwrap();

        store.save(&mut a).await.expect("first writer wins");
        let err = store.save(&mut b).await.unwrap_err();
        assert!(matches!(
            err,
            CumulusError::State(StateError::VersionMismatch {
                expected: 1,
                found: 2
            })
        ));
    }

    #[tokio::test]
    async fn test_lock_acquire_release() {
        let (store, _temp) = create_test_store();

        let lock = store
            .acquire_lock("test-holder", "apply")
            .await
            .expect("Failed to acquire lock");

        assert!(store.is_locked().await.expect("is_locked failed"));

        store
            .release_lock(&lock.lock_id)
            .await
            .expect("Failed to release lock");

        assert!(!store.is_locked().await.expect("is_locked failed"));
    }

    #[tokio::test]
    async fn test_lock_conflict_fails_fast() {
        let (store, _temp) = create_test_store();

        let _lock1 = store
            .acquire_lock("holder-1", "apply")
            .await
            .expect("Failed to acquire first lock");

        let err = store.acquire_lock("holder-2", "plan").await.unwrap_err();
        assert!(matches!(
            err,
            CumulusError::State(StateError::LockConflict { ref holder, .. }) if holder == "holder-1"
        ));
    }

    #[tokio::test]
    async fn test_expired_lock_is_taken_over() {
        let (store, _temp) = create_test_store();

        let mut stale = LockInfo::new("crashed", "apply");
        stale.expires_at = chrono::Utc::now() - chrono::Duration::seconds(5);
        assert!(store.create_lock_file(&stale).await.unwrap());

        let lock = store.acquire_lock("fresh", "apply").await.expect("takeover");
        assert_eq!(
            store.get_lock_info().await.unwrap().map(|l| l.lock_id),
            Some(lock.lock_id)
        );
    }

    #[tokio::test]
    async fn test_scoped_lock_released_on_error() {
        let (store, _temp) = create_test_store();

        let result: Result<()> = with_state_lock(&store, "holder", "apply", |_lock| async {
            Err(CumulusError::internal("boom"))
        })
        .await;
        assert!(result.is_err());
        assert!(!store.is_locked().await.unwrap());

        let value = with_state_lock(&store, "holder", "apply", |lock| async move {
            Ok(lock.holder)
        })
        .await
        .unwrap();
        assert_eq!(value, "holder");
        assert!(!store.is_locked().await.unwrap());
    }

    #[tokio::test]
    async fn test_force_unlock() {
        let (store, _temp) = create_test_store();
        store.acquire_lock("stuck", "apply").await.unwrap();

        let removed = store.force_unlock().await.unwrap();
        assert_eq!(removed.map(|l| l.holder), Some(String::from("stuck")));
        assert!(store.get_lock_info().await.unwrap().is_none());
    }
}
