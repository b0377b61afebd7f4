//! S3-based state storage backend.
//!
//! This module provides a remote state storage using AWS S3 (or compatible services)
//! for team collaboration. Lock acquisition and state saves use conditional
//! writes so two runs cannot both succeed.

use async_trait::async_trait;
use aws_sdk_s3::Client;
use aws_sdk_s3::error::ProvideErrorMetadata;
use serde::Deserialize;
use tracing::{debug, info};

use crate::error::{Result, StateError};

use super::lock::{LOCK_EXPIRY_SECS, LockInfo};
use super::store::StateStore;
use super::types::DeploymentState;

/// State file key suffix.
const STATE_KEY: &str = "state.json";

/// Lock file key suffix.
const LOCK_KEY: &str = "state.lock";

/// Error codes S3 returns when a conditional write loses.
const CONDITION_FAILED_CODES: &[&str] = &["PreconditionFailed", "ConditionalRequestConflict"];

#[derive(Deserialize)]
struct SerialHeader {
    #[serde(default)]
    serial: u64,
}

/// A fetched object and its entity tag.
struct Object {
    content: String,
    e_tag: Option<String>,
}

/// Precondition of a conditional put.
enum Condition<'a> {
    Unconditional,
    Absent,
    Matches(&'a str),
}

/// S3-based state store.
#[derive(Debug)]
pub struct S3StateStore {
    /// S3 client.
    client: Client,
    /// Bucket name.
    bucket: String,
    /// Key prefix.
    prefix: String,
}

fn normalize_prefix(prefix: Option<&str>) -> String {
    prefix
        .map(|p| {
            let p = p.trim_matches('/');
            if p.is_empty() {
                String::new()
            } else {
                format!("{p}/")
            }
        })
        .unwrap_or_default()
}

impl S3StateStore {
    /// Creates a new S3 state store.
    pub async fn new(bucket: &str, prefix: Option<&str>, region: Option<&str>) -> Self {
        let config = if let Some(region_str) = region {
            aws_config::from_env()
                .region(aws_config::Region::new(region_str.to_string()))
                .load()
                .await
        } else {
            aws_config::load_from_env().await
        };

        Self::with_client(Client::new(&config), bucket, prefix)
    }

    /// Creates a new S3 state store with an existing client.
    #[must_use]
    pub fn with_client(client: Client, bucket: &str, prefix: Option<&str>) -> Self {
        Self {
            client,
            bucket: bucket.to_string(),
            prefix: normalize_prefix(prefix),
        }
    }

    /// Gets the full S3 key for a file.
    fn key(&self, file: &str) -> String {
        format!("{}{file}", self.prefix)
    }

    /// Gets an object from S3.
    async fn get_object(&self, key: &str) -> Result<Option<Object>> {
        let result = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await;

        match result {
            Ok(response) => {
                let e_tag = response.e_tag().map(str::to_string);
                let bytes = response
                    .body
                    .collect()
                    .await
                    .map_err(|e| StateError::backend(format!("Failed to read S3 object: {e}")))?;

                let content = String::from_utf8(bytes.to_vec())
                    .map_err(|e| StateError::corrupted(format!("Invalid UTF-8 in S3 object: {e}")))?;

                Ok(Some(Object { content, e_tag }))
            }
            Err(sdk_err) => {
                let service_err = sdk_err.into_service_error();
                if service_err.is_no_such_key() {
                    Ok(None)
                } else {
                    Err(StateError::backend(format!("S3 get error: {service_err}")).into())
                }
            }
        }
    }

    /// Puts an object to S3.
    ///
    /// Returns `false` when the precondition was not met.
    async fn put_object(&self, key: &str, content: &str, condition: Condition<'_>) -> Result<bool> {
        let mut request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(content.as_bytes().to_vec().into())
            .content_type("application/json");

        request = match condition {
            Condition::Unconditional => request,
            Condition::Absent => request.if_none_match("*"),
            Condition::Matches(e_tag) => request.if_match(e_tag),
        };

        match request.send().await {
            Ok(_) => Ok(true),
            Err(sdk_err) => {
                let service_err = sdk_err.into_service_error();
                if service_err
                    .code()
                    .is_some_and(|code| CONDITION_FAILED_CODES.contains(&code))
                {
                    Ok(false)
                } else {
                    Err(StateError::backend(format!("S3 put error: {service_err}")).into())
                }
            }
        }
    }

    /// Deletes an object from S3.
    async fn delete_object(&self, key: &str) -> Result<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| StateError::backend(format!("S3 delete error: {e}")))?;

        Ok(())
    }

    /// Checks if an object exists in S3.
    async fn object_exists(&self, key: &str) -> Result<bool> {
        let result = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await;

        match result {
            Ok(_) => Ok(true),
            Err(sdk_err) => {
                let service_err = sdk_err.into_service_error();
                if service_err.is_not_found() {
                    Ok(false)
                } else {
                    Err(StateError::backend(format!("S3 head error: {service_err}")).into())
                }
            }
        }
    }

    fn parse_serial(content: &str) -> Result<u64> {
        let header: SerialHeader = serde_json::from_str(content)
            .map_err(|e| StateError::corrupted(format!("Failed to parse state: {e}")))?;
        Ok(header.serial)
    }

    fn parse_lock(content: &str) -> Result<LockInfo> {
        Ok(serde_json::from_str(content)
            .map_err(|e| StateError::corrupted(format!("Failed to parse lock: {e}")))?)
    }
}

#[async_trait]
impl StateStore for S3StateStore {
    async fn load(&self) -> Result<Option<DeploymentState>> {
        let key = self.key(STATE_KEY);
        debug!("Loading state from s3://{}/{key}", self.bucket);

        let Some(object) = self.get_object(&key).await? else {
            debug!("No state found in S3");
            return Ok(None);
        };

        let state: DeploymentState = serde_json::from_str(&object.content)
            .map_err(|e| StateError::corrupted(format!("Failed to parse state: {e}")))?;

        info!("Loaded state for {}/{} (serial {})", state.project, state.stack, state.serial);
        Ok(Some(state))
    }

    async fn save(&self, state: &mut DeploymentState) -> Result<()> {
        let key = self.key(STATE_KEY);

        let current = self.get_object(&key).await?;
        let found = current
            .as_ref()
            .map(|o| Self::parse_serial(&o.content))
            .transpose()?
            .unwrap_or(0);
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

        let condition = match current.as_ref().and_then(|o| o.e_tag.as_deref()) {
            Some(e_tag) => Condition::Matches(e_tag),
            None if current.is_none() => Condition::Absent,
            None => Condition::Unconditional,
        };

        if !self.put_object(&key, &content, condition).await? {
            let found = match self.get_object(&key).await? {
                Some(object) => Self::parse_serial(&object.content)?,
                None => 0,
            };
            return Err(StateError::VersionMismatch {
                expected: state.serial,
                found,
            }
            .into());
        }

        state.serial = next.serial;
        debug!(serial = state.serial, "State saved to s3://{}/{key}", self.bucket);
        Ok(())
    }

    async fn delete(&self) -> Result<()> {
        let state_key = self.key(STATE_KEY);
        let lock_key = self.key(LOCK_KEY);

        info!("Deleting state from s3://{}/{state_key}", self.bucket);

        self.delete_object(&state_key).await?;
        self.delete_object(&lock_key).await?;

        Ok(())
    }

    async fn exists(&self) -> Result<bool> {
        let key = self.key(STATE_KEY);
        self.object_exists(&key).await
    }

    async fn acquire_lock(&self, holder: &str, operation: &str) -> Result<LockInfo> {
        let key = self.key(LOCK_KEY);
        let lock_info = LockInfo::new(holder, operation);
        let content = serde_json::to_string_pretty(&lock_info)
            .map_err(|e| StateError::serialization(format!("Failed to serialize lock: {e}")))?;

        if !self.put_object(&key, &content, Condition::Absent).await? {
            let Some(object) = self.get_object(&key).await? else {
                return Err(StateError::LockFailed {
                    message: String::from("lock disappeared while being inspected; retry"),
                }
                .into());
            };
            let existing = Self::parse_lock(&object.content)?;
            if !existing.is_expired() {
                return Err(existing.conflict().into());
            }

            debug!("Expired lock found, taking over");
            let condition = object
                .e_tag
                .as_deref()
                .map_or(Condition::Unconditional, Condition::Matches);
            if !self.put_object(&key, &content, condition).await? {
                return Err(StateError::LockFailed {
                    message: String::from("another run replaced the expired lock first"),
                }
                .into());
            }
        }

        info!(
            "Acquired state lock: {} (expires in {}s)",
            lock_info.lock_id, LOCK_EXPIRY_SECS
        );

        Ok(lock_info)
    }

    async fn release_lock(&self, lock_id: &str) -> Result<()> {
        let key = self.key(LOCK_KEY);

        if let Some(object) = self.get_object(&key).await? {
            let existing = Self::parse_lock(&object.content)?;

            if existing.lock_id == lock_id {
                self.delete_object(&key).await?;
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
        let existing = self.get_lock_info().await?;
        if existing.is_some() {
            self.delete_object(&self.key(LOCK_KEY)).await?;
        }
        Ok(existing)
    }

    async fn get_lock_info(&self) -> Result<Option<LockInfo>> {
        let key = self.key(LOCK_KEY);

        match self.get_object(&key).await? {
            Some(object) => Ok(Some(Self::parse_lock(&object.content)?)),
            None => Ok(None),
        }
    }

    fn backend_type(&self) -> &'static str {
        "s3"
    }
}
