//! In-memory provider.
//!
//! Resources live in a map guarded by a mutex. Identifiers and read-only
//! attributes are synthesized from the type registry. Failures can be
//! injected per logical name, which makes the provider the workhorse of the
//! engine tests and of `provider.kind: memory` rehearsals.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use crate::error::{ProviderError, ProviderResult};
use crate::resource::{Properties, registry};

use super::{CloudProvider, ProvisionedResource};

/// Kind of provider call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderOperation {
    /// `create`.
    Create,
    /// `read`.
    Read,
    /// `update`.
    Update,
    /// `delete`.
    Delete,
}

/// A call recorded by the memory provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderCall {
    /// Operation.
    pub operation: ProviderOperation,
    /// Resource type.
    pub resource_type: String,
    /// Logical name of the resource, when known.
    pub logical_name: String,
}

#[derive(Debug, Clone)]
struct MemoryResource {
    resource_type: String,
    logical_name: String,
    inputs: Properties,
    generated: Properties,
}

#[derive(Debug, Clone)]
enum Failure {
    Always(ProviderError),
    Times { remaining: u32, error: ProviderError },
}

/// In-memory [`CloudProvider`].
#[derive(Debug, Default)]
pub struct MemoryProvider {
    resources: Mutex<BTreeMap<String, MemoryResource>>,
    failures: Mutex<HashMap<String, Failure>>,
    /// Client token to the identifier it created.
    tokens: Mutex<HashMap<String, String>>,
    calls: Mutex<Vec<ProviderCall>>,
    counter: AtomicU64,
    delay: Option<Duration>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MemoryProvider {
    /// Creates an empty provider.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every call sleep for `delay` before completing.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Makes every operation on `logical_name` fail with `error`.
    pub fn fail_on(&self, logical_name: &str, error: ProviderError) {
        lock(&self.failures).insert(logical_name.to_string(), Failure::Always(error));
    }

    /// Makes the next `times` operations on `logical_name` fail with `error`.
    pub fn fail_times(&self, logical_name: &str, times: u32, error: ProviderError) {
        lock(&self.failures).insert(
            logical_name.to_string(),
            Failure::Times {
                remaining: times,
                error,
            },
        );
    }

    /// Removes any injected failure for `logical_name`.
    pub fn clear_failure(&self, logical_name: &str) {
        lock(&self.failures).remove(logical_name);
    }

    /// Returns every recorded call.
    #[must_use]
    pub fn calls(&self) -> Vec<ProviderCall> {
        lock(&self.calls).clone()
    }

    /// Returns the logical names of calls of one kind, in call order.
    #[must_use]
    pub fn calls_of(&self, operation: ProviderOperation) -> Vec<String> {
        lock(&self.calls)
            .iter()
            .filter(|c| c.operation == operation)
            .map(|c| c.logical_name.clone())
            .collect()
    }

    /// Number of live resources.
    #[must_use]
    pub fn resource_count(&self) -> usize {
        lock(&self.resources).len()
    }

    /// Returns the identifier of the live resource created for `logical_name`.
    #[must_use]
    pub fn physical_id_of(&self, logical_name: &str) -> Option<String> {
        lock(&self.resources)
            .iter()
            .find(|(_, r)| r.logical_name == logical_name)
            .map(|(id, _)| id.clone())
    }

    /// Returns the live inputs of a resource.
    #[must_use]
    pub fn live_inputs(&self, physical_id: &str) -> Option<Properties> {
        lock(&self.resources).get(physical_id).map(|r| r.inputs.clone())
    }

    /// Changes a live property behind the engine's back.
    pub fn set_live_property(&self, physical_id: &str, key: &str, value: Value) {
        if let Some(resource) = lock(&self.resources).get_mut(physical_id) {
            resource.inputs.insert(key.to_string(), value);
        }
    }

    /// Deletes a resource behind the engine's back.
    pub fn remove_out_of_band(&self, physical_id: &str) {
        lock(&self.resources).remove(physical_id);
    }

    fn record(&self, operation: ProviderOperation, resource_type: &str, logical_name: &str) {
        lock(&self.calls).push(ProviderCall {
            operation,
            resource_type: resource_type.to_string(),
            logical_name: logical_name.to_string(),
        });
    }

    fn injected_failure(&self, logical_name: &str) -> Option<ProviderError> {
        let mut failures = lock(&self.failures);
        let failure = failures.get_mut(logical_name)?;
        match failure {
            Failure::Always(error) => Some(error.clone()),
            Failure::Times { remaining, error } => {
                if *remaining == 0 {
                    return None;
                }
                *remaining -= 1;
                Some(error.clone())
            }
        }
    }

    async fn pause(&self) {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
    }

    fn logical_name_of(&self, physical_id: &str) -> Option<String> {
        lock(&self.resources)
            .get(physical_id)
            .map(|r| r.logical_name.clone())
    }

    fn next_id(&self, resource_type: &str) -> String {
        let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        let prefix = registry::lookup(resource_type).map_or("res", |s| s.id_prefix);
        format!("{prefix}-{n:017x}")
    }

    fn generate_attributes(resource_type: &str, physical_id: &str, n: u64) -> Properties {
        let mut generated = Properties::new();
        let Some(schema) = registry::lookup(resource_type) else {
            return generated;
        };

        for attribute in schema.read_only {
            let value = if attribute.ends_with("Id") || attribute.ends_with("Arn") {
                Value::String(physical_id.to_string())
            } else if attribute.contains("Dns") || attribute.contains("DNS") || attribute.contains("DomainName") {
                Value::String(format!("{physical_id}.cumulus.internal"))
            } else if attribute.ends_with("Ip") {
                Value::String(format!("10.0.{}.{}", (n / 250) % 250, n % 250 + 1))
            } else {
                Value::String(format!("{physical_id}:{attribute}"))
            };
            generated.insert((*attribute).to_string(), value);
        }
        generated
    }

    fn describe(physical_id: &str, resource: &MemoryResource) -> ProvisionedResource {
        let mut outputs = resource.inputs.clone();
        outputs.extend(resource.generated.clone());
        ProvisionedResource {
            physical_id: physical_id.to_string(),
            outputs,
        }
    }
}

#[async_trait]
impl CloudProvider for MemoryProvider {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn create(
        &self,
        resource_type: &str,
        logical_name: &str,
        client_token: &str,
        inputs: &Properties,
    ) -> ProviderResult<ProvisionedResource> {
        self.record(ProviderOperation::Create, resource_type, logical_name);
        self.pause().await;

        if let Some(error) = self.injected_failure(logical_name) {
            return Err(error);
        }

        if let Some(existing) = lock(&self.tokens).get(client_token)
            && let Some(resource) = lock(&self.resources).get(existing)
        {
            debug!("memory: client token {client_token} already created {existing}");
            return Ok(Self::describe(existing, resource));
        }

        let physical_id = self.next_id(resource_type);
        let n = self.counter.load(Ordering::SeqCst);
        let resource = MemoryResource {
            resource_type: resource_type.to_string(),
            logical_name: logical_name.to_string(),
            inputs: inputs.clone(),
            generated: Self::generate_attributes(resource_type, &physical_id, n),
        };
        let described = Self::describe(&physical_id, &resource);
        lock(&self.resources).insert(physical_id.clone(), resource);
        lock(&self.tokens).insert(client_token.to_string(), physical_id.clone());

        debug!("memory: created {logical_name} as {physical_id}");
        Ok(described)
    }

    async fn read(
        &self,
        resource_type: &str,
        physical_id: &str,
    ) -> ProviderResult<Option<ProvisionedResource>> {
        let logical_name = self.logical_name_of(physical_id).unwrap_or_default();
        self.record(ProviderOperation::Read, resource_type, &logical_name);
        self.pause().await;

        Ok(lock(&self.resources)
            .get(physical_id)
            .map(|r| Self::describe(physical_id, r)))
    }

    async fn update(
        &self,
        resource_type: &str,
        physical_id: &str,
        _old_inputs: &Properties,
        new_inputs: &Properties,
    ) -> ProviderResult<ProvisionedResource> {
        let logical_name = self.logical_name_of(physical_id).unwrap_or_default();
        self.record(ProviderOperation::Update, resource_type, &logical_name);
        self.pause().await;

        if let Some(error) = self.injected_failure(&logical_name) {
            return Err(error);
        }

        let mut resources = lock(&self.resources);
        let resource = resources
            .get_mut(physical_id)
            .ok_or_else(|| ProviderError::NotFound {
                resource_type: resource_type.to_string(),
                identifier: physical_id.to_string(),
            })?;
        resource.inputs.clone_from(new_inputs);
        Ok(Self::describe(physical_id, resource))
    }

    async fn delete(&self, resource_type: &str, physical_id: &str) -> ProviderResult<()> {
        let logical_name = self.logical_name_of(physical_id).unwrap_or_default();
        self.record(ProviderOperation::Delete, resource_type, &logical_name);
        self.pause().await;

        if let Some(error) = self.injected_failure(&logical_name) {
            return Err(error);
        }

        let removed = lock(&self.resources).remove(physical_id);
        match removed {
            Some(resource) if resource.resource_type == resource_type => {
                debug!("memory: deleted {logical_name} ({physical_id})");
                Ok(())
            }
            Some(resource) => {
                let found = resource.resource_type.clone();
                lock(&self.resources).insert(physical_id.to_string(), resource);
                Err(ProviderError::InvalidRequest {
                    message: format!("{physical_id} is a {found}, not a {resource_type}"),
                })
            }
            None => Err(ProviderError::NotFound {
                resource_type: resource_type.to_string(),
                identifier: physical_id.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn props(pairs: &[(&str, Value)]) -> Properties {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), v.clone()))
            .collect()
    }

    #[tokio::test]
    async fn test_create_synthesizes_attributes() {
        let provider = MemoryProvider::new();
        let created = provider
            .create(
                "AWS::EC2::Instance",
                "Web",
                "token-web",
                &props(&[("ImageId", json!("ami-1"))]),
            )
            .await
            .unwrap();

        assert!(created.physical_id.starts_with("i-"));
        assert_eq!(created.outputs["ImageId"], json!("ami-1"));
        assert_eq!(created.outputs["InstanceId"], json!(created.physical_id));
        assert!(created.outputs["PublicDnsName"]
            .as_str()
            .unwrap()
            .ends_with(".cumulus.internal"));
        assert_eq!(provider.physical_id_of("Web"), Some(created.physical_id));
    }

    #[tokio::test]
    async fn test_injected_transient_failure() {
        let provider = MemoryProvider::new();
        provider.fail_times("Vpc", 2, ProviderError::network("reset"));

        let inputs = Properties::new();
        assert!(provider.create("AWS::EC2::VPC", "Vpc", "t1", &inputs).await.is_err());
        assert!(provider.create("AWS::EC2::VPC", "Vpc", "t1", &inputs).await.is_err());
        assert!(provider.create("AWS::EC2::VPC", "Vpc", "t1", &inputs).await.is_ok());
        assert_eq!(provider.calls_of(ProviderOperation::Create).len(), 3);
    }

    #[tokio::test]
    async fn test_repeated_client_token_creates_once() {
        let provider = MemoryProvider::new();
        let inputs = props(&[("CidrBlock", json!("10.0.0.0/16"))]);

        let first = provider.create("AWS::EC2::VPC", "Vpc", "t1", &inputs).await.unwrap();
        let again = provider.create("AWS::EC2::VPC", "Vpc", "t1", &inputs).await.unwrap();
        assert_eq!(first.physical_id, again.physical_id);
        assert_eq!(provider.resource_count(), 1);

        let other = provider.create("AWS::EC2::VPC", "Vpc", "t2", &inputs).await.unwrap();
        assert_ne!(first.physical_id, other.physical_id);
        assert_eq!(provider.resource_count(), 2);
    }

    #[tokio::test]
    async fn test_update_read_delete() {
        let provider = MemoryProvider::new();
        let created = provider
            .create("AWS::EC2::VPC", "Vpc", "t1", &props(&[("EnableDnsSupport", json!(false))]))
            .await
            .unwrap();
        let id = created.physical_id;

        let updated = provider
            .update(
                "AWS::EC2::VPC",
                &id,
                &Properties::new(),
                &props(&[("EnableDnsSupport", json!(true))]),
            )
            .await
            .unwrap();
        assert_eq!(updated.outputs["EnableDnsSupport"], json!(true));

        assert!(provider.read("AWS::EC2::VPC", &id).await.unwrap().is_some());
        provider.delete("AWS::EC2::VPC", &id).await.unwrap();
        assert!(provider.read("AWS::EC2::VPC", &id).await.unwrap().is_none());

        let err = provider.delete("AWS::EC2::VPC", &id).await.unwrap_err();
        assert!(matches!(err, ProviderError::NotFound { .. }));
    }
}
