//! Cloud provider abstraction.
//!
//! The engine talks to the cloud only through [`CloudProvider`]. Two
//! implementations exist: [`CloudControlProvider`] drives AWS through the
//! Cloud Control API, and [`MemoryProvider`] simulates resources in memory.

mod cloudcontrol;
mod memory;

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::config::{ProviderConfig, ProviderKind};
use crate::error::ProviderResult;
use crate::resource::Properties;

pub use cloudcontrol::CloudControlProvider;
pub use memory::{MemoryProvider, ProviderCall, ProviderOperation};

/// A resource as reported by the provider.
#[derive(Debug, Clone, PartialEq)]
pub struct ProvisionedResource {
    /// Provider-assigned identifier.
    pub physical_id: String,
    /// Attributes reported by the provider.
    pub outputs: Properties,
}

/// Create, read, update and delete operations on cloud resources.
#[async_trait]
pub trait CloudProvider: Send + Sync {
    /// Provider name for logs and output.
    fn name(&self) -> &'static str;

    /// Creates a resource from fully resolved inputs.
    ///
    /// Calls sharing a `client_token` create at most one resource: a repeat
    /// after an accepted submission returns that resource instead of a new
    /// one.
    async fn create(
        &self,
        resource_type: &str,
        logical_name: &str,
        client_token: &str,
        inputs: &Properties,
    ) -> ProviderResult<ProvisionedResource>;

    /// Reads a resource, returning `None` if it no longer exists.
    async fn read(
        &self,
        resource_type: &str,
        physical_id: &str,
    ) -> ProviderResult<Option<ProvisionedResource>>;

    /// Updates a resource in place.
    async fn update(
        &self,
        resource_type: &str,
        physical_id: &str,
        old_inputs: &Properties,
        new_inputs: &Properties,
    ) -> ProviderResult<ProvisionedResource>;

    /// Deletes a resource.
    async fn delete(&self, resource_type: &str, physical_id: &str) -> ProviderResult<()>;
}

/// Generates a client token for one planned create.
#[must_use]
pub fn new_client_token() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Builds the provider selected in the configuration.
pub async fn from_config(config: &ProviderConfig) -> Arc<dyn CloudProvider> {
    match config.kind {
        ProviderKind::Aws => Arc::new(CloudControlProvider::new(config).await),
        ProviderKind::Memory => Arc::new(MemoryProvider::new()),
    }
}

fn escape_pointer(key: &str) -> String {
    key.replace('~', "~0").replace('/', "~1")
}

/// Builds an RFC 6902 patch turning `old` into `new` at the top level.
#[must_use]
pub fn json_patch(old: &Properties, new: &Properties) -> Value {
    let mut ops = Vec::new();

    for key in old.keys().filter(|k| !new.contains_key(*k)) {
        ops.push(serde_json::json!({
            "op": "remove",
            "path": format!("/{}", escape_pointer(key)),
        }));
    }

    for (key, value) in new {
        if old.get(key) != Some(value) {
            ops.push(serde_json::json!({
                "op": "add",
                "path": format!("/{}", escape_pointer(key)),
                "value": value,
            }));
        }
    }

    Value::Array(ops)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_json_patch() {
        let mut old = Properties::new();
        old.insert(String::from("Keep"), json!(1));
        old.insert(String::from("Change"), json!("a"));
        old.insert(String::from("Drop"), json!(true));

        let mut new = Properties::new();
        new.insert(String::from("Keep"), json!(1));
        new.insert(String::from("Change"), json!("b"));
        new.insert(String::from("a/b"), json!([1]));

        let patch = json_patch(&old, &new);
        assert_eq!(
            patch,
            json!([
                {"op": "remove", "path": "/Drop"},
                {"op": "add", "path": "/Change", "value": "b"},
                {"op": "add", "path": "/a~1b", "value": [1]},
            ])
        );
    }

    #[test]
    fn test_json_patch_no_changes() {
        let mut props = Properties::new();
        props.insert(String::from("Port"), json!(80));
        assert_eq!(json_patch(&props, &props), json!([]));
    }
}
