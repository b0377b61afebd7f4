//! State types for tracking deployed resources.
//!
//! The state is a versioned snapshot: every successful save bumps `serial`,
//! and a save is refused when the stored serial moved since the snapshot was
//! loaded.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::resource::reference::{lookup_path, resolve};
use crate::resource::{Properties, Reference, TemplateError};

/// Current version of the state format.
pub const STATE_VERSION: &str = "1";

/// Maximum number of history entries kept.
const MAX_HISTORY: usize = 100;

/// The complete deployment state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentState {
    /// State format version.
    pub version: String,
    /// Serial of this snapshot. Bumped on every save.
    #[serde(default)]
    pub serial: u64,
    /// Identifier shared by every snapshot of this deployment.
    pub lineage: String,
    /// Project name.
    pub project: String,
    /// Stack name.
    pub stack: String,
    /// Hash of the last applied configuration.
    #[serde(default)]
    pub config_hash: String,
    /// Tracked resources by logical name.
    #[serde(default)]
    pub resources: BTreeMap<String, ResourceState>,
    /// Replaced resources whose old copy still has to be deleted.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pending_deletes: Vec<PendingDelete>,
    /// Resolved stack outputs.
    #[serde(default)]
    pub outputs: BTreeMap<String, Value>,
    /// When the state was last updated.
    pub last_updated: DateTime<Utc>,
    /// Operation history (recent entries).
    #[serde(default)]
    pub history: Vec<DeploymentHistoryEntry>,
}

/// State of a single resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceState {
    /// Logical name.
    pub name: String,
    /// Resource type.
    pub resource_type: String,
    /// Provider-assigned identifier, absent if creation never succeeded.
    #[serde(default)]
    pub physical_id: Option<String>,
    /// Declared properties, with reference expressions unresolved.
    #[serde(default)]
    pub properties: Properties,
    /// Resolved inputs last sent to the provider.
    #[serde(default)]
    pub inputs: Properties,
    /// Attributes reported by the provider.
    #[serde(default)]
    pub outputs: Properties,
    /// Logical names this resource depends on.
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Hash of the declared properties when last applied.
    #[serde(default)]
    pub input_hash: String,
    /// Outcome of the last operation on this resource.
    pub status: ResourceStatus,
    /// Error of the last failed operation.
    #[serde(default)]
    pub last_error: Option<String>,
    /// Whether deletion and replacement are refused.
    #[serde(default)]
    pub protect: bool,
    /// Order in which the resource was first recorded.
    #[serde(default)]
    pub sequence: u64,
    /// When the resource was first recorded.
    pub created_at: DateTime<Utc>,
    /// When the resource was last updated.
    pub updated_at: DateTime<Utc>,
}

/// Outcome of the last operation on a resource.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ResourceStatus {
    /// The provider reflects the recorded inputs.
    Applied,
    /// The last operation failed.
    Failed,
    /// The last run skipped this resource because a dependency failed.
    Blocked,
}

/// The old copy of a replaced resource that still has to be deleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingDelete {
    /// Logical name of the resource that was replaced.
    pub name: String,
    /// Resource type.
    pub resource_type: String,
    /// Identifier of the old copy.
    pub physical_id: String,
    /// Why the delete has not happened.
    #[serde(default)]
    pub last_error: Option<String>,
    /// When the replacement happened.
    pub since: DateTime<Utc>,
}

/// A single entry in the operation history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentHistoryEntry {
    /// When the operation finished.
    pub timestamp: DateTime<Utc>,
    /// Type of operation.
    pub operation: DeploymentOperation,
    /// Configuration hash at time of the operation.
    pub config_hash: String,
    /// Resources the operation changed.
    pub resources: Vec<String>,
    /// Whether every change succeeded.
    pub success: bool,
    /// Optional error summary.
    #[serde(default)]
    pub error: Option<String>,
}

/// Types of recorded operations.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentOperation {
    /// Apply of the declared configuration.
    Apply,
    /// Destruction of every tracked resource.
    Destroy,
}

impl DeploymentState {
    /// Creates a new empty deployment state.
    #[must_use]
    pub fn new(project: &str, stack: &str) -> Self {
        Self {
            version: STATE_VERSION.to_string(),
            serial: 0,
            lineage: Uuid::new_v4().to_string(),
            project: project.to_string(),
            stack: stack.to_string(),
            config_hash: String::new(),
            resources: BTreeMap::new(),
            pending_deletes: Vec::new(),
            outputs: BTreeMap::new(),
            last_updated: Utc::now(),
            history: Vec::new(),
        }
    }

    /// Gets a resource by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&ResourceState> {
        self.resources.get(name)
    }

    /// Adds or replaces a resource, keeping its original sequence and
    /// creation time when already tracked.
    pub fn set_resource(&mut self, mut resource: ResourceState) {
        if let Some(existing) = self.resources.get(&resource.name) {
            resource.sequence = existing.sequence;
            resource.created_at = existing.created_at;
        } else {
            resource.sequence = self
                .resources
                .values()
                .map(|r| r.sequence + 1)
                .max()
                .unwrap_or(0);
        }
        self.resources.insert(resource.name.clone(), resource);
        self.last_updated = Utc::now();
    }

    /// Removes a resource by name.
    pub fn remove_resource(&mut self, name: &str) -> Option<ResourceState> {
        let result = self.resources.remove(name);
        if result.is_some() {
            self.last_updated = Utc::now();
        }
        result
    }

    /// Records the old copy of a replaced resource for later deletion.
    pub fn add_pending_delete(&mut self, pending: PendingDelete) {
        self.pending_deletes
            .retain(|p| p.physical_id != pending.physical_id);
        self.pending_deletes.push(pending);
        self.last_updated = Utc::now();
    }

    /// Forgets a pending delete once the old copy is gone.
    pub fn remove_pending_delete(&mut self, physical_id: &str) {
        self.pending_deletes.retain(|p| p.physical_id != physical_id);
        self.last_updated = Utc::now();
    }

    /// Adds a history entry.
    pub fn add_history(&mut self, entry: DeploymentHistoryEntry) {
        if self.history.len() >= MAX_HISTORY {
            self.history.remove(0);
        }
        self.history.push(entry);
    }

    /// Returns all resource names.
    #[must_use]
    pub fn resource_names(&self) -> Vec<&str> {
        self.resources.keys().map(String::as_str).collect()
    }

    /// Returns true if nothing is tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.resources.is_empty() && self.pending_deletes.is_empty()
    }

    /// Resolves a reference against recorded identifiers and outputs.
    #[must_use]
    pub fn resolve_reference(&self, reference: &Reference) -> Option<Value> {
        self.resources.get(&reference.resource)?.attribute(reference)
    }

    /// Resolves every reference expression in a value against this state.
    ///
    /// # Errors
    ///
    /// Returns [`TemplateError::Unresolved`] for the first reference with no
    /// recorded value.
    pub fn resolve_value(&self, value: &Value) -> Result<Value, TemplateError> {
        resolve(value, |r| self.resolve_reference(r))
    }

    /// Resolves a property map against this state.
    ///
    /// # Errors
    ///
    /// Returns [`TemplateError::Unresolved`] for the first reference with no
    /// recorded value.
    pub fn resolve_properties(&self, properties: &Properties) -> Result<Properties, TemplateError> {
        properties
            .iter()
            .map(|(key, value)| Ok((key.clone(), self.resolve_value(value)?)))
            .collect()
    }
}

impl ResourceState {
    /// Creates a resource state for a freshly applied resource.
    #[must_use]
    pub fn new(name: &str, resource_type: &str, status: ResourceStatus) -> Self {
        let now = Utc::now();
        Self {
            name: name.to_string(),
            resource_type: resource_type.to_string(),
            physical_id: None,
            properties: Properties::new(),
            inputs: Properties::new(),
            outputs: Properties::new(),
            dependencies: Vec::new(),
            input_hash: String::new(),
            status,
            last_error: None,
            protect: false,
            sequence: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Reads an attribute for a reference.
    ///
    /// `id` maps to the physical identifier. Other attributes are looked up
    /// in the provider outputs first, then in the resolved inputs.
    #[must_use]
    pub fn attribute(&self, reference: &Reference) -> Option<Value> {
        let root = if reference.attribute == crate::resource::reference::ID_ATTRIBUTE {
            Value::String(self.physical_id.clone()?)
        } else {
            self.outputs
                .get(&reference.attribute)
                .or_else(|| self.inputs.get(&reference.attribute))?
                .clone()
        };
        lookup_path(&root, &reference.path).cloned()
    }

    /// Returns true if the last operation succeeded.
    #[must_use]
    pub fn is_applied(&self) -> bool {
        self.status == ResourceStatus::Applied
    }
}

impl DeploymentHistoryEntry {
    /// Creates a new history entry.
    #[must_use]
    pub fn new(
        operation: DeploymentOperation,
        config_hash: &str,
        resources: Vec<String>,
        error: Option<String>,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            operation,
            config_hash: config_hash.to_string(),
            resources,
            success: error.is_none(),
            error,
        }
    }
}

impl std::fmt::Display for ResourceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let status = match self {
            Self::Applied => "applied",
            Self::Failed => "failed",
            Self::Blocked => "blocked",
        };
        write!(f, "{status}")
    }
}

impl std::fmt::Display for DeploymentOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let op = match self {
            Self::Apply => "apply",
            Self::Destroy => "destroy",
        };
        write!(f, "{op}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn applied(name: &str) -> ResourceState {
        let mut r = ResourceState::new(name, "AWS::EC2::Instance", ResourceStatus::Applied);
        r.physical_id = Some(format!("i-{name}"));
        r
    }

    #[test]
    fn test_sequence_is_stable() {
        let mut state = DeploymentState::new("web", "dev");
        state.set_resource(applied("a"));
        state.set_resource(applied("b"));
        state.set_resource(applied("a"));

        assert_eq!(state.get("a").map(|r| r.sequence), Some(0));
        assert_eq!(state.get("b").map(|r| r.sequence), Some(1));
    }

    #[test]
    fn test_resolve_reference() {
        let mut state = DeploymentState::new("web", "dev");
        let mut web = applied("Web");
        web.outputs.insert(String::from("PublicIp"), json!("3.3.3.3"));
        web.inputs
            .insert(String::from("SecurityGroupIds"), json!(["sg-1", "sg-2"]));
        state.set_resource(web);

        let id = Reference::parse("Web").unwrap();
        assert_eq!(state.resolve_reference(&id), Some(json!("i-Web")));

        let ip = Reference::parse("Web.PublicIp").unwrap();
        assert_eq!(state.resolve_reference(&ip), Some(json!("3.3.3.3")));

        let sg = Reference::parse("Web.SecurityGroupIds.1").unwrap();
        assert_eq!(state.resolve_reference(&sg), Some(json!("sg-2")));

        let missing = Reference::parse("Web.Nope").unwrap();
        assert_eq!(state.resolve_reference(&missing), None);
    }

    #[test]
    fn test_resolve_properties() {
        let mut state = DeploymentState::new("web", "dev");
        state.set_resource(applied("Vpc"));

        let mut props = Properties::new();
        props.insert(String::from("VpcId"), json!("${Vpc.id}"));
        props.insert(String::from("Literal"), json!("$${kept}"));
        let resolved = state.resolve_properties(&props).unwrap();
        assert_eq!(resolved["VpcId"], json!("i-Vpc"));
        assert_eq!(resolved["Literal"], json!("${kept}"));

        props.insert(String::from("Subnet"), json!("${Subnet.id}"));
        assert!(matches!(
            state.resolve_properties(&props),
            Err(TemplateError::Unresolved { .. })
        ));
    }

    #[test]
    fn test_history_is_bounded() {
        let mut state = DeploymentState::new("web", "dev");
        for _ in 0..(MAX_HISTORY + 5) {
            state.add_history(DeploymentHistoryEntry::new(
                DeploymentOperation::Apply,
                "abc",
                vec![],
                None,
            ));
        }
        assert_eq!(state.history.len(), MAX_HISTORY);
    }
}
