//! Configuration specification types for the provisioning engine.
//!
//! This module defines all the structs that map to the `cumulus.deploy.yaml` file.
//! These types are declarative and fully describe the desired state.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::resource::ResourceDeclaration;

/// The root configuration structure for a deployment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeployConfig {
    /// Project-level configuration.
    pub project: ProjectConfig,
    /// State backend configuration.
    #[serde(default)]
    pub state: StateConfig,
    /// Cloud provider configuration.
    #[serde(default)]
    pub provider: ProviderConfig,
    /// Execution tuning.
    #[serde(default)]
    pub execution: ExecutionConfig,
    /// Variables available as `${var.NAME}`.
    #[serde(default)]
    pub variables: BTreeMap<String, Value>,
    /// Declared resources, in declaration order.
    pub resources: Vec<ResourceDeclaration>,
    /// Stack outputs, values may reference resource attributes.
    #[serde(default)]
    pub outputs: BTreeMap<String, Value>,
    /// Endpoint health checks run after an apply.
    #[serde(default)]
    pub checks: Vec<HealthCheckConfig>,
}

/// Project-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProjectConfig {
    /// Unique name for the project.
    pub name: String,
    /// Stack name (e.g. "dev", "prod"); each stack has its own state.
    #[serde(default = "default_stack")]
    pub stack: String,
}

/// State backend configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StateConfig {
    /// Backend type (local or s3).
    #[serde(default)]
    pub backend: StateBackend,
    /// S3 bucket name (required for s3 backend).
    #[serde(default)]
    pub bucket: Option<String>,
    /// S3 key prefix (optional).
    #[serde(default)]
    pub prefix: Option<String>,
    /// S3 region (optional, uses AWS default if not specified).
    #[serde(default)]
    pub region: Option<String>,
    /// Local state file path (for local backend).
    #[serde(default)]
    pub path: Option<String>,
}

/// State backend types.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StateBackend {
    /// Local file-based state storage.
    #[default]
    Local,
    /// AWS S3-based state storage.
    S3,
}

/// Cloud provider configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ProviderConfig {
    /// Which provider implementation to use.
    pub kind: ProviderKind,
    /// AWS region (uses the AWS default chain if not specified).
    pub region: Option<String>,
    /// Seconds between status polls of an asynchronous request.
    pub poll_interval_secs: u64,
    /// Seconds before an operation on one resource is abandoned.
    pub operation_timeout_secs: u64,
    /// Base64-encode plain-text `UserData` of EC2 instances.
    pub encode_user_data: bool,
}

/// Provider implementations.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// AWS through the Cloud Control API.
    #[default]
    Aws,
    /// In-memory simulator, useful for rehearsals.
    Memory,
}

/// Execution tuning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Maximum number of concurrent provider operations.
    pub parallelism: usize,
    /// Default strategy for replacements.
    pub replace_strategy: ReplaceStrategy,
    /// Retry policy for transient provider failures.
    pub retry: RetryConfig,
}

/// Order of operations when a resource is replaced.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ReplaceStrategy {
    /// Create the new copy, then delete the old one.
    #[default]
    CreateBeforeDelete,
    /// Delete the old copy, then create the new one.
    DeleteBeforeCreate,
}

/// Retry policy for transient provider failures.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    /// Delay before the first retry, in milliseconds.
    pub base_delay_ms: u64,
    /// Upper bound of any single delay, in milliseconds.
    pub max_delay_ms: u64,
}

/// Endpoint health check.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HealthCheckConfig {
    /// Name of the check.
    pub name: String,
    /// URL to check; may reference resource attributes.
    pub url: String,
    /// Expected HTTP status; any 2xx when unset.
    #[serde(default)]
    pub expected_status: Option<u16>,
    /// Timeout of one attempt in seconds.
    #[serde(default = "default_check_timeout")]
    pub timeout_secs: u64,
    /// Attempts before the check is reported unhealthy.
    #[serde(default = "default_check_attempts")]
    pub attempts: u32,
    /// Seconds between attempts.
    #[serde(default = "default_check_interval")]
    pub interval_secs: u64,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            kind: ProviderKind::Aws,
            region: None,
            poll_interval_secs: 5,
            operation_timeout_secs: 1800,
            encode_user_data: true,
        }
    }
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            parallelism: 10,
            replace_strategy: ReplaceStrategy::CreateBeforeDelete,
            retry: RetryConfig::default(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 1000,
            max_delay_ms: 30_000,
        }
    }
}

const fn default_check_timeout() -> u64 {
    10
}

const fn default_check_attempts() -> u32 {
    3
}

const fn default_check_interval() -> u64 {
    5
}

fn default_stack() -> String {
    String::from("dev")
}

impl DeployConfig {
    /// Returns all resource names in declaration order.
    #[must_use]
    pub fn resource_names(&self) -> Vec<&str> {
        self.resources.iter().map(|r| r.name.as_str()).collect()
    }

    /// Gets a declaration by name.
    #[must_use]
    pub fn resource(&self, name: &str) -> Option<&ResourceDeclaration> {
        self.resources.iter().find(|r| r.name == name)
    }
}

impl ProjectConfig {
    /// Returns the `project/stack` identifier.
    #[must_use]
    pub fn qualified_name(&self) -> String {
        format!("{}/{}", self.name, self.stack)
    }
}

impl std::fmt::Display for ReplaceStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::CreateBeforeDelete => "create_before_delete",
            Self::DeleteBeforeCreate => "delete_before_create",
        };
        write!(f, "{s}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let yaml = r"
project:
  name: web
resources:
  - name: Vpc
    type: AWS::EC2::VPC
    properties:
      CidrBlock: 10.0.0.0/16
";
        let config: DeployConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.project.stack, "dev");
        assert_eq!(config.state.backend, StateBackend::Local);
        assert_eq!(config.provider.kind, ProviderKind::Aws);
        assert_eq!(config.execution.parallelism, 10);
        assert_eq!(config.execution.retry.max_attempts, 5);
        assert_eq!(config.resource_names(), vec!["Vpc"]);
    }

    #[test]
    fn test_execution_overrides() {
        let yaml = r"
project: {name: web, stack: prod}
execution:
  parallelism: 2
  replace_strategy: delete_before_create
  retry: {max_attempts: 2}
resources: []
";
        let config: DeployConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.execution.parallelism, 2);
        assert_eq!(config.execution.replace_strategy, ReplaceStrategy::DeleteBeforeCreate);
        assert_eq!(config.execution.retry.max_attempts, 2);
        assert_eq!(config.execution.retry.base_delay_ms, 1000);
        assert_eq!(config.project.qualified_name(), "web/prod");
    }
}
