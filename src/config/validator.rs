//! Configuration validation for deployment files.
//!
//! This module validates a parsed configuration before anything touches the
//! state or the provider: names, resource types, backend settings, execution
//! tuning, and finally the resource graph itself.

use crate::error::{ConfigError, CumulusError, Result};
use crate::graph::ResourceGraph;
use crate::resource::reference::references_in;
use crate::resource::{ResourceDeclaration, registry};
use serde_json::Value;
use std::collections::HashSet;
use tracing::debug;

use super::spec::{DeployConfig, ExecutionConfig, HealthCheckConfig, ProjectConfig, StateBackend, StateConfig};

/// Validator for deployment configurations.
#[derive(Debug, Default)]
pub struct ConfigValidator;

/// Validation result containing all errors found.
#[derive(Debug, Default)]
pub struct ValidationResult {
    /// List of validation errors.
    pub errors: Vec<ValidationError>,
    /// List of warnings (non-fatal issues).
    pub warnings: Vec<String>,
}

/// A single validation error.
#[derive(Debug)]
pub struct ValidationError {
    /// The field path that failed validation.
    pub field: String,
    /// The error message.
    pub message: String,
}

impl ConfigValidator {
    /// Creates a new validator.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Validates a deployment configuration.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for the first invalid field, or the
    /// graph error if the resources do not form a valid graph.
    pub fn validate(&self, config: &DeployConfig) -> Result<ValidationResult> {
        let result = self.check(config);

        if let Some(first_error) = result.errors.first() {
            return Err(CumulusError::Config(ConfigError::ValidationError {
                message: first_error.message.clone(),
                field: Some(first_error.field.clone()),
            }));
        }

        ResourceGraph::build(&config.resources)?;
        debug!("Configuration validation passed");
        Ok(result)
    }

    /// Collects every field error and warning without failing.
    #[must_use]
    pub fn check(&self, config: &DeployConfig) -> ValidationResult {
        let mut result = ValidationResult::default();

        Self::validate_project(&config.project, &mut result);
        Self::validate_state(&config.state, &mut result);
        Self::validate_execution(&config.execution, &mut result);
        Self::validate_resources(&config.resources, &mut result);
        Self::validate_outputs(config, &mut result);
        Self::validate_checks(&config.checks, config, &mut result);

        result
    }

    /// Validates project configuration.
    fn validate_project(project: &ProjectConfig, result: &mut ValidationResult) {
        if project.name.is_empty() {
            result.error("project.name", "Project name cannot be empty");
        } else if !is_valid_name(&project.name) {
            result.error(
                "project.name",
                format!(
                    "Project name '{}' is invalid. Must be lowercase alphanumeric with hyphens.",
                    project.name
                ),
            );
        }

        if !is_valid_name(&project.stack) {
            result.error(
                "project.stack",
                format!(
                    "Stack name '{}' is invalid. Must be lowercase alphanumeric with hyphens.",
                    project.stack
                ),
            );
        }
    }

    /// Validates state configuration.
    fn validate_state(state: &StateConfig, result: &mut ValidationResult) {
        match state.backend {
            StateBackend::S3 => {
                if state.bucket.as_ref().is_none_or(String::is_empty) {
                    result.error("state.bucket", "S3 bucket name is required when using S3 backend");
                }
            }
            StateBackend::Local => {
                if state.bucket.is_some() {
                    result
                        .warnings
                        .push(String::from("state.bucket: ignored by the local backend"));
                }
            }
        }
    }

    /// Validates execution tuning.
    fn validate_execution(execution: &ExecutionConfig, result: &mut ValidationResult) {
        if execution.parallelism == 0 {
            result.error("execution.parallelism", "Parallelism must be at least 1");
        }
        if execution.retry.max_attempts == 0 {
            result.error("execution.retry.max_attempts", "At least one attempt is required");
        }
        if execution.retry.base_delay_ms > execution.retry.max_delay_ms {
            result.error(
                "execution.retry.base_delay_ms",
                "Base delay cannot exceed the maximum delay",
            );
        }
    }

    /// Validates all resource declarations.
    fn validate_resources(resources: &[ResourceDeclaration], result: &mut ValidationResult) {
        if resources.is_empty() {
            result.warnings.push(String::from("No resources defined in configuration"));
            return;
        }

        for (i, resource) in resources.iter().enumerate() {
            let prefix = format!("resources[{i}]");

            if !is_valid_logical_name(&resource.name) {
                result.error(
                    format!("{prefix}.name"),
                    format!(
                        "Resource name '{}' is invalid. Must start with a letter and contain only letters, digits, '-' or '_'.",
                        resource.name
                    ),
                );
            }

            if !registry::is_valid_type_name(&resource.resource_type) {
                result.error(
                    format!("{prefix}.type"),
                    format!(
                        "Resource type '{}' is invalid. Expected the form Provider::Service::Type.",
                        resource.resource_type
                    ),
                );
            } else if registry::lookup(&resource.resource_type).is_none() {
                result.warnings.push(format!(
                    "{prefix}.type: Unknown resource type '{}'. Every change will be applied in place.",
                    resource.resource_type
                ));
            }

            for ignored in &resource.options.ignore_changes {
                if !resource.properties.contains_key(ignored) {
                    result.warnings.push(format!(
                        "{prefix}.options.ignore_changes: '{ignored}' is not a declared property"
                    ));
                }
            }

            if let Err(e) = resource.references() {
                result.error(format!("{prefix}.properties"), e.to_string());
            }
        }
    }

    /// Validates that outputs only reference declared resources.
    fn validate_outputs(config: &DeployConfig, result: &mut ValidationResult) {
        for (name, value) in &config.outputs {
            Self::validate_references(&format!("outputs.{name}"), value, config, result);
        }
    }

    /// Validates health checks.
    fn validate_checks(checks: &[HealthCheckConfig], config: &DeployConfig, result: &mut ValidationResult) {
        let mut seen_names = HashSet::new();
        for (i, check) in checks.iter().enumerate() {
            let prefix = format!("checks[{i}]");
            if !seen_names.insert(&check.name) {
                result.error(format!("{prefix}.name"), format!("Duplicate check name: {}", check.name));
            }
            if check.url.is_empty() {
                result.error(format!("{prefix}.url"), "Check URL cannot be empty");
            }
            if check.attempts == 0 {
                result.error(format!("{prefix}.attempts"), "At least one attempt is required");
            }
            Self::validate_references(
                &format!("{prefix}.url"),
                &Value::String(check.url.clone()),
                config,
                result,
            );
        }
    }

    fn validate_references(field: &str, value: &Value, config: &DeployConfig, result: &mut ValidationResult) {
        match references_in(value) {
            Ok(references) => {
                for reference in references {
                    if config.resource(&reference.resource).is_none() {
                        result.error(
                            field,
                            format!("'{reference}' references undeclared resource '{}'", reference.resource),
                        );
                    }
                }
            }
            Err(e) => result.error(field, e.to_string()),
        }
    }
}

/// Validates that a name follows the naming convention.
/// Names must be lowercase alphanumeric with hyphens, starting with a letter.
fn is_valid_name(name: &str) -> bool {
    let mut chars = name.chars();

    // First character must be a letter
    match chars.next() {
        Some(first) if first.is_ascii_lowercase() => {}
        _ => return false,
    }

    // Rest must be lowercase alphanumeric or hyphen
    if !chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-') {
        return false;
    }

    !name.ends_with('-') && !name.contains("--")
}

/// Logical names appear inside `${Name.attr}`, so dots and spaces are out.
fn is_valid_logical_name(name: &str) -> bool {
    let mut chars = name.chars();
    chars.next().is_some_and(|c| c.is_ascii_alphabetic())
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

impl ValidationResult {
    fn error(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.errors.push(ValidationError {
            field: field.into(),
            message: message.into(),
        });
    }

    /// Returns true if validation passed (no errors).
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Returns the number of errors.
    #[must_use]
    pub const fn error_count(&self) -> usize {
        self.errors.len()
    }

    /// Returns the number of warnings.
    #[must_use]
    pub const fn warning_count(&self) -> usize {
        self.warnings.len()
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigParser;
    use crate::error::GraphError;

    fn parse(yaml: &str) -> DeployConfig {
        ConfigParser::new().parse_yaml(yaml, None).unwrap()
    }

    #[test]
    fn test_valid_name() {
        assert!(is_valid_name("web-stack"));
        assert!(is_valid_name("prod-2"));
        assert!(is_valid_name("a"));
    }

    #[test]
    fn test_invalid_name() {
        assert!(!is_valid_name(""));
        assert!(!is_valid_name("Web")); // uppercase
        assert!(!is_valid_name("1-web")); // starts with number
        assert!(!is_valid_name("web_stack")); // underscore
        assert!(!is_valid_name("web-")); // ends with hyphen
        assert!(!is_valid_name("web--stack")); // consecutive hyphens
    }

    #[test]
    fn test_logical_names() {
        assert!(is_valid_logical_name("WebServer"));
        assert!(is_valid_logical_name("my-vpc_1"));
        assert!(!is_valid_logical_name("web.server"));
        assert!(!is_valid_logical_name("_web"));
        assert!(!is_valid_logical_name(""));
    }

    #[test]
    fn test_valid_configuration() {
        let config = parse(
            r"
project:
  name: web
resources:
  - name: Vpc
    type: AWS::EC2::VPC
    properties:
      CidrBlock: 10.0.0.0/16
  - name: Custom
    type: AWS::Logs::LogGroup
outputs:
  vpcId: ${Vpc.id}
",
        );
        let result = ConfigValidator::new().validate(&config).unwrap();
        assert!(result.is_valid());
        assert_eq!(result.warning_count(), 1);
    }

    #[test]
    fn test_s3_backend_requires_bucket() {
        let config = parse(
            r"
project:
  name: web
state:
  backend: s3
resources: []
",
        );
        let result = ConfigValidator::new().check(&config);
        assert_eq!(result.errors[0].field, "state.bucket");
        assert!(ConfigValidator::new().validate(&config).is_err());
    }

    #[test]
    fn test_bad_type_and_dangling_output() {
        let config = parse(
            r"
project:
  name: web
resources:
  - name: Vpc
    type: vpc
outputs:
  ip: ${Web.PublicIp}
",
        );
        let result = ConfigValidator::new().check(&config);
        let fields: Vec<&str> = result.errors.iter().map(|e| e.field.as_str()).collect();
        assert_eq!(fields, vec!["resources[0].type", "outputs.ip"]);
    }

    #[test]
    fn test_graph_errors_surface() {
        let config = parse(
            r"
project:
  name: web
resources:
  - name: A
    type: AWS::EC2::VPC
    properties:
      Peer: ${B.id}
  - name: B
    type: AWS::EC2::VPC
    properties:
      Peer: ${A.id}
",
        );
        let err = ConfigValidator::new().validate(&config).unwrap_err();
        assert!(matches!(
            err,
            CumulusError::Graph(GraphError::CyclicDependency { .. })
        ));
    }
}
