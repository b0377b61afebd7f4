//! Configuration module for Cumulus deployments.
//!
//! This module handles all configuration-related functionality:
//! - Parsing and deserializing `cumulus.deploy.yaml`
//! - Validation of configuration values
//! - Computing configuration hashes for change detection

mod spec;
mod parser;
mod validator;
mod hash;

pub use spec::{
    DeployConfig, ExecutionConfig, HealthCheckConfig, ProjectConfig, ProviderConfig, ProviderKind,
    ReplaceStrategy, RetryConfig, StateBackend, StateConfig,
};
pub use parser::{ConfigParser, DEFAULT_CONFIG_FILES, find_config_file};
pub use validator::{ConfigValidator, ValidationError, ValidationResult};
pub use hash::ConfigHasher;
