//! Configuration parser for loading and merging configuration files.
//!
//! This module handles loading configuration from YAML files and environment
//! variables, with proper precedence and error handling. Variables
//! (`${var.NAME}`, `${project}`, `${stack}`) are substituted before the
//! document is deserialized; resource references are left for apply time.

use crate::error::{ConfigError, CumulusError, Result};
use crate::resource::TemplateError;
use crate::resource::reference::substitute_variables;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::spec::DeployConfig;

/// Environment variables that override configuration values, with the
/// section and key they replace.
const ENV_OVERRIDES: &[(&str, &str, &str)] = &[
    ("CUMULUS_PROJECT_NAME", "project", "name"),
    ("CUMULUS_STACK", "project", "stack"),
    ("CUMULUS_REGION", "provider", "region"),
    ("CUMULUS_STATE_BUCKET", "state", "bucket"),
    ("CUMULUS_STATE_PREFIX", "state", "prefix"),
];

/// Sections in which variables are substituted.
const TEMPLATED_SECTIONS: &[&str] = &["resources", "outputs", "checks"];

/// Configuration parser for loading deployment configuration.
#[derive(Debug, Default)]
pub struct ConfigParser {
    /// Base path for resolving relative paths.
    base_path: Option<PathBuf>,
    /// Whether `CUMULUS_*` environment variables override the file.
    env_overrides: bool,
}

impl ConfigParser {
    /// Creates a new configuration parser.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            base_path: None,
            env_overrides: false,
        }
    }

    /// Sets the base path for resolving relative paths.
    #[must_use]
    pub fn with_base_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.base_path = Some(path.into());
        self
    }

    /// Enables `CUMULUS_*` environment overrides.
    #[must_use]
    pub const fn with_env_overrides(mut self, enabled: bool) -> Self {
        self.env_overrides = enabled;
        self
    }

    /// Loads configuration from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_file(&self, path: impl AsRef<Path>) -> Result<DeployConfig> {
        let path = path.as_ref();
        info!("Loading configuration from: {}", path.display());

        if !path.exists() {
            return Err(CumulusError::Config(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            }));
        }

        let content = std::fs::read_to_string(path).map_err(|e| {
            CumulusError::Config(ConfigError::ParseError {
                message: format!("Failed to read file: {e}"),
                location: Some(path.display().to_string()),
            })
        })?;

        self.parse_yaml(&content, Some(path))
    }

    /// Loads configuration with environment variable overrides.
    ///
    /// Environment variables are checked in the format
    /// `CUMULUS_<KEY>` (e.g., `CUMULUS_STACK`).
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_with_env(&self, path: impl AsRef<Path>) -> Result<DeployConfig> {
        Self {
            base_path: self.base_path.clone(),
            env_overrides: true,
        }
        .load_file(path)
    }

    /// Parses configuration from a YAML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the YAML is invalid or names an unknown variable.
    pub fn parse_yaml(&self, content: &str, source: Option<&Path>) -> Result<DeployConfig> {
        if self.env_overrides {
            self.parse_yaml_with(content, source, |name| std::env::var(name).ok())
        } else {
            self.parse_yaml_with(content, source, |_| None)
        }
    }

    /// Parses configuration, taking overrides from `env`.
    ///
    /// # Errors
    ///
    /// Returns an error if the YAML is invalid or names an unknown variable.
    pub fn parse_yaml_with<F>(&self, content: &str, source: Option<&Path>, env: F) -> Result<DeployConfig>
    where
        F: Fn(&str) -> Option<String>,
    {
        debug!("Parsing YAML configuration");
        let location = source.map(|p| p.display().to_string());

        let mut document: Value = serde_yaml::from_str(content).map_err(|e| {
            CumulusError::Config(ConfigError::ParseError {
                message: format!("YAML parse error: {e}"),
                location: location.clone(),
            })
        })?;

        Self::apply_env_overrides(&mut document, env);
        Self::substitute(&mut document)?;

        let config: DeployConfig = serde_json::from_value(document).map_err(|e| {
            CumulusError::Config(ConfigError::ParseError {
                message: format!("Invalid configuration: {e}"),
                location,
            })
        })?;

        debug!(
            "Successfully parsed configuration for project: {} ({} resources)",
            config.project.qualified_name(),
            config.resources.len()
        );
        Ok(config)
    }

    /// Applies environment variable overrides to the raw document.
    fn apply_env_overrides<F>(document: &mut Value, env: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let Value::Object(root) = document else {
            return;
        };
        for (var, section, key) in ENV_OVERRIDES {
            let Some(value) = env(var) else {
                continue;
            };
            debug!("Overriding {section}.{key} from environment");
            let entry = root
                .entry((*section).to_string())
                .or_insert_with(|| Value::Object(serde_json::Map::new()));
            if !entry.is_object() {
                *entry = Value::Object(serde_json::Map::new());
            }
            if let Value::Object(map) = entry {
                map.insert((*key).to_string(), Value::String(value));
            }
        }
    }

    /// Substitutes variables in the templated sections.
    fn substitute(document: &mut Value) -> Result<()> {
        let Value::Object(root) = document else {
            return Ok(());
        };

        let text = |section: &str, key: &str, default: &str| {
            root.get(section)
                .and_then(|s| s.get(key))
                .and_then(Value::as_str)
                .unwrap_or(default)
                .to_string()
        };

        let mut scope: BTreeMap<String, Value> = BTreeMap::new();
        scope.insert(String::from("project"), Value::String(text("project", "name", "")));
        scope.insert(String::from("stack"), Value::String(text("project", "stack", "dev")));
        if let Some(Value::Object(vars)) = root.get("variables") {
            for (name, value) in vars {
                scope.insert(format!("var.{name}"), value.clone());
            }
        }

        for section in TEMPLATED_SECTIONS {
            match root.get_mut(*section) {
                Some(Value::Array(items)) => {
                    for (i, item) in items.iter_mut().enumerate() {
                        let label = item
                            .get("name")
                            .and_then(Value::as_str)
                            .map_or_else(|| format!("{section}[{i}]"), |n| format!("{section}[{i}] ({n})"));
                        *item = substitute_variables(item, &scope).map_err(|e| template_error(e, &label))?;
                    }
                }
                Some(Value::Object(entries)) => {
                    for (key, value) in entries.iter_mut() {
                        let label = format!("{section}.{key}");
                        *value = substitute_variables(value, &scope).map_err(|e| template_error(e, &label))?;
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Loads the .env file if present.
    ///
    /// # Errors
    ///
    /// Returns an error if the .env file exists but cannot be loaded.
    pub fn load_dotenv(&self) -> Result<()> {
        let env_path = self
            .base_path
            .as_ref()
            .map_or_else(|| PathBuf::from(".env"), |p| p.join(".env"));

        if env_path.exists() {
            info!("Loading environment from: {}", env_path.display());
            dotenvy::from_path(&env_path).map_err(|e| {
                CumulusError::Config(ConfigError::ParseError {
                    message: format!("Failed to load .env file: {e}"),
                    location: Some(env_path.display().to_string()),
                })
            })?;
        } else {
            debug!(".env file not found at: {}", env_path.display());
        }

        Ok(())
    }
}

fn template_error(error: TemplateError, location: &str) -> CumulusError {
    let error = match error {
        TemplateError::UnknownVariable { name } => ConfigError::UnknownVariable {
            name,
            location: location.to_string(),
        },
        other => ConfigError::ParseError {
            message: other.to_string(),
            location: Some(location.to_string()),
        },
    };
    CumulusError::Config(error)
}

/// Default configuration file names to search for.
pub const DEFAULT_CONFIG_FILES: &[&str] = &[
    "cumulus.deploy.yaml",
    "cumulus.deploy.yml",
    "deploy.yaml",
    "deploy.yml",
];

/// Finds the configuration file in the current directory or parent directories.
///
/// # Errors
///
/// Returns an error if no configuration file is found.
pub fn find_config_file(start_dir: impl AsRef<Path>) -> Result<PathBuf> {
    let start = start_dir.as_ref();
    let mut current = start.to_path_buf();

    loop {
        for filename in DEFAULT_CONFIG_FILES {
            let config_path = current.join(filename);
            if config_path.exists() {
                info!("Found configuration file: {}", config_path.display());
                return Ok(config_path);
            }
        }

        if !current.pop() {
            break;
        }
    }

    Err(CumulusError::Config(ConfigError::FileNotFound {
        path: start.join(DEFAULT_CONFIG_FILES[0]),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StateBackend;
    use serde_json::json;

    #[test]
    fn test_parse_minimal_config() {
        let yaml = r"
project:
  name: test-project
resources: []
";
        let config = ConfigParser::new().parse_yaml(yaml, None).unwrap();
        assert_eq!(config.project.name, "test-project");
        assert_eq!(config.project.stack, "dev");
        assert_eq!(config.state.backend, StateBackend::Local);
        assert_eq!(config.execution.parallelism, 10);
    }

    #[test]
    fn test_parse_resources_and_variables() {
        let yaml = r#"
project:
  name: web
  stack: prod
variables:
  instanceType: t2.micro
  ports: [80, 8080]
resources:
  - name: Web
    type: AWS::EC2::Instance
    properties:
      InstanceType: ${var.instanceType}
      SubnetId: ${Subnet.id}
      Ports: ${var.ports}
      Tags:
        - Key: Name
          Value: web-${stack}
  - name: Bucket
    type: AWS::S3::Bucket
    options:
      delete_before_replace: true
outputs:
  publicIp: ${Web.PublicIp}
"#;
        let config = ConfigParser::new().parse_yaml(yaml, None).unwrap();
        let web = &config.resources[0];
        assert_eq!(web.properties["InstanceType"], json!("t2.micro"));
        assert_eq!(web.properties["SubnetId"], json!("${Subnet.id}"));
        assert_eq!(web.properties["Ports"], json!([80, 8080]));
        assert_eq!(web.properties["Tags"][0]["Value"], json!("web-prod"));
        assert!(config.resources[1].options.delete_before_replace);
        assert_eq!(config.outputs["publicIp"], json!("${Web.PublicIp}"));
    }

    #[test]
    fn test_unknown_variable() {
        let yaml = r"
project:
  name: web
resources:
  - name: Web
    type: AWS::EC2::Instance
    properties:
      InstanceType: ${var.missing}
";
        let err = ConfigParser::new().parse_yaml(yaml, None).unwrap_err();
        match err {
            CumulusError::Config(ConfigError::UnknownVariable { name, location }) => {
                assert_eq!(name, "missing");
                assert_eq!(location, "resources[0] (Web)");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_env_overrides() {
        let yaml = r"
project:
  name: web
resources:
  - name: Bucket
    type: AWS::S3::Bucket
    properties:
      BucketName: logs-${stack}
";
        let config = ConfigParser::new()
            .parse_yaml_with(yaml, None, |name| match name {
                "CUMULUS_STACK" => Some(String::from("staging")),
                "CUMULUS_STATE_BUCKET" => Some(String::from("tf-state")),
                _ => None,
            })
            .unwrap();
        assert_eq!(config.project.stack, "staging");
        assert_eq!(config.state.bucket.as_deref(), Some("tf-state"));
        assert_eq!(config.resources[0].properties["BucketName"], json!("logs-staging"));
    }

    #[test]
    fn test_invalid_yaml() {
        let result = ConfigParser::new().parse_yaml("project: [", None);
        assert!(matches!(result, Err(CumulusError::Config(ConfigError::ParseError { .. }))));
    }

    #[test]
    fn test_find_config_file_walks_up() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("cumulus.deploy.yaml"), "project: {name: web}\nresources: []\n").unwrap();
        let nested = dir.path().join("a").join("b");
        std::fs::create_dir_all(&nested).unwrap();

        let found = find_config_file(&nested).unwrap();
        assert_eq!(found, dir.path().join("cumulus.deploy.yaml"));
    }
}
