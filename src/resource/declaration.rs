//! Resource declarations.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::GraphError;

use super::reference::{Reference, references_in};

/// Declared properties of a resource, keyed by property name.
pub type Properties = BTreeMap<String, Value>;

/// A single declared resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceDeclaration {
    /// Logical name, unique within the deployment.
    pub name: String,

    /// Resource type in `AWS::Service::Type` form.
    #[serde(rename = "type")]
    pub resource_type: String,

    /// Desired properties. String values may contain reference expressions.
    #[serde(default)]
    pub properties: Properties,

    /// Explicit ordering hints in addition to inferred references.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,

    /// Lifecycle options.
    #[serde(default)]
    pub options: ResourceOptions,
}

/// Lifecycle options of a resource.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceOptions {
    /// Delete the old resource before creating its replacement.
    pub delete_before_replace: bool,

    /// Refuse to delete or replace this resource.
    pub protect: bool,

    /// Top-level property names excluded from change detection.
    pub ignore_changes: Vec<String>,
}

/// A reference found in a declaration, with the property that holds it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertyReference {
    /// Top-level property name.
    pub property: String,
    /// The reference.
    pub reference: Reference,
}

impl ResourceDeclaration {
    /// Creates a declaration with no properties.
    #[must_use]
    pub fn new(name: impl Into<String>, resource_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            resource_type: resource_type.into(),
            properties: Properties::new(),
            depends_on: Vec::new(),
            options: ResourceOptions::default(),
        }
    }

    /// Adds a property.
    #[must_use]
    pub fn with_property(mut self, key: impl Into<String>, value: Value) -> Self {
        self.properties.insert(key.into(), value);
        self
    }

    /// Adds an explicit dependency.
    #[must_use]
    pub fn with_depends_on(mut self, name: impl Into<String>) -> Self {
        self.depends_on.push(name.into());
        self
    }

    /// Returns every reference in the declared properties.
    ///
    /// # Errors
    ///
    /// Returns [`GraphError::MalformedReference`] for unparseable expressions.
    pub fn references(&self) -> Result<Vec<PropertyReference>, GraphError> {
        let mut found = Vec::new();
        for (property, value) in &self.properties {
            let refs = references_in(value).map_err(|e| GraphError::MalformedReference {
                resource: self.name.clone(),
                property: property.clone(),
                message: e.to_string(),
            })?;
            found.extend(refs.into_iter().map(|reference| PropertyReference {
                property: property.clone(),
                reference,
            }));
        }
        Ok(found)
    }

    /// Returns the declared properties minus `ignore_changes`.
    #[must_use]
    pub fn tracked_properties(&self) -> Properties {
        self.properties
            .iter()
            .filter(|(k, _)| !self.options.ignore_changes.contains(k))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_deserialize_declaration() {
        let yaml = r"
name: WebSubnet
type: AWS::EC2::Subnet
properties:
  VpcId: ${Vpc.id}
  CidrBlock: 10.0.0.0/18
depends_on: [Igw]
options:
  ignore_changes: [Tags]
";
        let decl: ResourceDeclaration = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(decl.resource_type, "AWS::EC2::Subnet");
        assert_eq!(decl.depends_on, vec!["Igw"]);
        assert!(!decl.options.protect);

        let refs = decl.references().unwrap();
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].property, "VpcId");
        assert_eq!(refs[0].reference.resource, "Vpc");
    }

    #[test]
    fn test_tracked_properties_skip_ignored() {
        let mut decl = ResourceDeclaration::new("Vpc", "AWS::EC2::VPC")
            .with_property("CidrBlock", json!("10.0.0.0/16"))
            .with_property("Tags", json!([]));
        decl.options.ignore_changes.push(String::from("Tags"));

        let tracked = decl.tracked_properties();
        assert!(tracked.contains_key("CidrBlock"));
        assert!(!tracked.contains_key("Tags"));
    }

    #[test]
    fn test_malformed_reference() {
        let decl = ResourceDeclaration::new("Bad", "AWS::EC2::Route")
            .with_property("GatewayId", json!("${Igw.id"));
        let err = decl.references().unwrap_err();
        assert!(matches!(err, GraphError::MalformedReference { .. }));
    }
}
