//! Configuration hashing for change detection.
//!
//! This module provides deterministic hashing of configuration structures
//! to detect changes between deployments and enable idempotent operations.
//! Property maps are ordered, so their JSON rendering is canonical.

use sha2::{Digest, Sha256};

use crate::resource::{Properties, ResourceDeclaration};

use super::spec::DeployConfig;

/// Hasher for computing configuration hashes.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConfigHasher;

impl ConfigHasher {
    /// Creates a new configuration hasher.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Computes a hash of the entire deployment configuration.
    ///
    /// This hash changes when any declared resource or output changes.
    #[must_use]
    pub fn hash_config(&self, config: &DeployConfig) -> String {
        let mut hasher = Sha256::new();

        hasher.update(config.project.name.as_bytes());
        hasher.update(config.project.stack.as_bytes());

        for resource in &config.resources {
            hasher.update(resource.name.as_bytes());
            hasher.update(self.hash_resource(resource).as_bytes());
            for dep in &resource.depends_on {
                hasher.update(dep.as_bytes());
            }
        }

        for (name, value) in &config.outputs {
            hasher.update(name.as_bytes());
            hasher.update(value.to_string().as_bytes());
        }

        hex::encode(hasher.finalize())
    }

    /// Computes the hash of a declaration's tracked properties.
    ///
    /// Properties listed in `ignore_changes` do not contribute.
    #[must_use]
    pub fn hash_resource(&self, resource: &ResourceDeclaration) -> String {
        self.hash_properties(&resource.resource_type, &resource.tracked_properties())
    }

    /// Computes the hash of a property set for a resource type.
    #[must_use]
    pub fn hash_properties(&self, resource_type: &str, properties: &Properties) -> String {
        let mut hasher = Sha256::new();
        hasher.update(resource_type.as_bytes());
        hasher.update([0u8]);
        for (key, value) in properties {
            hasher.update(key.as_bytes());
            hasher.update([0u8]);
            hasher.update(value.to_string().as_bytes());
            hasher.update([0u8]);
        }
        hex::encode(hasher.finalize())
    }

    /// Returns a short version of a hash, for display.
    #[must_use]
    pub fn short_hash(hash: &str) -> &str {
        hash.get(..12).unwrap_or(hash)
    }
}
