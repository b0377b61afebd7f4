//! Error types for the Cumulus provisioning engine.
//!
//! Errors are grouped by the stage that produces them: configuration and
//! graph validation happen before any provider call, provider and state
//! errors happen while planning or executing, and plan errors guard the
//! transition between the two.

use std::path::PathBuf;
use thiserror::Error;

/// The main error type for the Cumulus engine.
#[derive(Debug, Error)]
pub enum CumulusError {
    /// Configuration-related errors.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Resource graph validation errors.
    #[error("Validation error: {0}")]
    Graph(#[from] GraphError),

    /// State management errors.
    #[error("State error: {0}")]
    State(#[from] StateError),

    /// Cloud provider errors.
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    /// Planning errors.
    #[error("Planning error: {0}")]
    Plan(#[from] PlanError),

    /// The run was cancelled before it could complete.
    #[error("Operation cancelled: {reason}")]
    Cancelled {
        /// Why the run stopped.
        reason: String,
    },

    /// IO errors.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Configuration-related errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file was not found.
    #[error("Configuration file not found: {path}")]
    FileNotFound {
        /// Path to the missing file.
        path: PathBuf,
    },

    /// The configuration file could not be parsed.
    #[error("Failed to parse configuration: {message}")]
    ParseError {
        /// Description of the parse error.
        message: String,
        /// Optional source location.
        location: Option<String>,
    },

    /// Validation failed.
    #[error("Configuration validation failed: {message}")]
    ValidationError {
        /// Description of the validation error.
        message: String,
        /// Field that failed validation.
        field: Option<String>,
    },

    /// A `${var.NAME}` expression names a variable that is not defined.
    #[error("Unknown variable '{name}' referenced in {location}")]
    UnknownVariable {
        /// Name of the variable.
        name: String,
        /// Where the expression was found.
        location: String,
    },

    /// Environment variable is missing.
    #[error("Missing environment variable: {name}")]
    MissingEnvVar {
        /// Name of the missing variable.
        name: String,
    },
}

/// Errors raised while building the resource graph.
///
/// All of these are fatal and surface before any provider call is made.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum GraphError {
    /// Two declarations share the same logical name.
    #[error("Duplicate resource name: {name}")]
    DuplicateName {
        /// The duplicated name.
        name: String,
    },

    /// A reference or `depends_on` entry names an undeclared resource.
    #[error("Unknown reference in '{resource}': '{reference}' does not name a declared resource ({target})")]
    UnknownReference {
        /// Resource holding the reference.
        resource: String,
        /// The reference expression as written.
        reference: String,
        /// The missing target name.
        target: String,
    },

    /// A resource references itself.
    #[error("Resource '{resource}' references itself")]
    SelfReference {
        /// The offending resource.
        resource: String,
    },

    /// The dependency graph contains a cycle.
    #[error("Cyclic dependency: {cycle}")]
    CyclicDependency {
        /// The cycle, rendered as `A -> B -> A`.
        cycle: String,
    },

    /// A reference expression is malformed.
    #[error("Malformed reference in '{resource}' property '{property}': {message}")]
    MalformedReference {
        /// Resource holding the expression.
        resource: String,
        /// Property holding the expression.
        property: String,
        /// What is wrong with it.
        message: String,
    },
}

/// State management errors.
#[derive(Debug, Error)]
pub enum StateError {
    /// State is corrupted.
    #[error("State is corrupted: {message}")]
    Corrupted {
        /// Description of the corruption.
        message: String,
    },

    /// State lock acquisition failed for a reason other than contention.
    #[error("Failed to acquire state lock: {message}")]
    LockFailed {
        /// Description of the lock failure.
        message: String,
    },

    /// State lock is held by another run.
    #[error(
        "State is locked by another run (holder: {holder}, operation: {operation}, since: {since}); retry once it finishes or run 'cumulus state unlock --force'"
    )]
    LockConflict {
        /// Identifier of the lock holder.
        holder: String,
        /// Operation the holder is running.
        operation: String,
        /// When the lock was acquired.
        since: String,
    },

    /// Storage backend error.
    #[error("State backend error: {message}")]
    Backend {
        /// Description of the backend error.
        message: String,
    },

    /// Serialization error.
    #[error("State serialization error: {message}")]
    SerializationError {
        /// Description of the serialization error.
        message: String,
    },

    /// The stored snapshot changed since it was loaded.
    #[error("State version mismatch: expected serial {expected}, found {found}")]
    VersionMismatch {
        /// Serial the writer loaded.
        expected: u64,
        /// Serial currently stored.
        found: u64,
    },
}

/// Cloud provider errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProviderError {
    /// The provider throttled the request.
    #[error("Request throttled: {message}")]
    Throttled {
        /// Provider message.
        message: String,
        /// Suggested delay before retrying.
        retry_after_secs: Option<u64>,
    },

    /// An operation did not finish in time.
    #[error("Timed out waiting for {operation} of {resource}")]
    Timeout {
        /// Operation that timed out.
        operation: String,
        /// Resource the operation targeted.
        resource: String,
    },

    /// Transport-level failure.
    #[error("Network error: {message}")]
    Network {
        /// Description of the failure.
        message: String,
    },

    /// Provider-side internal failure.
    #[error("Service error ({code}): {message}")]
    Service {
        /// Provider error code.
        code: String,
        /// Provider message.
        message: String,
    },

    /// The resource does not exist provider-side.
    #[error("{resource_type} '{identifier}' not found")]
    NotFound {
        /// Resource type.
        resource_type: String,
        /// Physical identifier.
        identifier: String,
    },

    /// The resource already exists provider-side.
    #[error("{resource_type} already exists: {message}")]
    AlreadyExists {
        /// Resource type.
        resource_type: String,
        /// Provider message.
        message: String,
    },

    /// The request was rejected as invalid.
    #[error("Invalid request: {message}")]
    InvalidRequest {
        /// Provider message.
        message: String,
    },

    /// The resource type is not supported by the provider.
    #[error("Unsupported resource type: {resource_type}")]
    Unsupported {
        /// Resource type.
        resource_type: String,
    },

    /// Any other non-transient failure.
    #[error("Provider operation failed ({code}): {message}")]
    Failed {
        /// Provider error code.
        code: String,
        /// Provider message.
        message: String,
    },
}

/// Planning errors.
#[derive(Debug, Error)]
pub enum PlanError {
    /// A protected resource would be deleted or replaced.
    #[error("Resource '{name}' is protected and cannot be {action}; remove 'protect' first")]
    ProtectedResource {
        /// Resource name.
        name: String,
        /// Action that was refused.
        action: String,
    },

    /// A reference could not be resolved from recorded outputs.
    #[error("Cannot resolve '{reference}' for '{resource}': {reason}")]
    UnresolvedReference {
        /// Resource holding the reference.
        resource: String,
        /// The reference expression.
        reference: String,
        /// Why it failed.
        reason: String,
    },
}

/// Result type alias for Cumulus operations.
pub type Result<T> = std::result::Result<T, CumulusError>;

/// Result type alias for provider operations.
pub type ProviderResult<T> = std::result::Result<T, ProviderError>;

impl CumulusError {
    /// Creates a new internal error with the given message.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Returns true if this error is retryable.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Provider(e) => e.is_transient(),
            Self::State(StateError::LockFailed { .. }) => true,
            _ => false,
        }
    }

    /// Returns true if the error was raised before any provider call.
    #[must_use]
    pub const fn is_validation(&self) -> bool {
        matches!(self, Self::Config(_) | Self::Graph(_))
    }
}

impl ConfigError {
    /// Creates a validation error for a specific field.
    #[must_use]
    pub fn validation(message: impl Into<String>, field: impl Into<String>) -> Self {
        Self::ValidationError {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Creates a validation error without a specific field.
    #[must_use]
    pub fn validation_general(message: impl Into<String>) -> Self {
        Self::ValidationError {
            message: message.into(),
            field: None,
        }
    }
}

impl StateError {
    /// Creates a backend error with the given message.
    #[must_use]
    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend {
            message: message.into(),
        }
    }

    /// Creates a serialization error with the given message.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::SerializationError {
            message: message.into(),
        }
    }

    /// Creates a corruption error with the given message.
    #[must_use]
    pub fn corrupted(message: impl Into<String>) -> Self {
        Self::Corrupted {
            message: message.into(),
        }
    }
}

impl ProviderError {
    /// Returns true for failure classes worth retrying: throttling,
    /// timeouts, transport failures and provider-internal errors.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Throttled { .. } | Self::Timeout { .. } | Self::Network { .. } | Self::Service { .. }
        )
    }

    /// Returns the provider's suggested retry delay in seconds, if any.
    #[must_use]
    pub const fn retry_after_secs(&self) -> Option<u64> {
        match self {
            Self::Throttled { retry_after_secs, .. } => *retry_after_secs,
            _ => None,
        }
    }

    /// Creates a network error.
    #[must_use]
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
        }
    }

    /// Creates a generic non-transient failure.
    #[must_use]
    pub fn failed(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Failed {
            code: code.into(),
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(ProviderError::Throttled {
            message: String::from("slow down"),
            retry_after_secs: Some(3),
        }
        .is_transient());
        assert!(ProviderError::network("reset").is_transient());
        assert!(!ProviderError::InvalidRequest {
            message: String::from("bad cidr"),
        }
        .is_transient());
        assert!(!ProviderError::failed("AccessDenied", "no").is_transient());
    }

    #[test]
    fn test_validation_errors_are_flagged() {
        let err = CumulusError::from(GraphError::CyclicDependency {
            cycle: String::from("a -> b -> a"),
        });
        assert!(err.is_validation());
        assert!(!err.is_retryable());
    }
}
