//! Core error types for spindle
//!
//! This module contains the main SpindleError enum with all error variants
//! and associated type aliases for Result types.

use thiserror::Error;

/// Comprehensive error type for spindle operations
///
/// SpindleError provides structured error information for configuration
/// resolution, provenance handling, and directory interactions, with enough
/// context to identify the component and property involved.
///
/// # Error Categories
///
/// - **Construction Errors**: property resolution and instantiation failures
///   (missing properties, type mismatches, cycles, duplicate names). These
///   are fatal to the lookup that triggered them and are never retried by
///   the framework.
/// - **Directory Errors**: lookup failures against the service directory and
///   stale registration handles.
/// - **Remote Errors**: transient remote invocation failures. This is the
///   only category with a defined recovery path: the calling component
///   triggers reconfigure-and-retry itself.
/// - **Provenance Errors**: integrity failures while unmarshalling a
///   flattened provenance graph.
#[derive(Error, Debug)]
pub enum SpindleError {
    // Property resolution
    #[error("Missing required property '{property}' on component '{component}'")]
    MissingRequiredProperty { component: String, property: String },

    #[error("Type mismatch for property '{property}' on component '{component}': expected {expected}, found {found}")]
    TypeMismatch {
        component: String,
        property: String,
        expected: String,
        found: String,
    },

    #[error("Undeclared property '{property}' on component '{component}'")]
    UnknownProperty { component: String, property: String },

    #[error("Circular dependency while resolving '{component}': {path}")]
    CircularDependency { component: String, path: String },

    #[error("Duplicate component name '{name}': registered as '{existing_type}', re-added as '{new_type}'")]
    DuplicateName {
        name: String,
        existing_type: String,
        new_type: String,
    },

    // Component and type registration
    #[error("Unknown component: {name}")]
    UnknownComponent { name: String },

    #[error("Unknown implementation type: {type_name}")]
    UnknownType { type_name: String },

    #[error("Implementation type '{type_name}' is already registered")]
    TypeAlreadyRegistered { type_name: String },

    #[error("Post-construction hook failed for component '{component}'")]
    StartFailed {
        component: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    // Directory and remote operation
    #[error("Directory lookup found no provider for type '{type_name}'")]
    LookupFailure { type_name: String },

    #[error("Stale registration handle: {handle}")]
    StaleRegistration { handle: String },

    #[error("Remote invocation '{operation}' failed: {details}")]
    RemoteInvocation { operation: String, details: String },

    // Provenance
    #[error("Marshalled provenance references unknown identity '{identity}'")]
    MarshalIntegrity { identity: String },

    // Internal & Implementation Errors
    #[error("Internal error: {message}")]
    Internal { message: String },

    #[error("Manager is shut down")]
    ShutDown,
}

impl SpindleError {
    /// Whether a failed operation may succeed after the caller reconfigures
    /// and retries. Only remote invocation failures qualify; construction
    /// errors are deterministic and retrying them is pointless.
    pub fn is_transient(&self) -> bool {
        matches!(self, SpindleError::RemoteInvocation { .. })
    }
}

pub type Result<T> = std::result::Result<T, SpindleError>;
pub type SpindleResult<T> = std::result::Result<T, SpindleError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        let remote = SpindleError::RemoteInvocation {
            operation: "serve".to_string(),
            details: "connection reset".to_string(),
        };
        assert!(remote.is_transient());

        let missing = SpindleError::MissingRequiredProperty {
            component: "decoder".to_string(),
            property: "rate".to_string(),
        };
        assert!(!missing.is_transient());
    }

    #[test]
    fn display_includes_context() {
        let err = SpindleError::TypeMismatch {
            component: "mixer".to_string(),
            property: "inputs".to_string(),
            expected: "component list".to_string(),
            found: "scalar".to_string(),
        };
        let text = err.to_string();
        assert!(text.contains("mixer"));
        assert!(text.contains("inputs"));
        assert!(text.contains("component list"));
    }
}
