//! # App Model
//!
//! Declarative description of a distributed application: which resources
//! exist, how they are configured and how they depend on each other.
//!
//! Resources are declared on a [`Registry`] during the declaration phase.
//! [`Registry::build`] validates the whole graph at once (duplicate names,
//! unknown references, unknown parameters, cycles) and closes the phase by
//! producing an immutable [`AppModel`] that the orchestrator consumes.
//!
//! ## Example
//!
//! ```rust
//! use app_model::{EdgeKind, EndpointSpec, Registry, ResourceConfig, ResourceKind};
//!
//! # fn example() -> app_model::Result<()> {
//! let mut registry = Registry::new();
//!
//! registry.declare(
//!     "cache",
//!     ResourceKind::Container {
//!         image: "redis:7".to_string(),
//!         args: vec![],
//!         volumes: vec![],
//!     },
//!     ResourceConfig::new()
//!         .with_endpoint(EndpointSpec::new("tcp", "tcp").with_target_port(6379))
//!         .with_connection_string("{host}:{port}"),
//! )?;
//! registry.declare(
//!     "api",
//!     ResourceKind::Project {
//!         binary: "./api".to_string(),
//!         args: vec![],
//!         working_dir: None,
//!     },
//!     ResourceConfig::new(),
//! )?;
//! registry.add_edge("api", "cache", EdgeKind::Reference)?;
//! registry.add_edge("api", "cache", EdgeKind::WaitFor)?;
//!
//! let model = registry.build()?;
//! assert_eq!(model.graph().layers()?, vec![vec!["cache"], vec!["api"]]);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(unsafe_code)]

mod graph;
mod manifest;
mod parameter;
mod registry;
mod resource;
mod template;

pub use graph::DependencyGraph;
pub use manifest::{Manifest, ManifestBinding, ManifestEntry};
pub use parameter::{Parameter, ParameterSource};
pub use registry::{AppModel, ExecutionMode, Registry};
pub use resource::{
    DependencyEdge, EdgeKind, EndpointSpec, ProbePolicy, Provisioning, ReadinessCheck,
    ReadinessSpec, ResourceConfig, ResourceKind, ResourceNode,
};
pub use template::{EndpointField, Placeholder, Template};

/// Errors raised while declaring or validating an app model.
///
/// All of these are declaration-time errors: they abort before any
/// resource is started.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ModelError {
    /// A resource or parameter with this name is already declared
    #[error("Resource already declared: {0}")]
    DuplicateName(String),

    /// An edge or database declaration names an undeclared resource
    #[error("Unknown resource: {0}")]
    UnknownResource(String),

    /// A template references an undeclared parameter
    #[error("Resource '{resource}' references unknown parameter '{parameter}'")]
    UnknownParameter {
        /// Resource whose configuration holds the reference
        resource: String,
        /// The missing parameter
        parameter: String,
    },

    /// The dependency graph is not acyclic
    #[error("Dependency cycle detected: {}", format_cycle(.members))]
    Cycle {
        /// Names of the resources forming the cycle, in edge order
        members: Vec<String>,
    },

    /// Invalid resource configuration
    #[error("Invalid configuration for '{resource}': {reason}")]
    InvalidConfig {
        /// Offending resource
        resource: String,
        /// What is wrong with it
        reason: String,
    },
}

impl ModelError {
    pub(crate) fn invalid(resource: &str, reason: impl Into<String>) -> Self {
        ModelError::InvalidConfig {
            resource: resource.to_string(),
            reason: reason.into(),
        }
    }
}

fn format_cycle(members: &[String]) -> String {
    match members.first() {
        Some(first) => format!("{} -> {}", members.join(" -> "), first),
        None => String::new(),
    }
}

/// Result type for app model operations
pub type Result<T> = std::result::Result<T, ModelError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_error_message() {
        let err = ModelError::Cycle {
            members: vec!["a".to_string(), "b".to_string()],
        };
        assert_eq!(err.to_string(), "Dependency cycle detected: a -> b -> a");
    }
}
