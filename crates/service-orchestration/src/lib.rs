//! # Service Orchestration
//!
//! Runtime half of the apphost: takes a validated [`app_model::AppModel`],
//! starts every resource as soon as the resources it depends on are ready,
//! injects resolved connection information into each resource's
//! environment and tears everything down in reverse dependency order.
//!
//! The crate is executor-agnostic. Timers come from `async-io`, child
//! processes from `async-process`, and concurrency from `futures`, so
//! callers can drive it with any executor.
//!
//! ## Example
//!
//! ```rust,no_run
//! use app_model::{EndpointSpec, Registry, ResourceConfig, ResourceKind};
//! use service_orchestration::{Orchestrator, Shutdown};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let mut registry = Registry::new();
//! registry.declare(
//!     "api",
//!     ResourceKind::Project {
//!         binary: "./target/debug/api".to_string(),
//!         args: vec![],
//!         working_dir: None,
//!     },
//!     ResourceConfig::new().with_endpoint(EndpointSpec::new("http", "http").with_env("PORT")),
//! )?;
//!
//! let orchestrator = Orchestrator::new(registry.build()?);
//! let plan = orchestrator.plan()?;
//! let shutdown = Shutdown::new();
//!
//! let deployment = orchestrator.run(&plan, &shutdown).await?;
//! println!("{:?}", deployment.report());
//! deployment.shutdown().await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(unsafe_code)]

mod cache;
mod endpoints;
mod launchers;
mod orchestrator;
mod parameters;
mod readiness;
mod resolver;
mod scheduler;
mod shutdown;
mod state;
mod value;

pub use endpoints::{AllocatedEndpoint, EndpointTable};
pub use launchers::{
    ContainerLauncher, ExternalLauncher, LaunchRequest, Launcher, LifecycleController, Liveness,
    LogBuffer, LogStream, ProcessLauncher, ResourceHandle, RunningResource,
};
pub use orchestrator::{Deployment, Orchestrator, ResourceStatus, RunReport};
pub use parameters::{MemorySecretStore, ParameterResolver, SecretStore};
pub use readiness::{
    DefaultProbes, ProbeFactory, ProbeOutcome, ProbeReport, ReadinessFailure, ReadinessProbe,
    observe,
};
pub use resolver::{ReferenceResolver, ReferenceValue, ResolvedReference};
pub use scheduler::{StartupPlan, plan};
pub use shutdown::Shutdown;
pub use state::{FailureCause, ReadinessState, StateBoard, StateCell};
pub use value::ResolvedValue;

use std::time::Duration;

/// Error types for orchestration operations
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Declaration-time errors from the app model
    #[error("App model error: {0}")]
    Model(#[from] app_model::ModelError),

    /// A reference was resolved before its producer became ready
    #[error("Resource '{producer}' is not ready (state: {state})")]
    NotReady {
        /// Producer of the reference
        producer: String,
        /// Its state at the time of the call
        state: ReadinessState,
    },

    /// Readiness was not confirmed within the configured timeout
    #[error("Resource '{resource}' did not become ready within {timeout:?}")]
    Timeout {
        /// Resource that timed out
        resource: String,
        /// Configured timeout
        timeout: Duration,
    },

    /// Readiness probe reported a failure
    #[error("Readiness probe failed for '{resource}': {reason}")]
    ProbeFailed {
        /// Probed resource
        resource: String,
        /// Last probe error
        reason: String,
    },

    /// A parameter value could not be obtained
    #[error("Parameter '{parameter}' is unavailable: {reason}")]
    SecretUnavailable {
        /// Parameter name
        parameter: String,
        /// Why it could not be resolved
        reason: String,
    },

    /// The backing process or container could not be started
    #[error("Failed to start '{resource}': {reason}")]
    StartFailed {
        /// Resource being started
        resource: String,
        /// Launcher error
        reason: String,
    },

    /// A producer failed, so the resource was never started
    #[error("Resource '{resource}' was not started because '{producer}' failed")]
    UpstreamFailed {
        /// Resource that was skipped
        resource: String,
        /// Failed producer
        producer: String,
    },

    /// A template or reference could not be resolved
    #[error("Failed to resolve configuration of '{resource}': {reason}")]
    Resolution {
        /// Resource whose configuration was being resolved
        resource: String,
        /// What could not be resolved
        reason: String,
    },

    /// Resource not found
    #[error("Resource not found: {0}")]
    ResourceNotFound(String),

    /// A state change that the lifecycle does not allow
    #[error("Invalid state transition for '{resource}': {from} -> {to}")]
    InvalidTransition {
        /// Resource whose state was being changed
        resource: String,
        /// Current state
        from: ReadinessState,
        /// Requested state
        to: ReadinessState,
    },

    /// No registered launcher handles the resource
    #[error("No launcher can handle resource '{0}'")]
    NoLauncher(String),

    /// The model was built for publishing, not running
    #[error("App model is in publish mode; emit a manifest instead of running it")]
    PublishMode,

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for orchestration operations
pub type Result<T> = std::result::Result<T, Error>;
