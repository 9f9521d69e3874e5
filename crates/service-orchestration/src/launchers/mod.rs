//! Lifecycle controller and resource launchers.
//!
//! A [`Launcher`] starts one kind of resource and hands back a
//! [`ResourceHandle`] that can report liveness, stream logs and stop it.
//! The [`LifecycleController`] picks the first launcher that can handle a
//! resource, in registration order.

mod docker;
mod external;
mod logs;
mod process;

pub use docker::ContainerLauncher;
pub use external::ExternalLauncher;
pub use logs::{LogBuffer, LogStream};
pub use process::ProcessLauncher;

use crate::{AllocatedEndpoint, Error, ResolvedValue, Result};
use app_model::ResourceNode;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

/// Default time between the stop request and forced termination
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Information about a started resource
#[derive(Debug, Clone, Serialize)]
pub struct RunningResource {
    /// Unique instance ID
    pub id: Uuid,
    /// Resource name
    pub name: String,
    /// Resource kind label
    pub kind: String,
    /// Process ID (if applicable)
    pub pid: Option<u32>,
    /// Container ID (if applicable)
    pub container_id: Option<String>,
    /// Allocated endpoints
    pub endpoints: IndexMap<String, AllocatedEndpoint>,
    /// When the resource was started
    pub started_at: DateTime<Utc>,
}

impl RunningResource {
    /// Create a new running resource instance
    pub fn new(name: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            kind: kind.into(),
            pid: None,
            container_id: None,
            endpoints: IndexMap::new(),
            started_at: Utc::now(),
        }
    }

    /// Set the process ID
    pub fn with_pid(mut self, pid: u32) -> Self {
        self.pid = Some(pid);
        self
    }

    /// Set the container ID
    pub fn with_container_id(mut self, container_id: impl Into<String>) -> Self {
        self.container_id = Some(container_id.into());
        self
    }

    /// Set the endpoints
    pub fn with_endpoints(mut self, endpoints: IndexMap<String, AllocatedEndpoint>) -> Self {
        self.endpoints = endpoints;
        self
    }
}

/// Whether the backing process of a resource is alive
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Liveness {
    /// Still running
    Running,
    /// Exited, with a description of how
    Exited(String),
    /// Cannot be determined right now
    Unknown,
}

/// Everything a launcher needs to start a resource
#[derive(Debug, Clone)]
pub struct LaunchRequest {
    /// The resource to start
    pub resource: ResourceNode,
    /// Fully resolved environment
    pub env: IndexMap<String, ResolvedValue>,
    /// Allocated endpoints
    pub endpoints: IndexMap<String, AllocatedEndpoint>,
}

/// A started resource
#[async_trait]
pub trait ResourceHandle: Send + Sync {
    /// Information about the started resource
    fn info(&self) -> &RunningResource;

    /// Whether the backing process is still alive
    async fn liveness(&self) -> Liveness;

    /// Stop the resource, forcing termination after `grace`
    async fn stop(&self, grace: Duration) -> Result<()>;

    /// Log lines of the resource: buffered history, then live output until
    /// the resource exits
    async fn logs(&self) -> Result<LogStream>;
}

/// Starts resources of the kinds it handles
#[async_trait]
pub trait Launcher: Send + Sync {
    /// Check if this launcher can start the given resource
    fn can_handle(&self, resource: &ResourceNode) -> bool;

    /// Start the resource
    async fn start(&self, request: LaunchRequest) -> Result<Arc<dyn ResourceHandle>>;
}

/// Dispatches resources to launchers and stops them again
pub struct LifecycleController {
    launchers: Vec<Arc<dyn Launcher>>,
    default_grace: Duration,
}

impl LifecycleController {
    /// Controller without any launcher
    pub fn empty() -> Self {
        Self {
            launchers: Vec::new(),
            default_grace: DEFAULT_SHUTDOWN_GRACE,
        }
    }

    /// Controller with the built-in launchers: existing and external
    /// resources, local processes and docker containers
    pub fn new() -> Self {
        Self::empty()
            .with_launcher(ContainerLauncher::new())
            .with_launcher(ProcessLauncher::new())
            .with_launcher(ExternalLauncher)
    }

    /// Register a launcher; it takes precedence over earlier ones
    pub fn with_launcher(mut self, launcher: impl Launcher + 'static) -> Self {
        self.launchers.insert(0, Arc::new(launcher));
        self
    }

    /// Grace period used when a resource does not configure one
    pub fn with_default_grace(mut self, grace: Duration) -> Self {
        self.default_grace = grace;
        self
    }

    /// Grace period for stopping `resource`
    pub fn grace_for(&self, resource: &ResourceNode) -> Duration {
        resource.config().shutdown_grace.unwrap_or(self.default_grace)
    }

    /// Start a resource with the first launcher that handles it
    pub async fn start(&self, request: LaunchRequest) -> Result<Arc<dyn ResourceHandle>> {
        let name = request.resource.name().to_string();
        let launcher = self
            .launchers
            .iter()
            .find(|launcher| launcher.can_handle(&request.resource))
            .ok_or_else(|| Error::NoLauncher(name.clone()))?;

        debug!(
            "Launching '{}' with environment {:?}",
            name,
            request
                .env
                .iter()
                .map(|(key, value)| format!("{key}={value}"))
                .collect::<Vec<_>>()
        );
        let handle = launcher.start(request).await?;

        let info = handle.info();
        info!(
            "Started {} '{}'{}{}",
            info.kind,
            name,
            info.pid.map(|pid| format!(" (pid {pid})")).unwrap_or_default(),
            info.container_id
                .as_deref()
                .map(|id| format!(" (container {})", short_id(id)))
                .unwrap_or_default()
        );
        Ok(handle)
    }

    /// Stop a started resource
    pub async fn stop(&self, handle: &dyn ResourceHandle, grace: Duration) -> Result<()> {
        info!("Stopping '{}'", handle.info().name);
        handle.stop(grace).await
    }

    /// Log stream of a started resource
    pub async fn logs_of(&self, handle: &dyn ResourceHandle) -> Result<LogStream> {
        handle.logs().await
    }
}

impl Default for LifecycleController {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) fn short_id(id: &str) -> &str {
    id.get(..12).unwrap_or(id)
}
