//! Resource declaration types.
//!
//! A resource is declared with a [`ResourceKind`] (what backs it) and a
//! [`ResourceConfig`] (endpoints, environment, readiness, provisioning).
//! Both are plain data built before any edge is validated.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// What backs a resource at runtime
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResourceKind {
    /// A local project started as a process
    Project {
        /// Binary to execute
        binary: String,
        /// Command line arguments
        #[serde(default)]
        args: Vec<String>,
        /// Working directory (optional)
        #[serde(default, skip_serializing_if = "Option::is_none")]
        working_dir: Option<String>,
    },
    /// A container image
    Container {
        /// Container image
        image: String,
        /// Arguments passed to the container entrypoint
        #[serde(default)]
        args: Vec<String>,
        /// Volume mounts
        #[serde(default)]
        volumes: Vec<String>,
    },
    /// A database hosted by a server resource
    Database {
        /// Name of the server resource
        server: String,
        /// Database name on that server
        database_name: String,
    },
    /// An externally managed resource known only by its connection string
    External {
        /// Connection string template
        connection_string: String,
    },
}

impl ResourceKind {
    /// Short label used in logs, status output and the manifest
    pub fn label(&self) -> &'static str {
        match self {
            ResourceKind::Project { .. } => "project",
            ResourceKind::Container { .. } => "container",
            ResourceKind::Database { .. } => "database",
            ResourceKind::External { .. } => "external",
        }
    }
}

/// A network endpoint exposed by a resource
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointSpec {
    /// Endpoint name, unique within the resource
    pub name: String,
    /// URL scheme (http, https, tcp, ...)
    #[serde(default = "default_scheme")]
    pub scheme: String,
    /// Host port; allocated at startup when omitted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    /// Port the service listens on inside its container
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_port: Option<u16>,
    /// Environment variable that receives the allocated port
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<String>,
}

fn default_scheme() -> String {
    "tcp".to_string()
}

impl EndpointSpec {
    /// Create an endpoint with a dynamically allocated port
    pub fn new(name: impl Into<String>, scheme: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            scheme: scheme.into(),
            port: None,
            target_port: None,
            env: None,
        }
    }

    /// Pin the host port
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Set the port the service listens on inside its container
    pub fn with_target_port(mut self, port: u16) -> Self {
        self.target_port = Some(port);
        self
    }

    /// Inject the allocated port into the owner's environment
    pub fn with_env(mut self, var: impl Into<String>) -> Self {
        self.env = Some(var.into());
        self
    }
}

/// How a resource's readiness is established
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "check", rename_all = "snake_case")]
pub enum ReadinessCheck {
    /// Ready as soon as it is started
    Immediate,
    /// Ready while the backing process or container is running
    Running,
    /// Ready when the command exits with status 0
    Command {
        /// Command to run
        command: String,
        /// Command arguments
        #[serde(default)]
        args: Vec<String>,
    },
    /// Ready when the endpoint accepts TCP connections
    Tcp {
        /// Endpoint name; the first endpoint when omitted
        #[serde(default)]
        endpoint: Option<String>,
    },
    /// Ready when an HTTP GET succeeds
    Http {
        /// Endpoint name; the first endpoint when omitted
        #[serde(default)]
        endpoint: Option<String>,
        /// Request path
        #[serde(default = "default_http_path")]
        path: String,
    },
    /// Ready when the container's own health check reports healthy
    ContainerHealth,
}

fn default_http_path() -> String {
    "/health".to_string()
}

/// Timing policy for readiness probing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbePolicy {
    /// Overall time budget before the resource is declared failed
    pub timeout: Duration,
    /// Attempts allowed for transient failures
    pub max_attempts: u32,
    /// Delay after the first transient failure
    pub initial_backoff: Duration,
    /// Upper bound for the backoff delay
    pub max_backoff: Duration,
}

impl Default for ProbePolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            max_attempts: 3,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(10),
        }
    }
}

impl ProbePolicy {
    /// Backoff after the given (1-indexed) failed attempt.
    ///
    /// `initial_backoff * 2^(attempt - 1)`, capped at `max_backoff`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.initial_backoff
            .saturating_mul(1u32 << exponent)
            .min(self.max_backoff)
    }
}

/// Readiness configuration of a resource
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReadinessSpec {
    /// Explicit check; derived from the resource kind when `None`
    pub check: Option<ReadinessCheck>,
    /// Probe timing
    pub policy: ProbePolicy,
}

/// Where a resource comes from when the app runs
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum Provisioning {
    /// Run the resource locally (process or container)
    #[default]
    Local,
    /// Bind to an already provisioned instance
    Existing {
        /// Connection string template of the existing instance
        connection_string: String,
    },
}

/// Configuration of a single resource
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResourceConfig {
    /// Exposed endpoints
    pub endpoints: Vec<EndpointSpec>,
    /// Declared environment bindings (values are templates)
    pub env: IndexMap<String, String>,
    /// Connection string template handed to referencing resources
    pub connection_string: Option<String>,
    /// Readiness probing
    pub readiness: ReadinessSpec,
    /// Provisioning strategy
    pub provisioning: Provisioning,
    /// Grace period between the stop request and forced termination
    pub shutdown_grace: Option<Duration>,
    /// Omit the resource from the publish manifest
    pub exclude_from_manifest: bool,
}

impl ResourceConfig {
    /// Empty configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an endpoint
    pub fn with_endpoint(mut self, endpoint: EndpointSpec) -> Self {
        self.endpoints.push(endpoint);
        self
    }

    /// Add an environment binding
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Set the connection string template
    pub fn with_connection_string(mut self, template: impl Into<String>) -> Self {
        self.connection_string = Some(template.into());
        self
    }

    /// Set the readiness check
    pub fn with_readiness(mut self, check: ReadinessCheck) -> Self {
        self.readiness.check = Some(check);
        self
    }

    /// Set the probe policy
    pub fn with_probe_policy(mut self, policy: ProbePolicy) -> Self {
        self.readiness.policy = policy;
        self
    }

    /// Set the provisioning strategy
    pub fn with_provisioning(mut self, provisioning: Provisioning) -> Self {
        self.provisioning = provisioning;
        self
    }

    /// Set the shutdown grace period
    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = Some(grace);
        self
    }

    /// Omit the resource from the publish manifest
    pub fn excluded_from_manifest(mut self) -> Self {
        self.exclude_from_manifest = true;
        self
    }
}

/// Kind of a dependency edge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeKind {
    /// Inject the producer's resolved connection info into the consumer
    Reference,
    /// Gate the consumer's start on the producer's readiness
    WaitFor,
}

/// A directed dependency from a consumer to a producer
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DependencyEdge {
    /// Resource that depends on the producer
    pub consumer: String,
    /// Resource being depended on
    pub producer: String,
    /// Edge kind
    pub kind: EdgeKind,
}

/// A declared resource
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceNode {
    pub(crate) name: String,
    pub(crate) kind: ResourceKind,
    pub(crate) config: ResourceConfig,
    pub(crate) index: usize,
    pub(crate) edges: Vec<DependencyEdge>,
}

impl ResourceNode {
    /// Unique resource name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// What backs the resource
    pub fn kind(&self) -> &ResourceKind {
        &self.kind
    }

    /// Resource configuration
    pub fn config(&self) -> &ResourceConfig {
        &self.config
    }

    /// Position in declaration order
    pub fn declaration_index(&self) -> usize {
        self.index
    }

    /// Outgoing edges (this resource is the consumer)
    pub fn edges(&self) -> &[DependencyEdge] {
        &self.edges
    }

    /// Reference edges of this resource
    pub fn references(&self) -> impl Iterator<Item = &DependencyEdge> {
        self.edges
            .iter()
            .filter(|edge| edge.kind == EdgeKind::Reference)
    }

    /// Distinct producers this resource depends on, in edge order
    pub fn producers(&self) -> Vec<&str> {
        let mut producers: Vec<&str> = Vec::new();
        for edge in &self.edges {
            if !producers.contains(&edge.producer.as_str()) {
                producers.push(&edge.producer);
            }
        }
        producers
    }

    /// Whether the resource binds to an existing instance
    pub fn is_existing(&self) -> bool {
        matches!(self.config.provisioning, Provisioning::Existing { .. })
    }

    /// Look up an endpoint by name
    pub fn endpoint(&self, name: &str) -> Option<&EndpointSpec> {
        self.config.endpoints.iter().find(|ep| ep.name == name)
    }

    /// The first declared endpoint
    pub fn primary_endpoint(&self) -> Option<&EndpointSpec> {
        self.config.endpoints.first()
    }

    /// The connection string template handed to referencing resources, if any
    pub fn connection_string_template(&self) -> Option<&str> {
        if let Provisioning::Existing { connection_string } = &self.config.provisioning {
            return Some(connection_string);
        }
        match &self.kind {
            ResourceKind::External { connection_string } => Some(connection_string),
            ResourceKind::Database { .. } => Some(
                self.config
                    .connection_string
                    .as_deref()
                    .unwrap_or(DEFAULT_DATABASE_CONNECTION_STRING),
            ),
            _ => self.config.connection_string.as_deref(),
        }
    }

    /// Readiness check to run, falling back to the kind's default
    pub fn effective_readiness(&self) -> ReadinessCheck {
        if let Some(check) = &self.config.readiness.check {
            return check.clone();
        }
        if self.is_existing() {
            return ReadinessCheck::Immediate;
        }
        match &self.kind {
            ResourceKind::Project { .. } | ResourceKind::Container { .. } => {
                if self.config.endpoints.is_empty() {
                    ReadinessCheck::Running
                } else {
                    ReadinessCheck::Tcp { endpoint: None }
                }
            }
            ResourceKind::Database { .. } | ResourceKind::External { .. } => {
                ReadinessCheck::Immediate
            }
        }
    }
}

/// Connection string of a database when none is configured
pub(crate) const DEFAULT_DATABASE_CONNECTION_STRING: &str = "{server};Database={database}";

#[cfg(test)]
mod tests {
    use super::*;

    fn project(config: ResourceConfig) -> ResourceNode {
        ResourceNode {
            name: "api".to_string(),
            kind: ResourceKind::Project {
                binary: "./api".to_string(),
                args: vec![],
                working_dir: None,
            },
            config,
            index: 0,
            edges: vec![],
        }
    }

    #[test]
    fn test_backoff_is_exponential_and_bounded() {
        let policy = ProbePolicy {
            timeout: Duration::from_secs(30),
            max_attempts: 10,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(500),
        };

        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(400));
        assert_eq!(policy.backoff(4), Duration::from_millis(500));
        assert_eq!(policy.backoff(40), Duration::from_millis(500));
    }

    #[test]
    fn test_default_readiness_by_kind() {
        assert_eq!(
            project(ResourceConfig::new()).effective_readiness(),
            ReadinessCheck::Running
        );
        assert_eq!(
            project(ResourceConfig::new().with_endpoint(EndpointSpec::new("http", "http")))
                .effective_readiness(),
            ReadinessCheck::Tcp { endpoint: None }
        );
        assert_eq!(
            project(ResourceConfig::new().with_provisioning(Provisioning::Existing {
                connection_string: "http://example.com".to_string(),
            }))
            .effective_readiness(),
            ReadinessCheck::Immediate
        );
    }

    #[test]
    fn test_existing_provisioning_overrides_connection_string() {
        let node = project(
            ResourceConfig::new()
                .with_connection_string("{host}:{port}")
                .with_provisioning(Provisioning::Existing {
                    connection_string: "cache.internal:6379".to_string(),
                }),
        );
        assert_eq!(
            node.connection_string_template(),
            Some("cache.internal:6379")
        );
    }

    #[test]
    fn test_readiness_check_yaml() {
        let check: ReadinessCheck =
            serde_yaml::from_str("check: tcp\nendpoint: http\n").expect("Failed to deserialize");
        assert_eq!(
            check,
            ReadinessCheck::Tcp {
                endpoint: Some("http".to_string())
            }
        );

        let check: ReadinessCheck =
            serde_yaml::from_str("check: immediate\n").expect("Failed to deserialize");
        assert_eq!(check, ReadinessCheck::Immediate);
    }
}
