//! # Apphost Configuration
//!
//! YAML app model files for the apphost orchestrator.
//!
//! An app model file declares parameters and resources together with the
//! edges between them. [`parse_file`] and [`parse_str`] check the file's
//! structure; [`Config::to_model`] turns it into a validated
//! [`app_model::AppModel`].
//!
//! ```yaml
//! version: "1.0"
//! name: shop
//!
//! parameters:
//!   db-password:
//!     secret: true
//!     env: DB_PASSWORD
//!
//! resources:
//!   postgres:
//!     type: container
//!     image: postgres:16
//!     endpoints:
//!       - name: tcp
//!         target_port: 5432
//!     env:
//!       POSTGRES_PASSWORD: "{params.db-password}"
//!     connection_string: "Host={host};Port={port};Password={params.db-password}"
//!   catalog:
//!     type: database
//!     server: postgres
//!     database_name: catalog
//!   api:
//!     type: project
//!     binary: ${API_BINARY:-./target/debug/api}
//!     endpoints:
//!       - name: http
//!         scheme: http
//!         env: PORT
//!     references: [catalog]
//! ```
//!
//! Parameters with a `store` source read from the YAML map named by
//! `settings.secrets_file`.

#![warn(missing_docs)]

use app_model::ExecutionMode;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod parser;
pub mod resolver;
pub mod secrets;

pub use parser::{parse_file, parse_str};
pub use secrets::load_secrets;
pub use resolver::{EnvVars, substitute_env_vars};

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read configuration file
    #[error("Failed to read config file: {0}")]
    Read(#[from] std::io::Error),

    /// Failed to parse YAML
    #[error("Failed to parse YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    Validation(String),

    /// Environment variable not found
    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),

    /// The declared model is invalid
    #[error("Invalid app model: {0}")]
    Model(#[from] app_model::ModelError),
}

/// Result type for configuration operations
pub type Result<T> = std::result::Result<T, ConfigError>;

/// Root of an app model file
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Configuration version
    pub version: String,

    /// Optional application name
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Optional description
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Run locally or publish a manifest
    #[serde(default)]
    pub mode: ExecutionMode,

    /// Global settings
    #[serde(default, skip_serializing_if = "Settings::is_default")]
    pub settings: Settings,

    /// Parameters in declaration order
    #[serde(default)]
    pub parameters: IndexMap<String, ParameterDef>,

    /// Resources in declaration order
    pub resources: IndexMap<String, ResourceDef>,
}

/// Global settings
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    /// Default log level
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,

    /// Default readiness timeout in seconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub startup_timeout: Option<u64>,

    /// Default shutdown grace period in seconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shutdown_timeout: Option<u64>,

    /// YAML map of secret store values, relative to the config file;
    /// required when a parameter reads from the store
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secrets_file: Option<String>,
}

impl Settings {
    /// Check if settings are default (all None)
    fn is_default(&self) -> bool {
        self == &Settings::default()
    }
}

/// Parameter definition; exactly one of `value`, `env` and `store` is set
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ParameterDef {
    /// Whether the value is a secret
    #[serde(default)]
    pub secret: bool,

    /// Literal value
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,

    /// Environment variable holding the value
    #[serde(skip_serializing_if = "Option::is_none")]
    pub env: Option<String>,

    /// Secret store key holding the value
    #[serde(skip_serializing_if = "Option::is_none")]
    pub store: Option<String>,
}

/// Resource definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceDef {
    /// Resource type
    #[serde(flatten)]
    pub resource_type: ResourceType,

    /// Network endpoints
    #[serde(default)]
    pub endpoints: Vec<EndpointDef>,

    /// Environment variables (value templates)
    #[serde(default)]
    pub env: IndexMap<String, String>,

    /// Connection string template; required for `external` resources
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connection_string: Option<String>,

    /// Resources whose connection information is injected
    #[serde(default)]
    pub references: Vec<String>,

    /// Resources that must be ready first
    #[serde(default)]
    pub wait_for: Vec<String>,

    /// Readiness check and probe timing
    #[serde(skip_serializing_if = "Option::is_none")]
    pub readiness: Option<ReadinessDef>,

    /// Connection string of an existing instance to bind to instead of
    /// running the resource locally
    #[serde(skip_serializing_if = "Option::is_none")]
    pub existing: Option<String>,

    /// Shutdown grace period in seconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shutdown_timeout: Option<u64>,

    /// Leave the resource out of the published manifest
    #[serde(default)]
    pub exclude_from_manifest: bool,
}

/// Resource type variants
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResourceType {
    /// Local process
    Project {
        /// Binary to execute
        binary: String,
        /// Command line arguments
        #[serde(default)]
        args: Vec<String>,
        /// Working directory
        #[serde(skip_serializing_if = "Option::is_none")]
        working_dir: Option<String>,
    },

    /// Docker container
    Container {
        /// Container image
        image: String,
        /// Container command arguments
        #[serde(default)]
        args: Vec<String>,
        /// Volume mounts
        #[serde(default)]
        volumes: Vec<String>,
    },

    /// Database on a server resource
    Database {
        /// Server resource name
        server: String,
        /// Database name; the resource name when omitted
        #[serde(skip_serializing_if = "Option::is_none")]
        database_name: Option<String>,
    },

    /// Externally managed resource
    External,
}

/// Endpoint definition
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EndpointDef {
    /// Endpoint name
    pub name: String,
    /// URL scheme
    #[serde(default = "default_scheme")]
    pub scheme: String,
    /// Host port; allocated when omitted
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    /// Port inside the container
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_port: Option<u16>,
    /// Environment variable receiving the allocated port
    #[serde(skip_serializing_if = "Option::is_none")]
    pub env: Option<String>,
}

fn default_scheme() -> String {
    "tcp".to_string()
}

/// Readiness check kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckType {
    /// Ready once started
    Immediate,
    /// Ready while running
    Running,
    /// Command exit status
    Command,
    /// TCP connect
    Tcp,
    /// HTTP GET
    Http,
    /// Container health status
    ContainerHealth,
}

/// Readiness configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReadinessDef {
    /// Check to run; derived from the resource type when omitted
    #[serde(skip_serializing_if = "Option::is_none")]
    pub check: Option<CheckType>,
    /// Command of a `command` check
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    /// Arguments of a `command` check
    #[serde(default)]
    pub args: Vec<String>,
    /// Endpoint of a `tcp` or `http` check
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    /// Path of an `http` check
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// Overall timeout in seconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    /// Attempts allowed for transient failures
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,
    /// First retry delay in milliseconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub initial_backoff_ms: Option<u64>,
    /// Retry delay cap in milliseconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_backoff_ms: Option<u64>,
}
