//! Configuration parser and conversion into an app model

use crate::resolver::{EnvVars, substitute_all, substitute_env_vars};
use crate::{
    CheckType, Config, ConfigError, EndpointDef, ParameterDef, ReadinessDef, ResourceDef,
    ResourceType, Result,
};
use app_model::{
    AppModel, EndpointSpec, Parameter, ParameterSource, ProbePolicy, Provisioning, ReadinessCheck,
    ReadinessSpec, Registry, ResourceConfig, ResourceKind,
};
use std::path::Path;
use std::time::Duration;
use tracing::debug;

/// Parse a YAML configuration file
pub fn parse_file(path: impl AsRef<Path>) -> Result<Config> {
    let path = path.as_ref();
    debug!("Loading app model from {}", path.display());
    let content = std::fs::read_to_string(path)?;
    parse_str(&content)
}

/// Parse YAML configuration from a string
pub fn parse_str(content: &str) -> Result<Config> {
    let config: Config = serde_yaml::from_str(content)?;
    validate_config(&config)?;
    Ok(config)
}

/// Structural checks that need no environment
fn validate_config(config: &Config) -> Result<()> {
    if config.version != "1.0" {
        return Err(ConfigError::Validation(format!(
            "Unsupported version: {}, expected 1.0",
            config.version
        )));
    }

    for (name, parameter) in &config.parameters {
        let sources = [&parameter.value, &parameter.env, &parameter.store]
            .iter()
            .filter(|source| source.is_some())
            .count();
        if sources != 1 {
            return Err(ConfigError::Validation(format!(
                "Parameter '{}' must set exactly one of value, env or store",
                name
            )));
        }
        if parameter.store.is_some() && config.settings.secrets_file.is_none() {
            return Err(ConfigError::Validation(format!(
                "Parameter '{}' reads from the secret store but settings.secrets_file is not set",
                name
            )));
        }
    }

    for (name, resource) in &config.resources {
        let declared = |other: &String| config.resources.contains_key(other);
        for reference in &resource.references {
            if !declared(reference) {
                return Err(ConfigError::Validation(format!(
                    "Resource '{}' references unknown resource '{}'",
                    name, reference
                )));
            }
        }
        for producer in &resource.wait_for {
            if !declared(producer) {
                return Err(ConfigError::Validation(format!(
                    "Resource '{}' waits for unknown resource '{}'",
                    name, producer
                )));
            }
        }

        match &resource.resource_type {
            ResourceType::Database { server, .. } if !declared(server) => {
                return Err(ConfigError::Validation(format!(
                    "Database '{}' is hosted on unknown server '{}'",
                    name, server
                )));
            }
            ResourceType::External if resource.connection_string.is_none() => {
                return Err(ConfigError::Validation(format!(
                    "External resource '{}' needs a connection_string",
                    name
                )));
            }
            _ => {}
        }

        if let Some(readiness) = &resource.readiness {
            check_readiness(name, readiness)?;
        }
    }

    Ok(())
}

fn check_readiness(resource: &str, readiness: &ReadinessDef) -> Result<()> {
    let invalid = |reason: &str| -> Result<()> {
        Err(ConfigError::Validation(format!(
            "Readiness of '{}': {}",
            resource, reason
        )))
    };
    match readiness.check {
        Some(CheckType::Command) if readiness.command.is_none() => {
            invalid("a command check needs a command")
        }
        Some(check) if check != CheckType::Command && readiness.command.is_some() => {
            invalid("command is only valid for command checks")
        }
        Some(check)
            if !matches!(check, CheckType::Tcp | CheckType::Http)
                && readiness.endpoint.is_some() =>
        {
            invalid("endpoint is only valid for tcp and http checks")
        }
        _ if readiness.max_attempts == Some(0) => invalid("max_attempts must be at least 1"),
        _ => Ok(()),
    }
}

impl Config {
    /// Declare everything in a registry, substituting variables from the
    /// process environment
    pub fn to_registry(&self) -> Result<Registry> {
        self.to_registry_with(&EnvVars::from_process())
    }

    /// Declare everything in a registry, substituting variables from `env`.
    ///
    /// Resources are declared in file order.
    pub fn to_registry_with(&self, env: &EnvVars) -> Result<Registry> {
        let mut registry = Registry::new();
        registry.set_mode(self.mode);

        for (name, parameter) in &self.parameters {
            registry.add_parameter(convert_parameter(name, parameter, env)?)?;
        }

        for (name, resource) in &self.resources {
            let kind = convert_kind(name, resource, env)?;
            let config = self.convert_config(resource, env)?;
            registry.declare(name.as_str(), kind, config)?;
        }

        for (name, resource) in &self.resources {
            for producer in &resource.references {
                registry.add_reference(name.as_str(), producer.as_str())?;
            }
            for producer in &resource.wait_for {
                registry.add_wait_for(name.as_str(), producer.as_str())?;
            }
        }

        debug!(
            "Declared {} resource(s) and {} parameter(s)",
            registry.len(),
            self.parameters.len()
        );
        Ok(registry)
    }

    /// Validated app model, substituting variables from the process
    /// environment
    pub fn to_model(&self) -> Result<AppModel> {
        Ok(self.to_registry()?.build()?)
    }

    /// Validated app model, substituting variables from `env`
    pub fn to_model_with(&self, env: &EnvVars) -> Result<AppModel> {
        Ok(self.to_registry_with(env)?.build()?)
    }

    fn convert_config(&self, resource: &ResourceDef, env: &EnvVars) -> Result<ResourceConfig> {
        let mut config = ResourceConfig::new();

        for endpoint in &resource.endpoints {
            config = config.with_endpoint(convert_endpoint(endpoint));
        }
        for (key, value) in &resource.env {
            config = config.with_env(key.as_str(), substitute_env_vars(value, env)?);
        }
        // External resources carry their connection string in the kind
        if !matches!(resource.resource_type, ResourceType::External) {
            if let Some(template) = &resource.connection_string {
                config = config.with_connection_string(substitute_env_vars(template, env)?);
            }
        }
        if let Some(existing) = &resource.existing {
            config = config.with_provisioning(Provisioning::Existing {
                connection_string: substitute_env_vars(existing, env)?,
            });
        }

        config.readiness = convert_readiness(
            resource.readiness.as_ref(),
            self.settings.startup_timeout,
        );
        if let Some(secs) = resource.shutdown_timeout.or(self.settings.shutdown_timeout) {
            config = config.with_shutdown_grace(Duration::from_secs(secs));
        }
        if resource.exclude_from_manifest {
            config = config.excluded_from_manifest();
        }
        Ok(config)
    }
}

fn convert_parameter(name: &str, parameter: &ParameterDef, env: &EnvVars) -> Result<Parameter> {
    let source = match (&parameter.value, &parameter.env, &parameter.store) {
        (Some(value), None, None) => ParameterSource::Value(substitute_env_vars(value, env)?),
        (None, Some(var), None) => ParameterSource::Env(var.clone()),
        (None, None, Some(key)) => ParameterSource::Store { key: key.clone() },
        _ => {
            return Err(ConfigError::Validation(format!(
                "Parameter '{}' must set exactly one of value, env or store",
                name
            )));
        }
    };
    Ok(if parameter.secret {
        Parameter::secret(name, source)
    } else {
        Parameter::new(name, source)
    })
}

fn convert_kind(name: &str, resource: &ResourceDef, env: &EnvVars) -> Result<ResourceKind> {
    Ok(match &resource.resource_type {
        ResourceType::Project {
            binary,
            args,
            working_dir,
        } => ResourceKind::Project {
            binary: substitute_env_vars(binary, env)?,
            args: substitute_all(args, env)?,
            working_dir: working_dir
                .as_deref()
                .map(|dir| substitute_env_vars(dir, env))
                .transpose()?,
        },
        ResourceType::Container {
            image,
            args,
            volumes,
        } => ResourceKind::Container {
            image: substitute_env_vars(image, env)?,
            args: substitute_all(args, env)?,
            volumes: substitute_all(volumes, env)?,
        },
        ResourceType::Database {
            server,
            database_name,
        } => ResourceKind::Database {
            server: server.clone(),
            database_name: database_name.clone().unwrap_or_else(|| name.to_string()),
        },
        ResourceType::External => {
            let template = resource.connection_string.as_deref().ok_or_else(|| {
                ConfigError::Validation(format!(
                    "External resource '{}' needs a connection_string",
                    name
                ))
            })?;
            ResourceKind::External {
                connection_string: substitute_env_vars(template, env)?,
            }
        }
    })
}

fn convert_endpoint(endpoint: &EndpointDef) -> EndpointSpec {
    let mut spec = EndpointSpec::new(endpoint.name.as_str(), endpoint.scheme.as_str());
    spec.port = endpoint.port;
    spec.target_port = endpoint.target_port;
    spec.env = endpoint.env.clone();
    spec
}

fn convert_readiness(
    readiness: Option<&ReadinessDef>,
    startup_timeout: Option<u64>,
) -> ReadinessSpec {
    let mut policy = ProbePolicy::default();
    if let Some(secs) = startup_timeout {
        policy.timeout = Duration::from_secs(secs);
    }
    let Some(readiness) = readiness else {
        return ReadinessSpec {
            check: None,
            policy,
        };
    };

    if let Some(secs) = readiness.timeout {
        policy.timeout = Duration::from_secs(secs);
    }
    if let Some(attempts) = readiness.max_attempts {
        policy.max_attempts = attempts;
    }
    if let Some(ms) = readiness.initial_backoff_ms {
        policy.initial_backoff = Duration::from_millis(ms);
    }
    if let Some(ms) = readiness.max_backoff_ms {
        policy.max_backoff = Duration::from_millis(ms);
    }

    let check = readiness.check.map(|check| match check {
        CheckType::Immediate => ReadinessCheck::Immediate,
        CheckType::Running => ReadinessCheck::Running,
        CheckType::Command => ReadinessCheck::Command {
            command: readiness.command.clone().unwrap_or_default(),
            args: readiness.args.clone(),
        },
        CheckType::Tcp => ReadinessCheck::Tcp {
            endpoint: readiness.endpoint.clone(),
        },
        CheckType::Http => ReadinessCheck::Http {
            endpoint: readiness.endpoint.clone(),
            path: readiness
                .path
                .clone()
                .unwrap_or_else(|| "/health".to_string()),
        },
        CheckType::ContainerHealth => ReadinessCheck::ContainerHealth,
    });

    ReadinessSpec { check, policy }
}
