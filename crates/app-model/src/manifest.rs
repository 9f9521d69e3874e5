//! Publish-mode manifest.
//!
//! A manifest is a pure projection of an [`AppModel`]: one entry per
//! parameter and resource, with value templates rewritten into
//! cross-resource expressions (`{cache.bindings.tcp.host}`,
//! `{pg-password.value}`) that an infrastructure tool can bind later.
//! Secret parameter values are never written.

use crate::{
    AppModel, EdgeKind, EndpointField, ModelError, Parameter, ParameterSource, Placeholder,
    Provisioning, ResourceKind, ResourceNode, Result, Template,
};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Serialized description of the resource graph
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    /// Entries keyed by name: parameters first, then resources
    pub resources: IndexMap<String, ManifestEntry>,
}

/// Network binding of a resource endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestBinding {
    /// URL scheme
    pub scheme: String,
    /// Pinned host port, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    /// Port inside the container, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_port: Option<u16>,
}

/// One parameter or resource in the manifest
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestEntry {
    /// Versioned entry type, e.g. `container.v0`
    #[serde(rename = "type")]
    pub kind: String,
    /// Project binary
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub binary: Option<String>,
    /// Project or container arguments
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    /// Project working directory
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
    /// Container image
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    /// Container volumes
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<String>,
    /// Server resource of a database
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    /// Database name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database_name: Option<String>,
    /// Connection string expression
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_string: Option<String>,
    /// Environment expressions
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub env: IndexMap<String, String>,
    /// Endpoint bindings
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub bindings: IndexMap<String, ManifestBinding>,
    /// Producers referenced by this resource
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub references: Vec<String>,
    /// Producers this resource waits for
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub wait_for: Vec<String>,
    /// `existing` when bound to an existing instance
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provisioning: Option<String>,
    /// Whether a parameter is secret
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub secret: bool,
    /// Literal value of a non-secret parameter
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    /// Where a parameter's value comes from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

impl Manifest {
    /// Project a validated model into a manifest
    pub fn from_model(model: &AppModel) -> Result<Self> {
        let mut resources = IndexMap::new();

        for parameter in model.parameters() {
            resources.insert(parameter.name.clone(), parameter_entry(parameter));
        }

        for node in model.resources() {
            if node.config().exclude_from_manifest {
                continue;
            }
            resources.insert(node.name().to_string(), resource_entry(model, node)?);
        }

        Ok(Self { resources })
    }

    /// Pretty-printed JSON
    pub fn to_json_pretty(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    /// Look up an entry
    pub fn get(&self, name: &str) -> Option<&ManifestEntry> {
        self.resources.get(name)
    }
}

fn parameter_entry(parameter: &Parameter) -> ManifestEntry {
    let value = match &parameter.source {
        ParameterSource::Value(value) if !parameter.secret => Some(value.clone()),
        _ => None,
    };
    ManifestEntry {
        kind: "parameter.v0".to_string(),
        secret: parameter.secret,
        value,
        source: Some(parameter.source.describe()),
        ..Default::default()
    }
}

fn resource_entry(model: &AppModel, node: &ResourceNode) -> Result<ManifestEntry> {
    let mut entry = ManifestEntry {
        kind: format!("{}.v0", node.kind().label()),
        ..Default::default()
    };

    match node.kind() {
        ResourceKind::Project {
            binary,
            args,
            working_dir,
        } => {
            entry.binary = Some(binary.clone());
            entry.args = args.clone();
            entry.working_dir = working_dir.clone();
        }
        ResourceKind::Container {
            image,
            args,
            volumes,
        } => {
            entry.image = Some(image.clone());
            entry.args = args.clone();
            entry.volumes = volumes.clone();
        }
        ResourceKind::Database {
            server,
            database_name,
        } => {
            entry.parent = Some(server.clone());
            entry.database_name = Some(database_name.clone());
        }
        ResourceKind::External { .. } => {}
    }

    if let Provisioning::Existing { .. } = node.config().provisioning {
        entry.provisioning = Some("existing".to_string());
    }

    for endpoint in &node.config().endpoints {
        entry.bindings.insert(
            endpoint.name.clone(),
            ManifestBinding {
                scheme: endpoint.scheme.clone(),
                port: endpoint.port,
                target_port: endpoint.target_port,
            },
        );
    }

    if let Some(template) = node.connection_string_template() {
        entry.connection_string = Some(rewrite(model, node, template)?);
    }
    for (key, template) in &node.config().env {
        entry.env.insert(key.clone(), rewrite(model, node, template)?);
    }

    for edge in node.edges() {
        let list = match edge.kind {
            EdgeKind::Reference => &mut entry.references,
            EdgeKind::WaitFor => &mut entry.wait_for,
        };
        if !list.contains(&edge.producer) {
            list.push(edge.producer.clone());
        }
    }

    Ok(entry)
}

/// Rewrite a value template into manifest expressions
fn rewrite(model: &AppModel, node: &ResourceNode, raw: &str) -> Result<String> {
    let owner = node.name();
    Template::parse(owner, raw)?.render(|placeholder| match placeholder {
        Placeholder::Param(name) => Ok(format!("{{{name}.value}}")),
        Placeholder::Endpoint { endpoint, field } => {
            let endpoint = match endpoint {
                Some(name) => name.as_str(),
                None => match node.primary_endpoint() {
                    Some(ep) => ep.name.as_str(),
                    None => {
                        return Err(ModelError::invalid(
                            owner,
                            "endpoint expression without endpoint",
                        ));
                    }
                },
            };
            Ok(binding_expr(owner, endpoint, *field))
        }
        Placeholder::Server => match node.kind() {
            ResourceKind::Database { server, .. } if model.resource(server).is_some() => {
                Ok(format!("{{{server}.connectionString}}"))
            }
            _ => Err(ModelError::invalid(owner, "'{server}' outside a database")),
        },
        Placeholder::Database => match node.kind() {
            ResourceKind::Database { database_name, .. } => Ok(database_name.clone()),
            _ => Err(ModelError::invalid(owner, "'{database}' outside a database")),
        },
    })
}

fn binding_expr(owner: &str, endpoint: &str, field: EndpointField) -> String {
    format!("{{{owner}.bindings.{endpoint}.{}}}", field.as_str())
}
