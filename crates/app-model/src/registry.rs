//! Resource registry: the declaration phase and the finalized model.

use crate::{
    DependencyEdge, DependencyGraph, EdgeKind, ModelError, Parameter, Placeholder, ResourceConfig,
    ResourceKind, ResourceNode, Result, Template,
};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::debug;

/// Whether the app model is run locally or published as a manifest
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Start resources locally
    #[default]
    Run,
    /// Emit a manifest instead of starting anything
    Publish,
}

/// Mutable registry used during the declaration phase.
///
/// Each call validates what it can on its own and leaves the registry
/// unchanged on failure. [`Registry::build`] validates the graph as a whole
/// and closes the declaration phase.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    mode: ExecutionMode,
    resources: IndexMap<String, ResourceNode>,
    parameters: IndexMap<String, Parameter>,
}

impl Registry {
    /// Create an empty registry in run mode
    pub fn new() -> Self {
        Self::default()
    }

    /// Select run or publish mode
    pub fn set_mode(&mut self, mode: ExecutionMode) {
        self.mode = mode;
    }

    /// Current execution mode
    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    /// Declare a resource.
    ///
    /// Database resources get implicit reference and wait-for edges to their
    /// server. The server may be declared later; [`Registry::build`] rejects
    /// a database whose server was never declared.
    pub fn declare(
        &mut self,
        name: impl Into<String>,
        kind: ResourceKind,
        config: ResourceConfig,
    ) -> Result<&ResourceNode> {
        let name = name.into();
        validate_name(&name)?;
        self.ensure_unused(&name)?;
        validate_endpoints(&name, &config)?;

        let mut edges = Vec::new();
        if let ResourceKind::Database { server, .. } = &kind {
            if server == &name {
                return Err(ModelError::Cycle {
                    members: vec![name],
                });
            }
            for kind in [EdgeKind::Reference, EdgeKind::WaitFor] {
                edges.push(DependencyEdge {
                    consumer: name.clone(),
                    producer: server.clone(),
                    kind,
                });
            }
        }

        debug!("Declared {} resource '{}'", kind.label(), name);
        let node = ResourceNode {
            name: name.clone(),
            kind,
            config,
            index: self.resources.len(),
            edges,
        };
        Ok(self.resources.entry(name).or_insert(node))
    }

    /// Declare a parameter
    pub fn add_parameter(&mut self, parameter: Parameter) -> Result<&Parameter> {
        validate_name(&parameter.name)?;
        self.ensure_unused(&parameter.name)?;
        debug!(
            "Declared parameter '{}' (secret: {})",
            parameter.name, parameter.secret
        );
        Ok(self
            .parameters
            .entry(parameter.name.clone())
            .or_insert(parameter))
    }

    /// Add a dependency edge from `consumer` to `producer`.
    ///
    /// Adding an edge that already exists is a no-op.
    pub fn add_edge(
        &mut self,
        consumer: impl Into<String>,
        producer: impl Into<String>,
        kind: EdgeKind,
    ) -> Result<()> {
        let consumer = consumer.into();
        let producer = producer.into();

        if !self.resources.contains_key(&producer) {
            return Err(ModelError::UnknownResource(producer));
        }
        if consumer == producer {
            return Err(ModelError::Cycle {
                members: vec![consumer],
            });
        }
        let Some(node) = self.resources.get_mut(&consumer) else {
            return Err(ModelError::UnknownResource(consumer));
        };

        let edge = DependencyEdge {
            consumer,
            producer,
            kind,
        };
        if !node.edges.contains(&edge) {
            debug!(
                "Added {:?} edge {} -> {}",
                edge.kind, edge.consumer, edge.producer
            );
            node.edges.push(edge);
        }
        Ok(())
    }

    /// Inject `producer`'s connection info into `consumer`
    pub fn add_reference(
        &mut self,
        consumer: impl Into<String>,
        producer: impl Into<String>,
    ) -> Result<()> {
        self.add_edge(consumer, producer, EdgeKind::Reference)
    }

    /// Gate `consumer`'s start on `producer` being ready
    pub fn add_wait_for(
        &mut self,
        consumer: impl Into<String>,
        producer: impl Into<String>,
    ) -> Result<()> {
        self.add_edge(consumer, producer, EdgeKind::WaitFor)
    }

    /// Look up a declared resource
    pub fn get(&self, name: &str) -> Option<&ResourceNode> {
        self.resources.get(name)
    }

    /// Declared resources in declaration order
    pub fn resources(&self) -> impl Iterator<Item = &ResourceNode> {
        self.resources.values()
    }

    /// Declared parameters in declaration order
    pub fn parameters(&self) -> impl Iterator<Item = &Parameter> {
        self.parameters.values()
    }

    /// Number of declared resources
    pub fn len(&self) -> usize {
        self.resources.len()
    }

    /// Whether no resource is declared
    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    /// Dependency graph of what has been declared so far
    pub fn graph(&self) -> DependencyGraph {
        DependencyGraph::from_resources(self.resources.values())
    }

    /// Validate the whole declaration and close the declaration phase
    pub fn build(self) -> Result<AppModel> {
        for node in self.resources.values() {
            if let ResourceKind::Database { server, .. } = node.kind() {
                if !self.resources.contains_key(server) {
                    return Err(ModelError::UnknownResource(server.clone()));
                }
            }
            self.validate_templates(node)?;
            self.validate_references(node)?;
        }

        let graph = self.graph();
        if let Some(members) = graph.find_cycle() {
            return Err(ModelError::Cycle { members });
        }

        debug!(
            "Built app model with {} resources and {} parameters",
            self.resources.len(),
            self.parameters.len()
        );

        Ok(AppModel {
            mode: self.mode,
            resources: self.resources,
            parameters: self.parameters,
            graph,
        })
    }

    fn ensure_unused(&self, name: &str) -> Result<()> {
        if self.resources.contains_key(name) || self.parameters.contains_key(name) {
            return Err(ModelError::DuplicateName(name.to_string()));
        }
        Ok(())
    }

    fn validate_templates(&self, node: &ResourceNode) -> Result<()> {
        let name = node.name();
        let mut templates: Vec<&str> = node.config().env.values().map(String::as_str).collect();
        if let Some(template) = node.connection_string_template() {
            templates.push(template);
        }

        for raw in templates {
            let template = Template::parse(name, raw)?;
            for placeholder in template.placeholders() {
                match placeholder {
                    Placeholder::Param(param) if !self.parameters.contains_key(param) => {
                        return Err(ModelError::UnknownParameter {
                            resource: name.to_string(),
                            parameter: param.clone(),
                        });
                    }
                    Placeholder::Param(_) => {}
                    Placeholder::Endpoint {
                        endpoint: None,
                        field,
                    } if node.primary_endpoint().is_none() => {
                        return Err(ModelError::invalid(
                            name,
                            format!("'{{{}}}' used but no endpoint is declared", field.as_str()),
                        ));
                    }
                    Placeholder::Endpoint {
                        endpoint: Some(endpoint),
                        ..
                    } if node.endpoint(endpoint).is_none() => {
                        return Err(ModelError::invalid(
                            name,
                            format!("template references unknown endpoint '{endpoint}'"),
                        ));
                    }
                    Placeholder::Endpoint { .. } => {}
                    Placeholder::Server | Placeholder::Database
                        if !matches!(node.kind(), ResourceKind::Database { .. }) =>
                    {
                        return Err(ModelError::invalid(
                            name,
                            "'{server}' and '{database}' are only valid for databases",
                        ));
                    }
                    Placeholder::Server | Placeholder::Database => {}
                }
            }
        }
        Ok(())
    }

    fn validate_references(&self, node: &ResourceNode) -> Result<()> {
        for edge in node.references() {
            let Some(producer) = self.resources.get(&edge.producer) else {
                return Err(ModelError::UnknownResource(edge.producer.clone()));
            };
            if producer.connection_string_template().is_none()
                && producer.config().endpoints.is_empty()
            {
                return Err(ModelError::invalid(
                    node.name(),
                    format!(
                        "referenced resource '{}' exposes neither endpoints nor a connection string",
                        producer.name()
                    ),
                ));
            }
        }
        Ok(())
    }
}

fn validate_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if !valid {
        return Err(ModelError::invalid(
            name,
            "names must be non-empty and contain only ASCII letters, digits, '-' or '_'",
        ));
    }
    Ok(())
}

fn validate_endpoints(name: &str, config: &ResourceConfig) -> Result<()> {
    let mut seen = HashSet::new();
    for endpoint in &config.endpoints {
        if !seen.insert(endpoint.name.as_str()) {
            return Err(ModelError::invalid(
                name,
                format!("endpoint '{}' declared twice", endpoint.name),
            ));
        }
    }
    Ok(())
}

/// Immutable, validated app model.
///
/// Produced by [`Registry::build`]; the graph is guaranteed acyclic and
/// every edge and template reference names a declared resource or
/// parameter.
#[derive(Debug, Clone)]
pub struct AppModel {
    mode: ExecutionMode,
    resources: IndexMap<String, ResourceNode>,
    parameters: IndexMap<String, Parameter>,
    graph: DependencyGraph,
}

impl AppModel {
    /// Execution mode
    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    /// Look up a resource
    pub fn resource(&self, name: &str) -> Option<&ResourceNode> {
        self.resources.get(name)
    }

    /// Resources in declaration order
    pub fn resources(&self) -> impl Iterator<Item = &ResourceNode> {
        self.resources.values()
    }

    /// Look up a parameter
    pub fn parameter(&self, name: &str) -> Option<&Parameter> {
        self.parameters.get(name)
    }

    /// Parameters in declaration order
    pub fn parameters(&self) -> impl Iterator<Item = &Parameter> {
        self.parameters.values()
    }

    /// All edges, grouped by consumer in declaration order
    pub fn edges(&self) -> impl Iterator<Item = &DependencyEdge> {
        self.resources.values().flat_map(|node| node.edges())
    }

    /// The dependency graph
    pub fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    /// Number of resources
    pub fn len(&self) -> usize {
        self.resources.len()
    }

    /// Whether the model has no resources
    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }
}
