//! Reference resolution.
//!
//! Turns a reference edge into the concrete connection information of its
//! producer once the producer is ready: the rendered connection string
//! and the URLs of its endpoints. Resolved references are cached, so every
//! consumer of the same edge sees the same value.

use crate::cache::AsyncCache;
use crate::{
    EndpointTable, Error, ParameterResolver, ReadinessState, ResolvedValue, Result, StateBoard,
};
use app_model::{AppModel, DependencyEdge, Placeholder, ResourceKind, ResourceNode, Template};
use chrono::{DateTime, Utc};
use futures::FutureExt;
use futures::future::BoxFuture;
use indexmap::IndexMap;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Connection information of a producer
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReferenceValue {
    /// Rendered connection string, if the producer declares one
    pub connection_string: Option<ResolvedValue>,
    /// Endpoint name -> URL
    pub endpoints: IndexMap<String, String>,
}

/// A reference edge with its resolved value
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResolvedReference {
    /// The reference edge
    pub edge: DependencyEdge,
    /// Resolved value
    pub value: ReferenceValue,
    /// When the value was resolved
    pub resolved_at: DateTime<Utc>,
}

impl ResolvedReference {
    /// Environment bindings injected into the consumer.
    ///
    /// `ConnectionStrings__<producer>` for the connection string and
    /// `services__<producer>__<endpoint>__0` for each endpoint URL.
    pub fn env_bindings(&self) -> Vec<(String, ResolvedValue)> {
        let producer = &self.edge.producer;
        let mut bindings = Vec::new();
        if let Some(value) = &self.value.connection_string {
            bindings.push((format!("ConnectionStrings__{producer}"), value.clone()));
        }
        for (name, url) in &self.value.endpoints {
            bindings.push((
                format!("services__{producer}__{name}__0"),
                ResolvedValue::plain(url.clone()),
            ));
        }
        bindings
    }
}

/// Resolves references and renders value templates
pub struct ReferenceResolver {
    model: Arc<AppModel>,
    states: StateBoard,
    endpoints: EndpointTable,
    parameters: Arc<ParameterResolver>,
    cache: AsyncCache<DependencyEdge, ResolvedReference>,
}

impl ReferenceResolver {
    /// Create a resolver
    pub fn new(
        model: Arc<AppModel>,
        states: StateBoard,
        endpoints: EndpointTable,
        parameters: Arc<ParameterResolver>,
    ) -> Self {
        Self {
            model,
            states,
            endpoints,
            parameters,
            cache: AsyncCache::new(),
        }
    }

    /// Resolve a reference edge.
    ///
    /// Fails with [`Error::NotReady`] unless the producer is ready. Once
    /// resolved, the same value is returned for the lifetime of the run.
    pub async fn resolve(&self, edge: &DependencyEdge) -> Result<ResolvedReference> {
        self.cache.get_or_try_load(edge, || self.load(edge)).await
    }

    async fn load(&self, edge: &DependencyEdge) -> Result<ResolvedReference> {
        let state = self
            .states
            .state(&edge.producer)
            .ok_or_else(|| Error::ResourceNotFound(edge.producer.clone()))?;
        if state != ReadinessState::Ready {
            return Err(Error::NotReady {
                producer: edge.producer.clone(),
                state,
            });
        }

        let producer = self.node(&edge.producer)?;
        let connection_string = match producer.connection_string_template() {
            Some(template) => Some(self.render(producer, template).await?),
            None => None,
        };
        let endpoints = self
            .endpoints
            .of(&edge.producer)
            .into_iter()
            .map(|(name, endpoint)| (name, endpoint.url()))
            .collect();

        let resolved = ResolvedReference {
            edge: edge.clone(),
            value: ReferenceValue {
                connection_string,
                endpoints,
            },
            resolved_at: Utc::now(),
        };

        debug!(
            "Resolved reference {} -> {}: {:?}",
            edge.consumer, edge.producer, resolved.value
        );
        Ok(resolved)
    }

    /// Render a value template owned by `owner`
    pub async fn render(&self, owner: &ResourceNode, raw: &str) -> Result<ResolvedValue> {
        let template = Template::parse(owner.name(), raw)?;

        let mut values: HashMap<Placeholder, ResolvedValue> = HashMap::new();
        for placeholder in template.placeholders() {
            if !values.contains_key(placeholder) {
                let value = self.lookup(owner, placeholder).await?;
                values.insert(placeholder.clone(), value);
            }
        }

        template.fold(
            ResolvedValue::default(),
            |mut acc, text| {
                acc.push_str(text);
                acc
            },
            |mut acc, placeholder| {
                let value = values.get(placeholder).ok_or_else(|| Error::Resolution {
                    resource: owner.name().to_string(),
                    reason: format!("unresolved expression {placeholder:?}"),
                })?;
                acc.push(value);
                Ok(acc)
            },
        )
    }

    /// Rendered connection string of a resource
    pub fn connection_string<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<ResolvedValue>> {
        async move {
            let node = self.node(name)?;
            let template = node
                .connection_string_template()
                .ok_or_else(|| Error::Resolution {
                    resource: name.to_string(),
                    reason: "no connection string is declared".to_string(),
                })?;
            self.render(node, template).await
        }
        .boxed()
    }

    async fn lookup(
        &self,
        owner: &ResourceNode,
        placeholder: &Placeholder,
    ) -> Result<ResolvedValue> {
        let unresolved = |reason: String| Error::Resolution {
            resource: owner.name().to_string(),
            reason,
        };

        match placeholder {
            Placeholder::Param(name) => self.parameters.resolve(name).await,
            Placeholder::Endpoint { endpoint, field } => {
                let name = match endpoint {
                    Some(name) => name.as_str(),
                    None => owner
                        .primary_endpoint()
                        .map(|ep| ep.name.as_str())
                        .ok_or_else(|| unresolved("no endpoint is declared".to_string()))?,
                };
                let endpoint = self
                    .endpoints
                    .get(owner.name(), name)
                    .ok_or_else(|| unresolved(format!("endpoint '{name}' is not allocated")))?;
                Ok(ResolvedValue::plain(endpoint.field(*field)))
            }
            Placeholder::Server => match owner.kind() {
                ResourceKind::Database { server, .. } => self.connection_string(server).await,
                _ => Err(unresolved("'{server}' outside a database".to_string())),
            },
            Placeholder::Database => match owner.kind() {
                ResourceKind::Database { database_name, .. } => {
                    Ok(ResolvedValue::plain(database_name.clone()))
                }
                _ => Err(unresolved("'{database}' outside a database".to_string())),
            },
        }
    }

    fn node(&self, name: &str) -> Result<&ResourceNode> {
        self.model
            .resource(name)
            .ok_or_else(|| Error::ResourceNotFound(name.to_string()))
    }
}
