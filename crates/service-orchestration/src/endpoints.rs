//! Endpoint allocation.

use crate::Result;
use app_model::{EndpointField, EndpointSpec};
use indexmap::IndexMap;
use serde::Serialize;
use std::collections::HashMap;
use std::net::{Ipv4Addr, TcpListener};
use std::sync::{Arc, PoisonError, RwLock};

const LOCAL_HOST: &str = "localhost";

/// An endpoint with a concrete host port
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AllocatedEndpoint {
    /// Endpoint name
    pub name: String,
    /// URL scheme
    pub scheme: String,
    /// Host name
    pub host: String,
    /// Host port
    pub port: u16,
    /// Port inside the container, if any
    pub target_port: Option<u16>,
}

impl AllocatedEndpoint {
    /// Allocate a host port for `spec`, asking the OS for a free one if the
    /// spec does not pin it
    pub fn allocate(spec: &EndpointSpec) -> Result<Self> {
        let port = match spec.port {
            Some(port) => port,
            None => free_port()?,
        };
        Ok(Self {
            name: spec.name.clone(),
            scheme: spec.scheme.clone(),
            host: LOCAL_HOST.to_string(),
            port,
            target_port: spec.target_port,
        })
    }

    /// `scheme://host:port`
    pub fn url(&self) -> String {
        format!("{}://{}:{}", self.scheme, self.host, self.port)
    }

    /// Value of a template field
    pub fn field(&self, field: EndpointField) -> String {
        match field {
            EndpointField::Host => self.host.clone(),
            EndpointField::Port => self.port.to_string(),
            EndpointField::Scheme => self.scheme.clone(),
            EndpointField::Url => self.url(),
        }
    }
}

fn free_port() -> std::io::Result<u16> {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))?;
    Ok(listener.local_addr()?.port())
}

/// Endpoints allocated for each started resource
#[derive(Debug, Clone, Default)]
pub struct EndpointTable {
    inner: Arc<RwLock<HashMap<String, IndexMap<String, AllocatedEndpoint>>>>,
}

impl EndpointTable {
    /// Record the endpoints of a resource
    pub fn insert(&self, resource: &str, endpoints: IndexMap<String, AllocatedEndpoint>) {
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(resource.to_string(), endpoints);
    }

    /// All endpoints of a resource
    pub fn of(&self, resource: &str) -> IndexMap<String, AllocatedEndpoint> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(resource)
            .cloned()
            .unwrap_or_default()
    }

    /// One endpoint of a resource
    pub fn get(&self, resource: &str, endpoint: &str) -> Option<AllocatedEndpoint> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(resource)
            .and_then(|endpoints| endpoints.get(endpoint))
            .cloned()
    }
}
