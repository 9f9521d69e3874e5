//! Configuration parameters.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Where a parameter's value comes from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParameterSource {
    /// Literal value
    Value(String),
    /// Environment variable of the orchestrator process
    Env(String),
    /// Key in an external secret store
    Store {
        /// Lookup key
        key: String,
    },
}

impl ParameterSource {
    /// Description safe to print: never contains the value itself
    pub fn describe(&self) -> String {
        match self {
            ParameterSource::Value(_) => "value".to_string(),
            ParameterSource::Env(var) => format!("env:{var}"),
            ParameterSource::Store { key } => format!("store:{key}"),
        }
    }
}

/// A named value used while resolving resource configuration.
///
/// Parameters are not part of the runtime graph. Secret parameters are
/// never logged and never written to the manifest.
#[derive(Clone, PartialEq, Eq)]
pub struct Parameter {
    /// Unique name
    pub name: String,
    /// Whether the value is a secret
    pub secret: bool,
    /// Value source
    pub source: ParameterSource,
}

impl Parameter {
    /// Non-secret parameter
    pub fn new(name: impl Into<String>, source: ParameterSource) -> Self {
        Self {
            name: name.into(),
            secret: false,
            source,
        }
    }

    /// Secret parameter
    pub fn secret(name: impl Into<String>, source: ParameterSource) -> Self {
        Self {
            name: name.into(),
            secret: true,
            source,
        }
    }
}

impl fmt::Debug for Parameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = f.debug_struct("Parameter");
        out.field("name", &self.name).field("secret", &self.secret);
        match &self.source {
            ParameterSource::Value(_) if self.secret => {
                out.field("source", &format_args!("Value(******)"))
            }
            source => out.field("source", source),
        };
        out.finish()
    }
}
