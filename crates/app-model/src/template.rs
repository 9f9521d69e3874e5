//! Value templates.
//!
//! Environment bindings and connection strings are templates with
//! single-brace expressions that are filled in at startup:
//!
//! - `{host}`, `{port}`, `{scheme}`, `{url}`: the owner's first endpoint
//! - `{endpoints.<name>.host|port|scheme|url}`: a named endpoint
//! - `{params.<name>}`: a parameter value
//! - `{server}`, `{database}`: server connection string and database name
//!   (database resources only)
//!
//! Text outside a well-formed expression is kept literally.

use crate::{ModelError, Result};
use regex::Regex;
use std::sync::LazyLock;

static EXPRESSION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{([A-Za-z0-9_.\-]+)\}").expect("expression pattern is valid")
});

/// Field of an endpoint referenced from a template
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndpointField {
    /// Host name
    Host,
    /// Port number
    Port,
    /// URL scheme
    Scheme,
    /// `scheme://host:port`
    Url,
}

impl EndpointField {
    fn parse(field: &str) -> Option<Self> {
        match field {
            "host" => Some(EndpointField::Host),
            "port" => Some(EndpointField::Port),
            "scheme" => Some(EndpointField::Scheme),
            "url" => Some(EndpointField::Url),
            _ => None,
        }
    }

    /// Name as written in templates
    pub fn as_str(&self) -> &'static str {
        match self {
            EndpointField::Host => "host",
            EndpointField::Port => "port",
            EndpointField::Scheme => "scheme",
            EndpointField::Url => "url",
        }
    }
}

/// A single expression inside a template
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Placeholder {
    /// Field of an endpoint; `None` means the owner's first endpoint
    Endpoint {
        /// Endpoint name
        endpoint: Option<String>,
        /// Referenced field
        field: EndpointField,
    },
    /// Parameter value
    Param(String),
    /// Connection string of a database's server
    Server,
    /// Name of a database
    Database,
}

impl Placeholder {
    fn parse(expr: &str) -> Option<Self> {
        if let Some(field) = EndpointField::parse(expr) {
            return Some(Placeholder::Endpoint {
                endpoint: None,
                field,
            });
        }
        match expr {
            "server" => return Some(Placeholder::Server),
            "database" => return Some(Placeholder::Database),
            _ => {}
        }
        if let Some(name) = expr.strip_prefix("params.") {
            return (!name.is_empty()).then(|| Placeholder::Param(name.to_string()));
        }
        let rest = expr.strip_prefix("endpoints.")?;
        let (endpoint, field) = rest.rsplit_once('.')?;
        if endpoint.is_empty() {
            return None;
        }
        Some(Placeholder::Endpoint {
            endpoint: Some(endpoint.to_string()),
            field: EndpointField::parse(field)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Expr(Placeholder),
}

/// A parsed value template
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    segments: Vec<Segment>,
}

impl Template {
    /// Parse a template; `owner` is only used for error messages
    pub fn parse(owner: &str, input: &str) -> Result<Self> {
        let mut segments = Vec::new();
        let mut last = 0;

        for cap in EXPRESSION.captures_iter(input) {
            let Some(whole) = cap.get(0) else { continue };
            let expr = &cap[1];
            let placeholder = Placeholder::parse(expr).ok_or_else(|| {
                ModelError::invalid(owner, format!("unknown template expression '{{{expr}}}'"))
            })?;

            if whole.start() > last {
                segments.push(Segment::Literal(input[last..whole.start()].to_string()));
            }
            segments.push(Segment::Expr(placeholder));
            last = whole.end();
        }

        if last < input.len() {
            segments.push(Segment::Literal(input[last..].to_string()));
        }

        Ok(Self { segments })
    }

    /// All expressions in the template, in order
    pub fn placeholders(&self) -> impl Iterator<Item = &Placeholder> {
        self.segments.iter().filter_map(|segment| match segment {
            Segment::Expr(placeholder) => Some(placeholder),
            Segment::Literal(_) => None,
        })
    }

    /// Render the template, folding each piece into an accumulator.
    ///
    /// Literal text is passed to `literal`; each expression is passed to
    /// `expr`, which may fail.
    pub fn fold<A, E>(
        &self,
        init: A,
        mut literal: impl FnMut(A, &str) -> A,
        mut expr: impl FnMut(A, &Placeholder) -> std::result::Result<A, E>,
    ) -> std::result::Result<A, E> {
        let mut acc = init;
        for segment in &self.segments {
            acc = match segment {
                Segment::Literal(text) => literal(acc, text),
                Segment::Expr(placeholder) => expr(acc, placeholder)?,
            };
        }
        Ok(acc)
    }

    /// Render the template into a plain string
    pub fn render<E>(
        &self,
        mut lookup: impl FnMut(&Placeholder) -> std::result::Result<String, E>,
    ) -> std::result::Result<String, E> {
        self.fold(
            String::new(),
            |mut out, text| {
                out.push_str(text);
                out
            },
            |mut out, placeholder| {
                out.push_str(&lookup(placeholder)?);
                Ok(out)
            },
        )
    }
}
