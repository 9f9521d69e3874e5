//! Resolved configuration values with a redacted form.

use serde::{Serialize, Serializer};
use std::fmt;

const REDACTED: &str = "******";

/// A concrete value handed to a resource.
///
/// Keeps the real value next to a redacted rendering in which every secret
/// part is masked. `Debug`, `Display` and serialization all use the redacted
/// rendering; only [`ResolvedValue::expose`] returns the real value.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct ResolvedValue {
    value: String,
    redacted: String,
    secret: bool,
}

impl ResolvedValue {
    /// A value that may be logged
    pub fn plain(value: impl Into<String>) -> Self {
        let value = value.into();
        Self {
            redacted: value.clone(),
            value,
            secret: false,
        }
    }

    /// A value that must never be logged
    pub fn secret(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            redacted: REDACTED.to_string(),
            secret: true,
        }
    }

    /// The real value, for handing to the resource
    pub fn expose(&self) -> &str {
        &self.value
    }

    /// The value with secrets masked
    pub fn redacted(&self) -> &str {
        &self.redacted
    }

    /// Whether any part of the value is secret
    pub fn is_secret(&self) -> bool {
        self.secret
    }

    /// Append literal text
    pub fn push_str(&mut self, text: &str) {
        self.value.push_str(text);
        self.redacted.push_str(text);
    }

    /// Append another value, keeping its redaction
    pub fn push(&mut self, other: &ResolvedValue) {
        self.value.push_str(&other.value);
        self.redacted.push_str(&other.redacted);
        self.secret |= other.secret;
    }
}

impl fmt::Debug for ResolvedValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ResolvedValue").field(&self.redacted).finish()
    }
}

impl fmt::Display for ResolvedValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.redacted)
    }
}

impl Serialize for ResolvedValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.redacted)
    }
}
