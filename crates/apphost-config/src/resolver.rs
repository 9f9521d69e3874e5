//! Environment variable substitution: `${VAR}` and `${VAR:-default}`.
//!
//! Substitution happens once, when the file is turned into a registry.
//! Single-brace value templates such as `{params.x}` or `{port}` are left
//! alone; they are resolved by the orchestrator when a resource starts.

use crate::{ConfigError, Result};
use regex::Regex;
use std::collections::HashMap;
use std::sync::LazyLock;

static ENV_VAR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::-([^}]*))?\}").expect("env var pattern is valid")
});

/// Variables available for substitution
#[derive(Debug, Clone, Default)]
pub struct EnvVars {
    vars: HashMap<String, String>,
}

impl EnvVars {
    /// Snapshot of the process environment
    pub fn from_process() -> Self {
        Self {
            vars: std::env::vars().collect(),
        }
    }

    /// Add or override a variable
    pub fn set(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.vars.insert(key.into(), value.into());
        self
    }

    fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for EnvVars {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            vars: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

/// Substitute `${VAR}` and `${VAR:-default}` in `input`.
///
/// Every variable without a value or default is reported in one
/// [`ConfigError::EnvVarNotFound`].
pub fn substitute_env_vars(input: &str, env: &EnvVars) -> Result<String> {
    let mut missing = Vec::new();
    let result = ENV_VAR.replace_all(input, |caps: &regex::Captures<'_>| {
        let name = &caps[1];
        match (env.get(name), caps.get(2)) {
            (Some(value), _) => value.to_string(),
            (None, Some(default)) => default.as_str().to_string(),
            (None, None) => {
                missing.push(name.to_string());
                String::new()
            }
        }
    });

    if !missing.is_empty() {
        return Err(ConfigError::EnvVarNotFound(missing.join(", ")));
    }
    Ok(result.into_owned())
}

/// Substitute every string in `values`
pub(crate) fn substitute_all(values: &[String], env: &EnvVars) -> Result<Vec<String>> {
    values
        .iter()
        .map(|value| substitute_env_vars(value, env))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env() -> EnvVars {
        [("HOME", "/home/app"), ("EMPTY", "")].into_iter().collect()
    }

    #[test]
    fn test_env_var_substitution() {
        assert_eq!(substitute_env_vars("${HOME}", &env()).unwrap(), "/home/app");
        assert_eq!(
            substitute_env_vars("prefix-${HOME}-suffix", &env()).unwrap(),
            "prefix-/home/app-suffix"
        );
        // Set but empty is still set
        assert_eq!(substitute_env_vars("${EMPTY:-fallback}", &env()).unwrap(), "");
    }

    #[test]
    fn test_env_var_with_default() {
        assert_eq!(
            substitute_env_vars("${MISSING:-default_value}", &env()).unwrap(),
            "default_value"
        );
        assert_eq!(substitute_env_vars("${MISSING:-}", &env()).unwrap(), "");
        assert_eq!(
            substitute_env_vars("${HOME:-unused}", &env()).unwrap(),
            "/home/app"
        );
    }

    #[test]
    fn test_missing_vars_are_all_reported() {
        match substitute_env_vars("${FIRST}/${HOME}/${SECOND}", &env()) {
            Err(ConfigError::EnvVarNotFound(names)) => assert_eq!(names, "FIRST, SECOND"),
            other => panic!("Expected EnvVarNotFound, got {other:?}"),
        }
    }

    #[test]
    fn test_value_templates_are_left_alone() {
        let input = "Host={host};Port={port};Password={params.db-password};User=${USER:-app}";
        assert_eq!(
            substitute_env_vars(input, &env()).unwrap(),
            "Host={host};Port={port};Password={params.db-password};User=app"
        );
    }
}
