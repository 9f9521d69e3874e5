//! Secret store values for `store` parameters.
//!
//! `settings.secrets_file` names a YAML map of key to value. The file is
//! read when the app runs; it never appears in the published manifest.

use crate::{Config, ConfigError, Result};
use indexmap::IndexMap;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Load the secrets file of `config`, resolved against the directory of
/// `config_path`. Empty when no file is configured.
pub fn load_secrets(config: &Config, config_path: &Path) -> Result<IndexMap<String, String>> {
    let Some(path) = config.secrets_path(config_path) else {
        return Ok(IndexMap::new());
    };

    debug!("Loading secrets from {}", path.display());
    let content = std::fs::read_to_string(&path)?;
    let secrets: Option<IndexMap<String, String>> = serde_yaml::from_str(&content)?;
    Ok(secrets.unwrap_or_default())
}

impl Config {
    /// Location of the secrets file, if one is configured
    pub fn secrets_path(&self, config_path: &Path) -> Option<PathBuf> {
        let file = self.settings.secrets_file.as_ref()?;
        let base = config_path.parent().unwrap_or_else(|| Path::new(""));
        Some(base.join(file))
    }

    /// Store keys read by parameters but absent from `secrets`
    pub fn missing_secrets(&self, secrets: &IndexMap<String, String>) -> Vec<String> {
        self.parameters
            .values()
            .filter_map(|parameter| parameter.store.as_ref())
            .filter(|key| !secrets.contains_key(*key))
            .cloned()
            .collect()
    }

    /// Fail unless every store key is present in `secrets`
    pub fn check_secrets(&self, secrets: &IndexMap<String, String>) -> Result<()> {
        let missing = self.missing_secrets(secrets);
        if missing.is_empty() {
            return Ok(());
        }
        Err(ConfigError::Validation(format!(
            "Secret store keys not found: {}",
            missing.join(", ")
        )))
    }
}
