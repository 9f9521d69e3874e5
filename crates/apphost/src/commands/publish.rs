use anyhow::{Context, Result};
use app_model::{ExecutionMode, Manifest};
use apphost_config::{Config, EnvVars};
use std::path::Path;
use tracing::info;

pub fn run(config: &Config, output: Option<&Path>) -> Result<()> {
    let mut registry = config
        .to_registry_with(&EnvVars::from_process())
        .context("Failed to build app model")?;
    registry.set_mode(ExecutionMode::Publish);
    let model = registry.build().context("Failed to build app model")?;

    let manifest = Manifest::from_model(&model).context("Failed to render manifest")?;
    let json = manifest.to_json_pretty()?;

    match output {
        Some(path) => {
            std::fs::write(path, json)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            info!("Wrote manifest for {} resources to {}", model.len(), path.display());
        }
        None => println!("{}", json),
    }
    Ok(())
}
