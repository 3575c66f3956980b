//! Driver configuration loading

use anyhow::{Context, Result};
use orchestrator_lib::DeploymentConfig;

/// Load the deployment configuration.
///
/// An optional `orchestrator.{toml,yaml,json}` file in the working directory
/// is layered under `ORCHESTRATOR_*` environment variables, e.g.
/// `ORCHESTRATOR_TTL_MINUTES=30`.
pub fn load() -> Result<DeploymentConfig> {
    let config = config::Config::builder()
        .add_source(config::File::with_name("orchestrator").required(false))
        .add_source(config::Environment::with_prefix("ORCHESTRATOR").try_parsing(true))
        .build()
        .context("Failed to read orchestrator configuration")?;

    let deployment: DeploymentConfig = config
        .try_deserialize()
        .context("Failed to parse orchestrator configuration")?;
    deployment
        .validate()
        .context("Invalid orchestrator configuration")?;

    Ok(deployment)
}
