//! Engine configuration loader for Taskweave.
//!
//! Reads `taskweave.toml` from a configuration directory and deserializes it
//! into [`EngineConfig`]. Falls back to defaults when the file is missing or
//! malformed.

use std::path::Path;

use anyhow::Context;
use taskweave_types::config::EngineConfig;

/// File name looked up inside the configuration directory.
pub const CONFIG_FILE_NAME: &str = "taskweave.toml";

/// Load engine configuration from `{config_dir}/taskweave.toml`.
///
/// - If the file does not exist, returns [`EngineConfig::default()`].
/// - If the file exists but cannot be read or parsed, logs a warning and
///   returns the default.
/// - Otherwise returns the parsed config, with a parallel bound of zero
///   raised to one.
pub async fn load_engine_config(config_dir: &Path) -> EngineConfig {
    let config_path = config_dir.join(CONFIG_FILE_NAME);

    match tokio::fs::try_exists(&config_path).await {
        Ok(true) => {}
        Ok(false) => {
            tracing::debug!("No {CONFIG_FILE_NAME} found at {}, using defaults", config_path.display());
            return EngineConfig::default();
        }
        Err(err) => {
            tracing::warn!("Failed to stat {}: {err}, using defaults", config_path.display());
            return EngineConfig::default();
        }
    }

    match read_engine_config(&config_path).await {
        Ok(config) => config,
        Err(err) => {
            tracing::warn!("{err:#}, using defaults");
            EngineConfig::default()
        }
    }
}

/// Read and parse a configuration file, failing on any problem.
pub async fn read_engine_config(path: &Path) -> anyhow::Result<EngineConfig> {
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let mut config: EngineConfig = toml::from_str(&content)
        .with_context(|| format!("Failed to parse {}", path.display()))?;
    config.max_parallel_operations = config.max_parallel_operations.max(1);
    Ok(config)
}
