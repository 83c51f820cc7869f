//! CLI overrides layered onto `rcc_core::Config`.
//!
//! Supports loading the device config from a YAML file (via
//! `rcc_core::Config::load`, which already falls back to defaults for any
//! field the file omits) with a handful of environment/CLI overrides for
//! the values most commonly pinned per-deployment.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

/// Loads `rcc_core::Config` from `path` (or defaults if absent), then
/// applies environment-variable overrides.
pub fn load_config(path: Option<&Path>) -> Result<rcc_core::Config> {
    let mut config = match path {
        Some(path) => rcc_core::Config::load(path)
            .map_err(|e| anyhow::anyhow!(e))
            .with_context(|| format!("Failed to load config file: {}", path.display()))?,
        None => rcc_core::Config::default(),
    };

    apply_env_overrides(&mut config);
    config.validate().map_err(|e| anyhow::anyhow!(e))?;
    Ok(config)
}

fn apply_env_overrides(config: &mut rcc_core::Config) {
    if let Ok(val) = std::env::var("RCC_DEVICE_ID") {
        config.device_id = val;
    }
    if let Ok(val) = std::env::var("RCC_BROKER_HOST") {
        config.broker.host = val;
    }
    if let Ok(val) = std::env::var("RCC_BROKER_PORT") {
        if let Ok(port) = val.parse() {
            config.broker.port = port;
        }
    }
    if let Ok(val) = std::env::var("RCC_DATA_DIR") {
        config.data_dir = PathBuf::from(val);
    }
}
