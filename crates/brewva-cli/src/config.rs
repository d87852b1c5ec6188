use std::path::Path;

use anyhow::{Context, Result};
use brewva_channels::telegram::TelegramChannelConfig;
use brewva_core::{CoordinatorLimits, GatewayConfig};
use brewva_runtime::RuntimePoolConfig;
use serde::{Deserialize, Serialize};

/// Service configuration file (`brewva.yaml`). Every section has defaults,
/// so a missing file is a valid, if locked-down, configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct BrewvaConfig {
    pub gateway: GatewayConfig,
    pub limits: CoordinatorLimits,
    pub runtime_pool: RuntimePoolConfig,
    pub forbid_self_a2a: bool,
    pub channels: ChannelsConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct ChannelsConfig {
    pub telegram: TelegramChannelConfig,
}

pub fn load_config(path: &Path) -> Result<BrewvaConfig> {
    if !path.exists() {
        return Ok(BrewvaConfig::default());
    }
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading config file {}", path.display()))?;
    serde_yaml::from_str(&raw).with_context(|| format!("parsing config file {}", path.display()))
}
