//! Configuration loading and parsing

use anyhow::{bail, Context, Result};
use bps_event::BridgeConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Main application configuration (loaded from config.toml)
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AppConfig {
    #[serde(default)]
    pub bridge: BridgeConfig,
    #[serde(default)]
    pub bus: BusConfig,
    #[serde(default)]
    pub events: Vec<EventConfig>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct BusConfig {
    #[serde(default)]
    pub kind: BusKind,
    /// Path to the native bus library (only used with `kind = "library"`)
    pub library: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BusKind {
    #[default]
    Simulated,
    Library,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EventConfig {
    pub name: Option<String>,
    pub domain: i32,
    pub code: u32,
    /// Payload slots as `type:value` specs
    #[serde(default)]
    pub data: Vec<String>,
    #[serde(default)]
    pub pinned: bool,
    /// Make the simulated bus refuse the first creation of this event
    #[serde(default)]
    pub fail: bool,
    #[serde(default = "default_count")]
    pub count: usize,
}

fn default_count() -> usize {
    1
}

/// Load configuration from a TOML file
pub fn load_config(path: &Path) -> Result<AppConfig> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {:?}", path))?;

    let config: AppConfig = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {:?}", path))?;

    validate(&config).with_context(|| format!("Invalid config file: {:?}", path))?;
    Ok(config)
}

fn validate(config: &AppConfig) -> Result<()> {
    for (i, event) in config.events.iter().enumerate() {
        if event.data.len() > 3 {
            bail!(
                "event #{} has {} data entries; an event carries at most 3",
                i + 1,
                event.data.len()
            );
        }
        if event.fail && config.bus.kind != BusKind::Simulated {
            bail!("event #{} asks for an injected failure, which needs the simulated bus", i + 1);
        }
    }
    Ok(())
}
