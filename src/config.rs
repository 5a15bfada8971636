//! On-disk configuration: the bridge's serial topology, default sensor
//! rates, and logging defaults. Loading this is explicitly out of scope for
//! `rc-core` per spec.md; it lives here in the thin outer shell.

use std::path::Path;

use serde::Deserialize;

/// One serial link the bridge should open at startup.
#[derive(Debug, Clone, Deserialize)]
pub struct LinkConfig {
    pub path: String,
    #[serde(default = "default_baud")]
    pub baud: u32,
    #[serde(default)]
    pub imu: bool,
    #[serde(default)]
    pub mag: bool,
    /// Inclusive `[min, max]` global rotor ids this link drives, if any.
    pub motor_range: Option<(u8, u8)>,
}

fn default_baud() -> u32 {
    115_200
}

#[derive(Debug, Clone, Deserialize)]
pub struct RatesConfig {
    #[serde(default)]
    pub imu: f64,
    #[serde(default)]
    pub mag: f64,
    #[serde(default)]
    pub motor: f64,
    #[serde(default)]
    pub battery: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BatteryConfig {
    #[serde(default = "default_battery_min")]
    pub min: f64,
    #[serde(default = "default_battery_max")]
    pub max: f64,
}

fn default_battery_min() -> f64 {
    14.0
}
fn default_battery_max() -> f64 {
    16.8
}

impl Default for BatteryConfig {
    fn default() -> Self {
        BatteryConfig { min: default_battery_min(), max: default_battery_max() }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BridgeConfig {
    #[serde(default)]
    pub links: Vec<LinkConfig>,
    #[serde(default)]
    pub rates: RatesConfig,
    #[serde(default)]
    pub battery: BatteryConfig,
}

impl Default for RatesConfig {
    fn default() -> Self {
        RatesConfig { imu: 0.0, mag: 0.0, motor: 0.0, battery: 0.0 }
    }
}

impl BridgeConfig {
    /// Loads a config file, falling back to an empty (no-links) config if
    /// it doesn't exist yet -- the CLI's `connect` subcommand can still add
    /// links explicitly in that case.
    pub async fn load(path: &Path) -> anyhow::Result<BridgeConfig> {
        match tokio::fs::read_to_string(path).await {
            Ok(text) => Ok(toml::from_str(&text)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BridgeConfig::default()),
            Err(e) => Err(e.into()),
        }
    }
}
