//! Bridge configuration.
//!
//! Loaded from a TOML file. Mesh credentials are mandatory; everything
//! else has defaults matching the vendor ecosystem.

use std::fs;
use std::path::Path;

use anyhow::{ensure, Context, Result};
use serde::Deserialize;

use crate::catalog::{CatalogResolver, DeviceType, ProductInfo};

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Mesh name, as configured in the vendor app. At most 16 bytes.
    pub mesh_name: String,
    /// Mesh password. At most 16 bytes.
    pub mesh_password: String,

    /// MAC prefix of mesh peripherals.
    #[serde(default = "default_address_prefix")]
    pub address_prefix: String,

    /// Weakest advertisement the scheduler will still connect to.
    #[serde(default = "default_min_rssi")]
    pub min_rssi: i16,

    /// Mesh ids to manage; empty = all.
    #[serde(default)]
    pub allowed_mesh_ids: Vec<u16>,

    /// MAC addresses to connect to; empty = all.
    #[serde(default)]
    pub allowed_macs: Vec<String>,

    /// Number of concurrent BLE connections.
    #[serde(default = "default_connection_slots")]
    pub connection_slots: usize,

    /// Minimum gap between frames written on one connection.
    #[serde(default = "default_pacing_interval_ms")]
    pub pacing_interval_ms: u64,

    pub mqtt: MqttConfig,

    #[serde(default)]
    pub device_catalog: Vec<CatalogEntryConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MqttConfig {
    pub host: String,
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
    #[serde(default = "default_client_id")]
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Prefix of every state/command topic.
    #[serde(default = "default_topic_prefix")]
    pub topic_prefix: String,
    /// Home-Assistant discovery prefix.
    #[serde(default = "default_discovery_prefix")]
    pub discovery_prefix: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CatalogEntryConfig {
    pub device_type: DeviceType,
    pub product_id: u8,
    pub name: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub manufacturer: String,
    #[serde(default)]
    pub icon: String,
}

fn default_address_prefix() -> String {
    "A4:C1".to_string()
}

fn default_min_rssi() -> i16 {
    -90
}

fn default_connection_slots() -> usize {
    3
}

fn default_pacing_interval_ms() -> u64 {
    180
}

fn default_mqtt_port() -> u16 {
    1883
}

fn default_client_id() -> String {
    "awox-bridge".to_string()
}

fn default_topic_prefix() -> String {
    "awox".to_string()
}

fn default_discovery_prefix() -> String {
    "homeassistant".to_string()
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let raw = fs::read_to_string(path.as_ref())
            .with_context(|| format!("failed to read config file {}", path.as_ref().display()))?;
        let config: Config = toml::from_str(&raw).context("failed to parse config TOML")?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        ensure!(!self.mesh_name.is_empty(), "mesh_name must not be empty");
        ensure!(
            self.mesh_name.len() <= 16,
            "mesh_name exceeds 16 bytes"
        );
        ensure!(
            self.mesh_password.len() <= 16,
            "mesh_password exceeds 16 bytes"
        );
        ensure!(
            (1..=3).contains(&self.connection_slots),
            "connection_slots must be between 1 and 3"
        );
        self.prefix_bytes()?;
        Ok(())
    }

    /// The vendor MAC prefix as raw bytes, e.g. `A4:C1` -> `[0xA4, 0xC1]`.
    pub fn prefix_bytes(&self) -> Result<[u8; 2]> {
        let parts: Vec<&str> = self.address_prefix.split(':').collect();
        ensure!(
            parts.len() == 2,
            "address_prefix must be two colon-separated hex bytes"
        );
        let hi = u8::from_str_radix(parts[0], 16).context("invalid address_prefix")?;
        let lo = u8::from_str_radix(parts[1], 16).context("invalid address_prefix")?;
        Ok([hi, lo])
    }

    pub fn catalog(&self) -> CatalogResolver {
        CatalogResolver::new(self.device_catalog.iter().map(|entry| ProductInfo {
            product_id: entry.product_id,
            name: entry.name.clone(),
            model: entry.model.clone(),
            manufacturer: entry.manufacturer.clone(),
            icon: entry.icon.clone(),
            capabilities: entry.device_type.capabilities(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const MINIMAL: &str = r#"
mesh_name = "meshA"
mesh_password = "p"

[mqtt]
host = "localhost"
"#;

    #[test]
    fn minimal_config_gets_defaults() {
        let config: Config = toml::from_str(MINIMAL).unwrap();
        config.validate().unwrap();

        assert_eq!(config.address_prefix, "A4:C1");
        assert_eq!(config.min_rssi, -90);
        assert_eq!(config.connection_slots, 3);
        assert_eq!(config.pacing_interval_ms, 180);
        assert!(config.allowed_mesh_ids.is_empty());
        assert_eq!(config.mqtt.port, 1883);
        assert_eq!(config.mqtt.topic_prefix, "awox");
        assert_eq!(config.mqtt.discovery_prefix, "homeassistant");
        assert_eq!(config.prefix_bytes().unwrap(), [0xA4, 0xC1]);
    }

    #[test]
    fn load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(MINIMAL.as_bytes()).unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.mesh_name, "meshA");
    }

    #[test]
    fn rejects_long_credentials() {
        let raw = MINIMAL.replace("meshA", &"x".repeat(17));
        let config: Config = toml::from_str(&raw).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_unknown_keys() {
        let raw = MINIMAL.replace("mesh_name = \"meshA\"", "mesh_name = \"meshA\"\nbogus = 1");
        assert!(toml::from_str::<Config>(&raw).is_err());
    }

    #[test]
    fn rejects_bad_slot_count() {
        let raw = MINIMAL.replace(
            "mesh_name = \"meshA\"",
            "mesh_name = \"meshA\"\nconnection_slots = 9",
        );
        let config: Config = toml::from_str(&raw).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn catalog_entries_resolve() {
        let raw = format!(
            "{}\n[[device_catalog]]\ndevice_type = \"rgb\"\nproduct_id = 0x13\nname = \"SmartLIGHT Color Mesh 9\"\nmodel = \"SMLm_C9\"\nmanufacturer = \"AwoX\"\n",
            MINIMAL
        );
        let config: Config = toml::from_str(&raw).unwrap();
        let catalog = config.catalog();

        let info = catalog.resolve(0x13);
        assert_eq!(info.model, "SMLm_C9");
        assert!(info.capabilities.color);
    }
}
