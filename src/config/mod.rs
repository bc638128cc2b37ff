//! # Configuration
//!
//! TOML configuration for the relay, loaded once at startup. Every section except
//! `[meshtastic]` and `[matrix]` may be omitted and falls back to defaults.
//!
//! ```toml
//! [meshtastic]
//! connection_type = "serial"      # serial | ble | tcp
//! serial_port = "/dev/ttyUSB0"
//! meshnet_name = "Downtown Mesh"
//!
//! [matrix]
//! homeserver = "https://matrix.example.org"
//! access_token = "syt_..."
//! bot_user_id = "@meshbot:example.org"
//!
//! [[matrix_rooms]]
//! id = "!abcdef:example.org"
//! meshtastic_channel = 0
//!
//! [plugins.ping]
//! active = true
//!
//! [relay]
//! plugin_timeout_ms = 10000
//!
//! [logging]
//! level = "info"
//! file = "meshrelay.log"
//! ```
//!
//! `meshrelay init` writes [`Config::default`] to disk as a starting point.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tokio::fs;

use crate::error::RelayError;
use crate::meshtastic::{
    ConnectionConfig, ConnectionTuning, TransportKind, TransportTarget,
};
use crate::relay::RoomMapping;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub meshtastic: MeshtasticConfig,
    pub matrix: MatrixConfig,
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub plugins: HashMap<String, PluginConfig>,
    #[serde(default)]
    pub matrix_rooms: Vec<MatrixRoomConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeshtasticConfig {
    #[serde(default = "default_connection_type")]
    pub connection_type: TransportKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serial_port: Option<String>,
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ble_address: Option<String>,
    /// Advertised device name; used when no address is given.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ble_name: Option<String>,
    /// `host` or `host:port` for TCP links.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default = "default_retry_limit")]
    pub retry_limit: u32,
    pub meshnet_name: String,
    #[serde(default = "default_node_cache_file")]
    pub node_cache_file: String,
}

fn default_connection_type() -> TransportKind {
    TransportKind::Serial
}

fn default_baud_rate() -> u32 {
    115200
}

fn default_retry_limit() -> u32 {
    ConnectionConfig::DEFAULT_RETRY_LIMIT
}

fn default_node_cache_file() -> String {
    "data/nodes.json".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatrixConfig {
    pub homeserver: String,
    pub access_token: String,
    pub bot_user_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatrixRoomConfig {
    pub id: String,
    pub meshtastic_channel: u8,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginConfig {
    #[serde(default)]
    pub active: bool,
    /// Lower runs first; unset means 100.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<u32>,
}

/// Queue sizes and timing policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    #[serde(default = "default_dispatch_queue")]
    pub dispatch_queue: usize,
    #[serde(default = "default_relay_queue")]
    pub relay_queue: usize,
    #[serde(default = "default_plugin_timeout_ms")]
    pub plugin_timeout_ms: u64,
    #[serde(default = "default_health_check_interval_secs")]
    pub health_check_interval_secs: u64,
    #[serde(default = "default_probe_timeout_secs")]
    pub probe_timeout_secs: u64,
    #[serde(default = "default_backoff_floor_secs")]
    pub reconnect_backoff_floor_secs: u64,
    #[serde(default = "default_backoff_cap_secs")]
    pub reconnect_backoff_cap_secs: u64,
    /// 0 disables the periodic counter log line.
    #[serde(default = "default_stats_interval_secs")]
    pub stats_interval_secs: u64,
}

fn default_dispatch_queue() -> usize {
    256
}
fn default_relay_queue() -> usize {
    64
}
fn default_plugin_timeout_ms() -> u64 {
    10_000
}
fn default_health_check_interval_secs() -> u64 {
    5
}
fn default_probe_timeout_secs() -> u64 {
    3
}
fn default_backoff_floor_secs() -> u64 {
    10
}
fn default_backoff_cap_secs() -> u64 {
    300
}
fn default_stats_interval_secs() -> u64 {
    300
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            dispatch_queue: default_dispatch_queue(),
            relay_queue: default_relay_queue(),
            plugin_timeout_ms: default_plugin_timeout_ms(),
            health_check_interval_secs: default_health_check_interval_secs(),
            probe_timeout_secs: default_probe_timeout_secs(),
            reconnect_backoff_floor_secs: default_backoff_floor_secs(),
            reconnect_backoff_cap_secs: default_backoff_cap_secs(),
            stats_interval_secs: default_stats_interval_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
        }
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

impl Config {
    /// Load configuration from a TOML file
    pub async fn load(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .map_err(|e| anyhow!("Failed to read config file {}: {}", path, e))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| anyhow!("Failed to parse config file {}: {}", path, e))?;

        Ok(config)
    }

    /// Write the default configuration to `path`
    pub async fn create_default(path: &str) -> Result<()> {
        let config = Config::default();
        let content = toml::to_string_pretty(&config)
            .map_err(|e| anyhow!("Failed to serialize default config: {}", e))?;

        fs::write(path, content)
            .await
            .map_err(|e| anyhow!("Failed to write config file {}: {}", path, e))?;

        Ok(())
    }

    /// Reject settings the relay cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.meshtastic.meshnet_name.trim().is_empty() {
            return Err(anyhow!("meshtastic.meshnet_name must not be empty"));
        }
        if self.matrix.homeserver.trim().is_empty() {
            return Err(anyhow!("matrix.homeserver must not be empty"));
        }
        if self.matrix.bot_user_id.trim().is_empty() {
            return Err(anyhow!("matrix.bot_user_id must not be empty"));
        }
        if let Some(room) = self.matrix_rooms.iter().find(|r| r.id.trim().is_empty()) {
            return Err(anyhow!(
                "matrix_rooms entry for channel {} has an empty id",
                room.meshtastic_channel
            ));
        }
        if self.relay.dispatch_queue == 0 || self.relay.relay_queue == 0 {
            return Err(anyhow!("relay queue sizes must be at least 1"));
        }
        self.connection_config()?;
        Ok(())
    }

    /// Typed connection settings for the configured transport.
    pub fn connection_config(&self) -> std::result::Result<ConnectionConfig, RelayError> {
        let m = &self.meshtastic;
        let target = match m.connection_type {
            TransportKind::Serial => TransportTarget::Serial {
                port: non_empty(&m.serial_port)
                    .ok_or_else(|| RelayError::Config("serial_port is required for serial connections".into()))?
                    .to_string(),
                baud_rate: m.baud_rate,
            },
            TransportKind::Ble => TransportTarget::Ble {
                address: non_empty(&m.ble_address)
                    .or_else(|| non_empty(&m.ble_name))
                    .ok_or_else(|| {
                        RelayError::Config("ble_address or ble_name is required for BLE connections".into())
                    })?
                    .to_string(),
            },
            TransportKind::Tcp => TransportTarget::Tcp {
                host: non_empty(&m.host)
                    .ok_or_else(|| RelayError::Config("host is required for TCP connections".into()))?
                    .to_string(),
            },
        };
        Ok(ConnectionConfig {
            target,
            retry_limit: m.retry_limit,
            meshnet_name: m.meshnet_name.clone(),
        })
    }

    pub fn room_mappings(&self) -> Vec<RoomMapping> {
        self.matrix_rooms
            .iter()
            .map(|r| RoomMapping::new(r.meshtastic_channel, r.id.clone()))
            .collect()
    }

    pub fn tuning(&self) -> ConnectionTuning {
        ConnectionTuning {
            health_interval: Duration::from_secs(self.relay.health_check_interval_secs.max(1)),
            probe_timeout: Duration::from_secs(self.relay.probe_timeout_secs.max(1)),
            backoff_floor: Duration::from_secs(self.relay.reconnect_backoff_floor_secs.max(1)),
            backoff_cap: Duration::from_secs(self.relay.reconnect_backoff_cap_secs),
            ..ConnectionTuning::default()
        }
    }

    pub fn plugin_timeout(&self) -> Duration {
        Duration::from_millis(self.relay.plugin_timeout_ms.max(1))
    }
}

impl Default for Config {
    fn default() -> Self {
        let mut plugins = HashMap::new();
        plugins.insert(
            "ping".to_string(),
            PluginConfig {
                active: true,
                priority: None,
            },
        );
        plugins.insert(
            "nodes".to_string(),
            PluginConfig {
                active: true,
                priority: None,
            },
        );

        Config {
            meshtastic: MeshtasticConfig {
                connection_type: TransportKind::Serial,
                serial_port: Some("/dev/ttyUSB0".to_string()),
                baud_rate: default_baud_rate(),
                ble_address: None,
                ble_name: None,
                host: None,
                retry_limit: default_retry_limit(),
                meshnet_name: "My Meshnet".to_string(),
                node_cache_file: default_node_cache_file(),
            },
            matrix: MatrixConfig {
                homeserver: "https://matrix.example.org".to_string(),
                access_token: "change-me".to_string(),
                bot_user_id: "@meshrelay:example.org".to_string(),
            },
            relay: RelayConfig::default(),
            logging: LoggingConfig {
                level: default_log_level(),
                file: Some("meshrelay.log".to_string()),
            },
            plugins,
            matrix_rooms: vec![MatrixRoomConfig {
                id: "!roomid:example.org".to_string(),
                meshtastic_channel: 0,
            }],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
[meshtastic]
connection_type = "tcp"
host = "meshtastic.local"
meshnet_name = "Downtown"

[matrix]
homeserver = "https://matrix.example.org"
access_token = "token"
bot_user_id = "@bot:example.org"

[[matrix_rooms]]
id = "!a:example.org"
meshtastic_channel = 2

[[matrix_rooms]]
id = "!b:example.org"
meshtastic_channel = 2
"#;

    #[test]
    fn minimal_file_fills_defaults() {
        let config: Config = toml::from_str(MINIMAL).unwrap();
        config.validate().unwrap();
        assert_eq!(config.relay.dispatch_queue, 256);
        assert_eq!(config.relay.plugin_timeout_ms, 10_000);
        assert_eq!(config.meshtastic.retry_limit, 3);
        assert_eq!(config.logging.level, "info");
        assert!(config.plugins.is_empty());

        let conn = config.connection_config().unwrap();
        assert_eq!(
            conn.target,
            TransportTarget::Tcp {
                host: "meshtastic.local".into()
            }
        );
        assert_eq!(config.room_mappings().len(), 2);
        assert_eq!(config.tuning().backoff_cap, Duration::from_secs(300));
    }

    #[test]
    fn missing_target_is_a_config_error() {
        let mut config: Config = toml::from_str(MINIMAL).unwrap();
        config.meshtastic.host = None;
        assert!(matches!(
            config.connection_config(),
            Err(RelayError::Config(_))
        ));
        assert!(config.validate().is_err());
    }

    #[test]
    fn ble_prefers_address_over_name() {
        let mut config: Config = toml::from_str(MINIMAL).unwrap();
        config.meshtastic.connection_type = TransportKind::Ble;
        config.meshtastic.ble_name = Some("Meshtastic_1a2b".into());
        assert_eq!(
            config.connection_config().unwrap().target,
            TransportTarget::Ble {
                address: "Meshtastic_1a2b".into()
            }
        );
        config.meshtastic.ble_address = Some("AA:BB:CC:DD:EE:FF".into());
        assert_eq!(
            config.connection_config().unwrap().target,
            TransportTarget::Ble {
                address: "AA:BB:CC:DD:EE:FF".into()
            }
        );
    }

    #[test]
    fn empty_meshnet_name_rejected() {
        let mut config: Config = toml::from_str(MINIMAL).unwrap();
        config.meshtastic.meshnet_name = " ".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn default_config_serializes_and_validates() {
        let config = Config::default();
        let text = toml::to_string_pretty(&config).unwrap();
        let parsed: Config = toml::from_str(&text).unwrap();
        parsed.validate().unwrap();
        assert!(parsed.plugins["ping"].active);
    }
}
