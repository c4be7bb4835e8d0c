//! Configuration types for the XBee gateway
//!
//! This module provides configuration structures for the serial link,
//! the radio module address table, node discovery and telemetry reporting.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::codec::ApiMode;
use crate::error::{Result, XbeeError};
use crate::frame::{Addr64, NodeKey};

/// Default baud rate of the coordinator's serial link
pub const DEFAULT_BAUD_RATE: u32 = 115200;

/// Default serial read timeout
pub const DEFAULT_TIMEOUT_MS: u64 = 10000;

/// Default number of Node Discovery re-broadcasts
pub const DEFAULT_DISCOVERY_RETRIES: u32 = 1;

/// Default Node Discovery response window
pub const DEFAULT_DISCOVERY_WINDOW_MS: u64 = 8000;

/// Main configuration for the gateway
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WsnConfig {
    /// Serial link to the coordinator
    #[serde(default)]
    pub interface: InterfaceConfig,

    /// Radio modules
    #[serde(default)]
    pub network: NetworkConfig,

    /// Node discovery settings
    #[serde(default)]
    pub discovery: DiscoveryConfig,

    /// Telemetry reporting
    #[serde(default)]
    pub telemetry: TelemetryConfig,

    /// Reconnection settings
    #[serde(default)]
    pub reconnect: ReconnectConfig,

    /// Actuator output (D4) to restore on startup, `true` = high
    #[serde(default)]
    pub restore_outputs: BTreeMap<NodeKey, bool>,
}

impl WsnConfig {
    /// Load configuration from a JSON file
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let config: WsnConfig = serde_json::from_str(&text)
            .map_err(|e| XbeeError::InvalidConfig(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints
    pub fn validate(&self) -> Result<()> {
        let mut keys = HashSet::new();
        let mut addresses = HashSet::new();

        for entry in self.network.all_entries() {
            if !keys.insert(&entry.key) {
                return Err(XbeeError::InvalidConfig(format!(
                    "duplicate node key {}",
                    entry.key
                )));
            }
            if !addresses.insert(entry.addr64) {
                return Err(XbeeError::InvalidConfig(format!(
                    "duplicate 64-bit address {}",
                    entry.addr64
                )));
            }
        }

        if let Some(monitor) = &self.network.power_monitor {
            if !self.network.is_field_node(monitor) {
                return Err(XbeeError::InvalidConfig(format!(
                    "power monitor {} is not a field node",
                    monitor
                )));
            }
        }

        if let Some(key) = self
            .restore_outputs
            .keys()
            .find(|key| !self.network.is_field_node(key))
        {
            return Err(XbeeError::InvalidConfig(format!(
                "output restore entry for unknown node {}",
                key
            )));
        }

        Ok(())
    }
}

/// Serial link configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum InterfaceConfig {
    /// Serial port attached to the coordinator
    Serial {
        /// Path to serial port (e.g., /dev/ttyO2, /dev/ttyUSB0); detected when absent
        #[serde(default)]
        port: Option<PathBuf>,
        /// Baud rate (default: 115200)
        #[serde(default = "default_baud_rate")]
        baud_rate: u32,
        /// API mode of the coordinator firmware
        #[serde(default)]
        api_mode: ApiMode,
    },
}

fn default_baud_rate() -> u32 {
    DEFAULT_BAUD_RATE
}

impl Default for InterfaceConfig {
    fn default() -> Self {
        InterfaceConfig::Serial {
            port: None,
            baud_rate: DEFAULT_BAUD_RATE,
            api_mode: ApiMode::Escaped,
        }
    }
}

/// One radio module
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeEntry {
    /// Logical key
    pub key: NodeKey,
    /// 64-bit hardware address
    pub addr64: Addr64,
}

impl NodeEntry {
    /// Create an entry
    pub fn new(key: impl Into<String>, addr64: u64) -> Self {
        Self {
            key: NodeKey::new(key),
            addr64: Addr64(addr64),
        }
    }
}

/// Radio module address table
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// The module attached to the gateway
    pub coordinator: NodeEntry,

    /// Field modules
    pub nodes: Vec<NodeEntry>,

    /// Field node whose AD0 input carries the current-clamp reading
    #[serde(default)]
    pub power_monitor: Option<NodeKey>,
}

impl NetworkConfig {
    /// Coordinator followed by the field nodes
    pub fn all_entries(&self) -> impl Iterator<Item = &NodeEntry> {
        std::iter::once(&self.coordinator).chain(self.nodes.iter())
    }

    /// Whether `key` names a field node
    pub fn is_field_node(&self, key: &NodeKey) -> bool {
        self.nodes.iter().any(|n| n.key == *key)
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            coordinator: NodeEntry::new("xb0", 0x0013_A200_40AF_B72D),
            nodes: vec![
                NodeEntry::new("xb1", 0x0013_A200_40B3_2D72),
                NodeEntry::new("xb2", 0x0013_A200_40B3_2D6C),
            ],
            power_monitor: None,
        }
    }
}

/// Node discovery settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// Re-broadcasts after the first window expires
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// How long to wait for responses after each broadcast
    #[serde(with = "humantime_serde", default = "default_window")]
    pub window: Duration,
}

fn default_max_retries() -> u32 {
    DEFAULT_DISCOVERY_RETRIES
}

fn default_window() -> Duration {
    Duration::from_millis(DEFAULT_DISCOVERY_WINDOW_MS)
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_DISCOVERY_RETRIES,
            window: default_window(),
        }
    }
}

/// Telemetry reporting settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Interval between averaged temperature reports
    #[serde(with = "humantime_serde", default = "default_report_interval")]
    pub report_interval: Duration,
}

fn default_report_interval() -> Duration {
    Duration::from_secs(30)
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            report_interval: default_report_interval(),
        }
    }
}

/// Reconnection behavior configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectConfig {
    /// Enable automatic reconnection
    #[serde(default = "default_auto_reconnect")]
    pub enabled: bool,

    /// Initial delay before first reconnection attempt
    #[serde(with = "humantime_serde", default = "default_initial_delay")]
    pub initial_delay: Duration,

    /// Maximum delay between reconnection attempts
    #[serde(with = "humantime_serde", default = "default_max_delay")]
    pub max_delay: Duration,

    /// Maximum number of reconnection attempts (0 = infinite)
    #[serde(default)]
    pub max_attempts: u32,
}

fn default_auto_reconnect() -> bool {
    true
}

fn default_initial_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(60)
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            max_attempts: 0, // Infinite
        }
    }
}

/// Builder for WsnConfig
#[derive(Debug, Default)]
pub struct WsnConfigBuilder {
    config: WsnConfig,
}

impl WsnConfigBuilder {
    /// Create a new builder with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Set serial port path
    pub fn serial_port(mut self, port: impl Into<PathBuf>) -> Self {
        let InterfaceConfig::Serial {
            baud_rate, api_mode, ..
        } = self.config.interface;
        self.config.interface = InterfaceConfig::Serial {
            port: Some(port.into()),
            baud_rate,
            api_mode,
        };
        self
    }

    /// Set baud rate
    pub fn baud_rate(mut self, rate: u32) -> Self {
        let InterfaceConfig::Serial { baud_rate, .. } = &mut self.config.interface;
        *baud_rate = rate;
        self
    }

    /// Set the API mode
    pub fn api_mode(mut self, mode: ApiMode) -> Self {
        let InterfaceConfig::Serial { api_mode, .. } = &mut self.config.interface;
        *api_mode = mode;
        self
    }

    /// Set the coordinator entry
    pub fn coordinator(mut self, key: impl Into<String>, addr64: u64) -> Self {
        self.config.network.coordinator = NodeEntry::new(key, addr64);
        self
    }

    /// Replace the field node table
    pub fn nodes(mut self, nodes: Vec<NodeEntry>) -> Self {
        self.config.network.nodes = nodes;
        self
    }

    /// Add a field node
    pub fn node(mut self, key: impl Into<String>, addr64: u64) -> Self {
        self.config.network.nodes.push(NodeEntry::new(key, addr64));
        self
    }

    /// Designate the power-monitoring node
    pub fn power_monitor(mut self, key: impl Into<String>) -> Self {
        self.config.network.power_monitor = Some(NodeKey::new(key));
        self
    }

    /// Set discovery retries and window
    pub fn discovery(mut self, max_retries: u32, window: Duration) -> Self {
        self.config.discovery = DiscoveryConfig {
            max_retries,
            window,
        };
        self
    }

    /// Set the telemetry report interval
    pub fn report_interval(mut self, interval: Duration) -> Self {
        self.config.telemetry.report_interval = interval;
        self
    }

    /// Enable or disable auto-reconnect
    pub fn auto_reconnect(mut self, enabled: bool) -> Self {
        self.config.reconnect.enabled = enabled;
        self
    }

    /// Restore a node's D4 output on startup
    pub fn restore_output(mut self, key: impl Into<String>, high: bool) -> Self {
        self.config.restore_outputs.insert(NodeKey::new(key), high);
        self
    }

    /// Build the configuration
    pub fn build(self) -> WsnConfig {
        self.config
    }
}

// Custom serde module for Duration with humantime
mod humantime_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let s = humantime::format_duration(*duration).to_string();
        serializer.serialize_str(&s)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = WsnConfig::default();
        assert_eq!(config.discovery.max_retries, 1);
        assert_eq!(config.discovery.window, Duration::from_millis(8000));
        assert_eq!(config.network.nodes.len(), 2);
        assert!(config.reconnect.enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_builder() {
        let config = WsnConfigBuilder::new()
            .serial_port("/dev/ttyO2")
            .baud_rate(9600)
            .node("xb3", 0x0013_A200_40B0_8958)
            .power_monitor("xb3")
            .discovery(2, Duration::from_secs(3))
            .build();

        let InterfaceConfig::Serial {
            port, baud_rate, ..
        } = &config.interface;
        assert_eq!(port.as_deref(), Some(Path::new("/dev/ttyO2")));
        assert_eq!(*baud_rate, 9600);
        assert_eq!(config.network.nodes.len(), 3);
        assert_eq!(config.discovery.max_retries, 2);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_json_with_defaults() {
        let json = r#"{
            "interface": { "type": "serial", "port": "/dev/ttyUSB0" },
            "network": {
                "coordinator": { "key": "xb0", "addr64": "0013a20040afb72d" },
                "nodes": [ { "key": "xb1", "addr64": "0013a20040b32d72" } ]
            },
            "discovery": { "window": "5s" },
            "restore_outputs": { "xb1": true }
        }"#;
        let config: WsnConfig = serde_json::from_str(json).unwrap();

        assert_eq!(config.discovery.window, Duration::from_secs(5));
        assert_eq!(config.discovery.max_retries, DEFAULT_DISCOVERY_RETRIES);
        assert_eq!(config.telemetry.report_interval, Duration::from_secs(30));
        let InterfaceConfig::Serial {
            baud_rate, api_mode, ..
        } = config.interface;
        assert_eq!(baud_rate, DEFAULT_BAUD_RATE);
        assert_eq!(api_mode, ApiMode::Escaped);
        assert_eq!(config.restore_outputs.get(&NodeKey::new("xb1")), Some(&true));
    }

    #[test]
    fn test_validate_rejects_duplicates() {
        let config = WsnConfigBuilder::new().node("xb1", 0x1).build();
        assert!(matches!(config.validate(), Err(XbeeError::InvalidConfig(_))));

        let config = WsnConfigBuilder::new()
            .node("xb9", 0x0013_A200_40B3_2D72)
            .build();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_unknown_references() {
        let config = WsnConfigBuilder::new().power_monitor("xb0").build();
        assert!(config.validate().is_err());

        let config = WsnConfigBuilder::new().restore_output("xb7", true).build();
        assert!(config.validate().is_err());
    }
}
