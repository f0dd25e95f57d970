//! # Configuration Module
//!
//! Handles loading and validating the agent configuration from TOML files.

use serde::de::Error;
use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::path::Path;

use crate::codec::protocol::MAX_SERIAL_LENGTH;
use crate::error::{Result, TelematicsError};
use crate::settings::setting;

/// Main configuration structure
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub device: DeviceConfig,

    #[serde(default)]
    pub vehicle: VehicleConfig,

    #[serde(default)]
    pub gateway: GatewayConfig,

    #[serde(default)]
    pub delivery: DeliveryConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    /// Setting overrides, id -> `|`-separated parameters
    #[serde(default)]
    pub settings: HashMap<String, String>,
}

/// Device identity and storage
#[derive(Debug, Deserialize, Clone)]
pub struct DeviceConfig {
    pub serial_number: String,

    #[serde(default = "default_state_path")]
    pub state_path: String,

    /// Where settings written by a server are kept
    #[serde(default = "default_settings_path")]
    pub settings_path: String,

    /// Report the data network as cellular
    #[serde(default = "default_cellular")]
    pub cellular: bool,

    /// MCC+MNC reported as the carrier
    #[serde(default)]
    pub network_operator: String,

    /// `ip:port` the host must have a route to for the network to count as up
    #[serde(default)]
    pub route_check: Option<String>,
}

/// Vehicle bus configuration
#[derive(Debug, Deserialize, Clone)]
pub struct VehicleConfig {
    #[serde(default = "default_true")]
    pub j1939_enabled: bool,

    /// 0 lets the stack use the last detected bitrate
    #[serde(default)]
    pub j1939_bitrate: u32,

    #[serde(default = "default_true")]
    pub j1587_enabled: bool,

    /// Identity number of the J1939 name, defaults to the numeric serial number
    #[serde(default)]
    pub j1939_device_id: Option<u32>,
}

/// Link to the vehicle bus gateway process
#[derive(Debug, Deserialize, Clone)]
pub struct GatewayConfig {
    #[serde(default = "default_gateway_listen_port")]
    pub listen_port: u16,

    #[serde(default = "default_gateway_peer")]
    pub peer: String,
}

/// Server delivery configuration
#[derive(Debug, Deserialize, Clone)]
pub struct DeliveryConfig {
    #[serde(default)]
    pub use_live_connect_info: bool,

    #[serde(default = "default_tick_normal_ms")]
    pub tick_normal_ms: u64,

    #[serde(default = "default_tick_after_send_ms")]
    pub tick_after_send_ms: u64,
}

/// Logging configuration
#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    /// Directory of the daily rolling log file, console only when unset
    #[serde(default)]
    pub dir: Option<String>,

    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default value functions
fn default_state_path() -> String { "./state.json".to_string() }
fn default_settings_path() -> String { "./settings.json".to_string() }
fn default_cellular() -> bool { true }
fn default_true() -> bool { true }

fn default_gateway_listen_port() -> u16 { 5601 }
fn default_gateway_peer() -> String { "127.0.0.1:5600".to_string() }

fn default_tick_normal_ms() -> u64 { 500 }
fn default_tick_after_send_ms() -> u64 { 200 }

fn default_log_level() -> String { "info".to_string() }

impl Default for VehicleConfig {
    fn default() -> Self {
        Self {
            j1939_enabled: true,
            j1939_bitrate: 0,
            j1587_enabled: true,
            j1939_device_id: None,
        }
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen_port: default_gateway_listen_port(),
            peer: default_gateway_peer(),
        }
    }
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            use_live_connect_info: false,
            tick_normal_ms: default_tick_normal_ms(),
            tick_after_send_ms: default_tick_after_send_ms(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            dir: None,
            level: default_log_level(),
        }
    }
}

fn invalid(message: impl std::fmt::Display) -> TelematicsError {
    TelematicsError::Config(toml::de::Error::custom(message))
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the configuration file
    ///
    /// # Returns
    ///
    /// * `Result<Config>` - Loaded and validated configuration
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - File cannot be read
    /// - TOML parsing fails
    /// - Validation fails
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use fleet_telematics::config::Config;
    ///
    /// let config = Config::load("config/default.toml")?;
    /// # Ok::<(), Box<dyn std::error::Error>>(())
    /// ```
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Setting overrides to start the setting store with
    ///
    /// The `[vehicle]` section seeds the vehicle communication setting unless
    /// `[settings]` sets it directly.
    pub fn setting_overrides(&self) -> Result<HashMap<u8, String>> {
        let mut overrides = crate::settings::parse_overrides(&self.settings)?;
        overrides
            .entry(setting::VEHICLE_COMMUNICATION)
            .or_insert_with(|| {
                let j1939 = match (self.vehicle.j1939_enabled, self.vehicle.j1939_bitrate) {
                    (false, _) => "Off".to_string(),
                    (true, 0) => "Auto".to_string(),
                    (true, bitrate) => (bitrate / 1000).to_string(),
                };
                let j1587 = if self.vehicle.j1587_enabled { "On" } else { "Off" };
                format!("{}|{}", j1939, j1587)
            });
        Ok(overrides)
    }

    /// Identity number for the J1939 name
    pub fn j1939_device_id(&self) -> u32 {
        self.vehicle
            .j1939_device_id
            .unwrap_or_else(|| self.device.serial_number.trim().parse().unwrap_or(0))
    }

    /// Validate configuration values
    ///
    /// # Errors
    ///
    /// Returns error if any configuration value is out of valid range
    fn validate(&self) -> Result<()> {
        let serial = &self.device.serial_number;
        if serial.is_empty() || serial.len() >= MAX_SERIAL_LENGTH {
            return Err(invalid(format!(
                "serial_number must be 1 to {} characters",
                MAX_SERIAL_LENGTH - 1
            )));
        }
        if !serial.is_ascii() {
            return Err(invalid("serial_number must be ASCII"));
        }

        if self.device.state_path.is_empty() {
            return Err(invalid("state_path cannot be empty"));
        }

        if let Some(target) = &self.device.route_check {
            if target.parse::<std::net::SocketAddr>().is_err() {
                return Err(invalid(format!(
                    "route_check '{}' is not an ip:port address",
                    target
                )));
            }
        }

        if ![0, 250_000, 500_000].contains(&self.vehicle.j1939_bitrate) {
            return Err(invalid("j1939_bitrate must be one of: 250000, 500000"));
        }

        if self.gateway.peer.parse::<std::net::SocketAddr>().is_err() {
            return Err(invalid(format!(
                "gateway peer '{}' is not an ip:port address",
                self.gateway.peer
            )));
        }

        if self.delivery.tick_normal_ms == 0 || self.delivery.tick_normal_ms > 60000 {
            return Err(invalid("tick_normal_ms must be between 1 and 60000"));
        }

        if self.delivery.tick_after_send_ms == 0
            || self.delivery.tick_after_send_ms > self.delivery.tick_normal_ms
        {
            return Err(invalid("tick_after_send_ms must be between 1 and tick_normal_ms"));
        }

        if !["trace", "debug", "info", "warn", "error"].contains(&self.logging.level.as_str()) {
            return Err(invalid("level must be one of: trace, debug, info, warn, error"));
        }

        self.setting_overrides()?;

        Ok(())
    }
}
