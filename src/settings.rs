//! # Setting Store
//!
//! Parameterised device settings. Each setting id holds a `|`-separated list
//! of parameters with a built-in default; the server can overwrite or clear
//! individual settings through config-write commands.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::{Result, TelematicsError};

/// Setting ids
pub mod setting {
    pub const SERVER_ADDRESS: u8 = 1;
    pub const LOCAL_PORT: u8 = 2;
    pub const BACKOFF_RETRIES: u8 = 3;
    pub const SERVER_COMMUNICATION: u8 = 23;
    pub const COM_WATCHDOG: u8 = 25;
    pub const SECONDARY_SERVER_ADDRESS: u8 = 27;
    pub const SECONDARY_LOCAL_PORT: u8 = 28;
    pub const SECONDARY_BACKOFF_RETRIES: u8 = 29;
    pub const FORWARD_RAW_BUS: u8 = 30;
    pub const FUEL_STATUS: u8 = 31;
    pub const REVERSE_GEAR: u8 = 32;
    pub const PARKING_BRAKE: u8 = 33;
    pub const FAULT_CODES: u8 = 34;
    pub const VEHICLE_COMMUNICATION: u8 = 35;
}

/// Parameter indexes within a setting
pub mod param {
    pub const SERVER_ADDRESS_IP: usize = 0;
    pub const SERVER_ADDRESS_PORT: usize = 1;
    pub const LOCAL_PORT: usize = 0;
    pub const NONCELLULAR_OK: usize = 0;

    pub const WATCHDOG_UDP_SECONDS: usize = 0;
    pub const WATCHDOG_MOBILEDATA_SECONDS: usize = 1;
    pub const WATCHDOG_SHUTDOWN_SECONDS: usize = 2;
    pub const WATCHDOG_RETRY_SECONDS: usize = 3;
    pub const WATCHDOG_RILDRIVER_SECONDS: usize = 4;
    pub const WATCHDOG_AIRPLANE_SECONDS: usize = 5;

    pub const FUEL_STATUS_SECONDS: usize = 0;
    pub const PARKING_BRAKE_CONFLICT_STATE: usize = 1;

    pub const VEHICLE_J1939_SPEED_KBS: usize = 0;
    pub const VEHICLE_J1708_ENABLED: usize = 1;
}

/// Defaults indexed by setting id (index 0 is reserved)
const SETTING_DEFAULTS: [&str; 36] = [
    "",
    "10.0.2.2|9999",
    "9999",
    "10|10|15|15|20|20|60",
    "1|1800",
    "30|50|90|300",
    "0|1800",
    "132|1",
    "105|300|300|1",
    "132|300|300|1",
    "1800|3",
    "1|20|40|1800|1|0",
    "1|20|40|1800|1|0",
    "1|20|40|1800|1|0",
    "1|20|40|1800|1|0",
    "1|20|40|1800|1|0",
    "",
    "130",
    "300|2",
    "3000|10",
    "250|15",
    "300|15",
    "200|20",
    "0",
    "1|20|40|0|0|0",
    "900|120|120|0|0|0",
    "120",
    "|0",
    "0",
    "10|10|15|15|20|20|60",
    "|0|P|10",
    "300",
    "3",
    "3|1",
    "1",
    "Off|Off",
];

/// Settings that exist in the id space but may not be read or written
const DISABLED_SETTINGS: [u8; 1] = [16];

/// Key/parameter configuration collaborator
pub trait Settings: Send {
    /// Integer parameter, 0 when missing or not numeric
    fn read_parameter_int(&self, id: u8, index: usize) -> u32;

    /// String parameter, empty when missing
    fn read_parameter_string(&self, id: u8, index: usize) -> String;

    /// All parameters of a setting
    fn read_parameter_array(&self, id: u8) -> Vec<String>;

    fn setting_exists(&self, id: u8) -> bool;

    /// Replace a setting value, returns false if it could not be saved
    fn write_setting(&mut self, id: u8, value: &str) -> bool;

    /// Revert a setting to its default, returns false if it could not be saved
    fn clear_setting(&mut self, id: u8) -> bool;
}

/// Setting store with defaults, overrides and optional JSON persistence
#[derive(Debug, Clone, Default)]
pub struct SettingStore {
    overrides: HashMap<u8, String>,
    path: Option<PathBuf>,
}

impl SettingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store seeded with overrides, e.g. from the `[settings]` config table
    pub fn with_overrides(overrides: HashMap<u8, String>) -> Self {
        Self {
            overrides,
            path: None,
        }
    }

    /// Load previously written overrides from `path` and persist later writes there
    ///
    /// A missing file is not an error; startup overrides passed in win over
    /// nothing but lose to values the server wrote.
    pub fn open<P: AsRef<Path>>(path: P, startup: HashMap<u8, String>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut overrides = startup;

        if path.exists() {
            let contents = fs::read_to_string(&path)?;
            let saved: HashMap<u8, String> = serde_json::from_str(&contents)?;
            overrides.extend(saved);
        }

        Ok(Self {
            overrides,
            path: Some(path),
        })
    }

    fn value(&self, id: u8) -> Option<&str> {
        if !self.setting_exists(id) {
            return None;
        }
        match self.overrides.get(&id) {
            Some(v) => Some(v.as_str()),
            None => SETTING_DEFAULTS.get(id as usize).copied(),
        }
    }

    fn save(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let json = serde_json::to_string_pretty(&self.overrides)?;
        fs::write(path, json)?;
        Ok(())
    }
}

impl Settings for SettingStore {
    fn read_parameter_int(&self, id: u8, index: usize) -> u32 {
        let value = self.read_parameter_string(id, index);
        if value.is_empty() {
            return 0;
        }
        match value.trim().parse() {
            Ok(v) => v,
            Err(_) => {
                warn!(setting = id, index, "Parameter is not a number: {}", value);
                0
            }
        }
    }

    fn read_parameter_string(&self, id: u8, index: usize) -> String {
        self.value(id)
            .and_then(|v| v.split('|').nth(index))
            .unwrap_or_default()
            .to_string()
    }

    fn read_parameter_array(&self, id: u8) -> Vec<String> {
        match self.value(id) {
            Some(v) => v.split('|').map(str::to_string).collect(),
            None => Vec::new(),
        }
    }

    fn setting_exists(&self, id: u8) -> bool {
        id > 0 && (id as usize) < SETTING_DEFAULTS.len() && !DISABLED_SETTINGS.contains(&id)
    }

    fn write_setting(&mut self, id: u8, value: &str) -> bool {
        if !self.setting_exists(id) {
            return false;
        }
        debug!(setting = id, "Writing setting: {}", value);
        self.overrides.insert(id, value.to_string());
        match self.save() {
            Ok(()) => true,
            Err(e) => {
                warn!(setting = id, "Failed to save setting: {}", e);
                false
            }
        }
    }

    fn clear_setting(&mut self, id: u8) -> bool {
        if !self.setting_exists(id) {
            return false;
        }
        self.overrides.remove(&id);
        match self.save() {
            Ok(()) => true,
            Err(e) => {
                warn!(setting = id, "Failed to save setting: {}", e);
                false
            }
        }
    }
}

/// Vehicle buses selected by the vehicle communication setting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VehicleBuses {
    /// J1939 bitrate in b/s, 0 to use the last one detected, `None` when off
    pub j1939_bitrate: Option<u32>,
    pub j1587: bool,
}

/// Read setting 35: `j1939 kb/s or Auto or Off | j1708 On or Off`
pub fn vehicle_buses(settings: &dyn Settings) -> VehicleBuses {
    let speed = settings.read_parameter_string(
        setting::VEHICLE_COMMUNICATION,
        param::VEHICLE_J1939_SPEED_KBS,
    );
    let j1939_bitrate = if speed.trim().eq_ignore_ascii_case("off") {
        None
    } else if speed.trim().eq_ignore_ascii_case("auto") {
        Some(0)
    } else {
        match settings.read_parameter_int(
            setting::VEHICLE_COMMUNICATION,
            param::VEHICLE_J1939_SPEED_KBS,
        ) {
            0 => Some(0),
            500 => Some(500_000),
            _ => Some(250_000),
        }
    };

    let j1708 = settings.read_parameter_string(
        setting::VEHICLE_COMMUNICATION,
        param::VEHICLE_J1708_ENABLED,
    );

    VehicleBuses {
        j1939_bitrate,
        j1587: !j1708.trim().eq_ignore_ascii_case("off"),
    }
}

/// Parse `[settings]` config keys into setting ids
pub fn parse_overrides(table: &HashMap<String, String>) -> Result<HashMap<u8, String>> {
    let mut parsed = HashMap::new();
    for (key, value) in table {
        let id: u8 = key
            .trim()
            .parse()
            .map_err(|_| TelematicsError::Settings(format!("setting id '{}' is not a number", key)))?;
        parsed.insert(id, value.clone());
    }
    Ok(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_defaults() {
        let store = SettingStore::new();
        assert_eq!(
            store.read_parameter_array(setting::BACKOFF_RETRIES),
            vec!["10", "10", "15", "15", "20", "20", "60"]
        );
        assert_eq!(store.read_parameter_int(setting::COM_WATCHDOG, param::WATCHDOG_UDP_SECONDS), 900);
        assert_eq!(store.read_parameter_int(setting::FUEL_STATUS, 0), 300);
        assert_eq!(store.read_parameter_string(setting::SERVER_ADDRESS, 0), "10.0.2.2");
    }

    #[test]
    fn test_missing_and_non_numeric_parameters_read_as_zero() {
        let store = SettingStore::new();
        // secondary server address default is "|0"
        assert_eq!(store.read_parameter_string(setting::SECONDARY_SERVER_ADDRESS, 0), "");
        assert_eq!(store.read_parameter_int(setting::SECONDARY_SERVER_ADDRESS, 1), 0);
        assert_eq!(store.read_parameter_int(setting::VEHICLE_COMMUNICATION, 0), 0);
        assert_eq!(store.read_parameter_int(setting::FUEL_STATUS, 7), 0);
    }

    #[test]
    fn test_vehicle_buses() {
        let store = SettingStore::new();
        assert_eq!(
            vehicle_buses(&store),
            VehicleBuses { j1939_bitrate: None, j1587: false },
            "Both buses off by default"
        );

        let cases = [
            ("Auto|On", Some(0), true),
            ("auto|off", Some(0), false),
            ("500|On", Some(500_000), true),
            ("250|Off", Some(250_000), false),
            ("125|", Some(250_000), true),
            ("Off|On", None, true),
        ];
        for (value, j1939_bitrate, j1587) in cases {
            let mut store = SettingStore::new();
            assert!(store.write_setting(setting::VEHICLE_COMMUNICATION, value));
            assert_eq!(
                vehicle_buses(&store),
                VehicleBuses { j1939_bitrate, j1587 },
                "Setting {:?}",
                value
            );
        }
    }

    #[test]
    fn test_setting_exists_range() {
        let store = SettingStore::new();
        assert!(!store.setting_exists(0));
        assert!(store.setting_exists(1));
        assert!(store.setting_exists(35));
        assert!(!store.setting_exists(36));
        assert!(!store.setting_exists(16), "Disabled setting must not exist");
    }

    #[test]
    fn test_write_and_clear() {
        let mut store = SettingStore::new();
        assert!(store.write_setting(setting::BACKOFF_RETRIES, "5|6"));
        assert_eq!(store.read_parameter_array(setting::BACKOFF_RETRIES), vec!["5", "6"]);

        assert!(store.clear_setting(setting::BACKOFF_RETRIES));
        assert_eq!(store.read_parameter_int(setting::BACKOFF_RETRIES, 0), 10);

        assert!(!store.write_setting(99, "1"));
    }

    #[test]
    fn test_writes_persist_across_open() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("settings.json");

        let mut store = SettingStore::open(&path, HashMap::new()).unwrap();
        assert!(store.write_setting(setting::FUEL_STATUS, "60"));

        let reopened = SettingStore::open(&path, HashMap::new()).unwrap();
        assert_eq!(reopened.read_parameter_int(setting::FUEL_STATUS, 0), 60);
    }

    #[test]
    fn test_parse_overrides() {
        let mut table = HashMap::new();
        table.insert("3".to_string(), "1|2|3".to_string());
        let parsed = parse_overrides(&table).unwrap();
        assert_eq!(parsed.get(&3).map(String::as_str), Some("1|2|3"));

        table.insert("abc".to_string(), "1".to_string());
        assert!(parse_overrides(&table).is_err());
    }
}
