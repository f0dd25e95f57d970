//! # Persisted Device State
//!
//! Small key/value store for values that must survive a restart (VIN,
//! odometer, fault codes, last bus address, message sequence counter).

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::warn;

use crate::error::Result;

/// State keys
pub mod key {
    pub const STRING_VIN: u16 = 30;
    pub const ACTUAL_ODOMETER: u16 = 31;
    pub const FUEL_CONSUMPTION: u16 = 32;
    pub const FUEL_ECONOMY: u16 = 33;
    pub const FLAG_REVERSE_GEAR: u16 = 34;
    pub const FLAG_PARKING_BRAKE: u16 = 35;
    pub const ARRAY_FAULT_CODES: u16 = 36;
    pub const MESSAGE_SEQUENCE: u16 = 100;
    pub const ENGINE_WARM_START: u16 = 104;
    pub const J1939_BUS_TYPE: u16 = 110;
    pub const J1939_BUS_ADDRESS: u16 = 111;
}

/// Persisted key/value collaborator
pub trait State: Send + Sync {
    /// Integer value, 0 when never written
    fn read_int(&self, key: u16) -> i64;
    fn write_int(&self, key: u16, value: i64);

    /// String value, empty when never written
    fn read_string(&self, key: u16) -> String;
    fn write_string(&self, key: u16, value: &str);

    /// Byte array value, empty when never written
    fn read_bytes(&self, key: u16) -> Vec<u8>;
    fn write_bytes(&self, key: u16, value: &[u8]);
}

/// Shared handle passed to every component that persists values
pub type SharedState = Arc<dyn State>;

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct StateData {
    #[serde(default)]
    ints: BTreeMap<u16, i64>,
    #[serde(default)]
    strings: BTreeMap<u16, String>,
    #[serde(default)]
    bytes: BTreeMap<u16, Vec<u8>>,
}

/// State store kept in memory and optionally mirrored to a JSON file
#[derive(Debug, Default)]
pub struct StateStore {
    data: Mutex<StateData>,
    path: Option<PathBuf>,
}

impl StateStore {
    /// Memory-only store
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Load the store from `path`, creating it on first write if missing
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let data = if path.exists() {
            let contents = fs::read_to_string(&path)?;
            serde_json::from_str(&contents)?
        } else {
            StateData::default()
        };

        Ok(Self {
            data: Mutex::new(data),
            path: Some(path),
        })
    }

    pub fn shared(self) -> SharedState {
        Arc::new(self)
    }

    fn lock(&self) -> MutexGuard<'_, StateData> {
        self.data.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn save(&self, data: &StateData) {
        let Some(path) = &self.path else {
            return;
        };
        let result = serde_json::to_string(data)
            .map_err(crate::error::TelematicsError::from)
            .and_then(|json| fs::write(path, json).map_err(Into::into));
        if let Err(e) = result {
            warn!("Failed to persist state to {}: {}", path.display(), e);
        }
    }
}

impl State for StateStore {
    fn read_int(&self, key: u16) -> i64 {
        self.lock().ints.get(&key).copied().unwrap_or(0)
    }

    fn write_int(&self, key: u16, value: i64) {
        let mut data = self.lock();
        data.ints.insert(key, value);
        self.save(&data);
    }

    fn read_string(&self, key: u16) -> String {
        self.lock().strings.get(&key).cloned().unwrap_or_default()
    }

    fn write_string(&self, key: u16, value: &str) {
        let mut data = self.lock();
        data.strings.insert(key, value.to_string());
        self.save(&data);
    }

    fn read_bytes(&self, key: u16) -> Vec<u8> {
        self.lock().bytes.get(&key).cloned().unwrap_or_default()
    }

    fn write_bytes(&self, key: u16, value: &[u8]) {
        let mut data = self.lock();
        data.bytes.insert(key, value.to_vec());
        self.save(&data);
    }
}
