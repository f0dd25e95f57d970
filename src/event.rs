//! # Telemetry Events
//!
//! Event type codes, the queued event record and cellular connection info.

use std::fmt;

/// Internal event type code
///
/// Codes travel through the code map before hitting the wire, so an
/// arbitrary `u8` must be representable (unknown commands are NAKed).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct EventType(pub u8);

impl EventType {
    // Server and system
    pub const ACK: EventType = EventType(1);
    pub const NAK: EventType = EventType(2);
    pub const ACK_TOP: EventType = EventType(3);
    pub const REBOOT: EventType = EventType(5);
    pub const RESTART: EventType = EventType(6);
    pub const WAKEUP: EventType = EventType(7);
    pub const SHUTDOWN: EventType = EventType(8);
    pub const HEARTBEAT: EventType = EventType(10);
    pub const PING: EventType = EventType(11);
    pub const ERROR: EventType = EventType(12);
    pub const CHANGE_SYSTEMTIME: EventType = EventType(13);
    pub const CONFIGURATION_REPLACED: EventType = EventType(14);

    // Inputs
    pub const IGNITION_KEY_ON: EventType = EventType(20);
    pub const IGNITION_KEY_OFF: EventType = EventType(30);

    // Device
    pub const ENGINE_STATUS_ON: EventType = EventType(40);
    pub const ENGINE_STATUS_OFF: EventType = EventType(50);

    // Vehicle bus
    pub const REVERSE_ON: EventType = EventType(70);
    pub const PARKBRAKE_ON: EventType = EventType(71);
    pub const FAULTCODE_ON: EventType = EventType(72);
    pub const FUELSTATUS_PING: EventType = EventType(73);
    pub const REVERSE_OFF: EventType = EventType(80);
    pub const PARKBRAKE_OFF: EventType = EventType(81);
    pub const FAULTCODE_OFF: EventType = EventType(82);

    pub const CUSTOM_PAYLOAD: EventType = EventType(90);

    // Server commands (mobile terminated)
    pub const CONFIGW: EventType = EventType(100);
    pub const MOREMAPW: EventType = EventType(101);
    pub const MTREMAPW: EventType = EventType(102);
    pub const CLEAR_QUEUE: EventType = EventType(110);
    pub const CLEAR_ODOMETER: EventType = EventType(120);
    pub const RESET_FOTA_UPDATER: EventType = EventType(125);
    pub const TEST: EventType = EventType(200);

    pub fn code(self) -> u8 {
        self.0
    }

    /// ACK, NAK and ACK-TOP are never acknowledged by the server
    pub fn requires_ack(self) -> bool {
        !matches!(self, Self::ACK | Self::NAK | Self::ACK_TOP)
    }

    /// Events that may carry the single-byte legacy `extra` payload
    pub fn has_legacy_extra(self) -> bool {
        matches!(self, Self::REBOOT | Self::ERROR)
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// `extra` codes carried by ERROR events
pub mod error_extra {
    pub const IO_THREAD_JAMMED: u8 = 1;
    pub const VBS_SERVICE_JAMMED: u8 = 2;
    pub const EXTERNAL_WATCHDOG: u8 = 9;
    pub const OTA_STAGE_UDP: u8 = 11;
    pub const OTA_STAGE_MOBILEDATA: u8 = 13;
    pub const OTA_STAGE_AIRPLANEMODE: u8 = 15;
    pub const OTA_STAGE_RILDRIVER: u8 = 17;
    pub const OTA_STAGE_RILDRIVER_FAILURE: u8 = 18;
    pub const OTA_STAGE_REBOOT: u8 = 19;
    pub const J1939_NO_ADDRESS_AVAILABLE: u8 = 21;
}

/// Fix type bits
pub mod fix_type {
    pub const FIX_2D: u8 = 0x01;
    pub const FIX_3D: u8 = 0x02;
    pub const GNSS_SOURCED: u8 = 0x04;
    pub const EARTH_TIME_SOURCED: u8 = 0x08;
    /// Forced by the encoder from `is_fix_historic`
    pub const HISTORIC: u8 = 0x40;
}

/// One occurrence to report to a server
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TelemetryEvent {
    /// Queue-assigned unique id
    pub id: u64,
    pub sequence_id: u16,
    pub event_type: EventType,
    /// Epoch seconds
    pub trigger_time: u32,
    /// Tenths of a volt
    pub battery_voltage: u16,
    pub input_bitfield: u8,
    /// Degrees
    pub latitude: f64,
    /// Degrees
    pub longitude: f64,
    pub speed_cms: u16,
    pub heading_deg: u16,
    pub fix_type: u8,
    pub is_fix_historic: bool,
    pub fix_accuracy_m: u32,
    pub sat_count: u8,
    pub odometer_m: u32,
    pub continuous_idle_s: u16,
    pub extra: u8,
    pub carrier_id: u32,
    pub network_type: u8,
    /// dBm, zero or negative
    pub signal_strength: i16,
    pub is_roaming: bool,
    pub additional_data: Option<Vec<u8>>,
}

impl TelemetryEvent {
    pub fn new(event_type: EventType) -> Self {
        Self {
            event_type,
            ..Default::default()
        }
    }

    pub fn with_data(event_type: EventType, data: Vec<u8>) -> Self {
        Self {
            event_type,
            additional_data: Some(data),
            ..Default::default()
        }
    }
}

/// Live cellular connection details at send time
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ConnectInfo {
    /// MCC+MNC as reported by the modem, e.g. "310260"
    pub network_operator: String,
    pub network_type: u8,
    pub is_roaming: bool,
    /// dBm
    pub signal_strength: i16,
}

impl ConnectInfo {
    /// Carrier id parsed from the operator string, 0 if not numeric
    pub fn carrier_id(&self) -> u32 {
        self.network_operator.trim().parse().unwrap_or(0)
    }
}

/// An event raised by a core component before it is stamped and queued
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventRecord {
    pub event_type: EventType,
    pub extra: u8,
    pub data: Option<Vec<u8>>,
}

impl EventRecord {
    pub fn new(event_type: EventType) -> Self {
        Self {
            event_type,
            extra: 0,
            data: None,
        }
    }

    pub fn with_data(event_type: EventType, data: Vec<u8>) -> Self {
        Self {
            event_type,
            extra: 0,
            data: Some(data),
        }
    }

    pub fn with_extra(event_type: EventType, extra: u8) -> Self {
        Self {
            event_type,
            extra,
            data: None,
        }
    }
}
