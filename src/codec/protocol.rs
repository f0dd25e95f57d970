//! # Message Protocol Constants
//!
//! Field sizes, limits and reason codes of the server message layout.

/// Maximum serial number length; inbound serials must be shorter
pub const MAX_SERIAL_LENGTH: usize = 20;

/// Source id of this application in the service type byte
pub const SOURCE_ID: u8 = 0;

/// Service type bit asking the server to acknowledge
pub const SERVICE_TYPE_ACK_REQUIRED: u8 = 0x80;

/// Mask applied to the low bits of the service type byte
pub const SERVICE_TYPE_SOURCE_MASK: u8 = 0x7F;

/// Largest inbound datagram accepted from a server
pub const MAX_INCOMING_MESSAGE_LENGTH: usize = 100;

/// Output buffer size for one encoded event
pub const MAX_OUTGOING_MESSAGE_LENGTH: usize = 512;

/// Inbound payloads must be strictly shorter than this
pub const MAX_SIZE_ADDITIONAL_DATA: usize = 250;

/// Mask applied when matching an ACK against the queue head
pub const SEQUENCE_ID_RECEIVE_MASK: u16 = 0xFFFF;

/// Signal strength byte flag set while roaming
pub const SIGNAL_ROAMING_FLAG: u8 = 0x80;

/// Fields between the serial number and the payload length of an event
///
/// service(1) seq(2) code(1) carrier(3) rssi(1) net(1) time(4) batt(1)
/// inputs(1) lat(4) lon(4) speed(2) heading(2) fix(1) hdop(2) sats(1)
/// odometer(4) idle(2)
pub const EVENT_FIXED_FIELDS_LENGTH: usize = 37;

/// Fields between the serial number and the payload length of a command
pub const COMMAND_FIXED_FIELDS_LENGTH: usize = 4;

/// Reasons carried in the single payload byte of a NAK
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum NakReason {
    UnknownCommand = 1,
    MissingRequiredData = 2,
    BadValueEncoding = 3,
    BadSettingId = 4,
    ErrorInSaving = 5,
}

impl NakReason {
    pub fn code(self) -> u8 {
        self as u8
    }
}
