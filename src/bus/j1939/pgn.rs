//! Decoding of the J1939 parameter groups this node listens to
//!
//! Every decoder takes the raw group data (8 bytes for single frames, the
//! reassembled buffer for TP messages) and returns `None` when the group
//! reports "not available" or is too short.

use super::packet::get_le;
use crate::dtc::DtcCode;

const NOT_AVAILABLE_U32: u64 = 0xFFFF_FFFF;
const NOT_AVAILABLE_U16: u64 = 0xFFFF;

/// Samples kept by the parking brake filter
pub const PARKING_BRAKE_HISTORY: usize = 5;

/// Decoded DM1 (active diagnostic trouble codes)
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Dm1 {
    /// Bitfield of lamps reported on, in bus order
    pub lamps: u8,
    pub codes: Vec<DtcCode>,
}

/// VIN, up to the first `*` delimiter
pub fn parse_vin(data: &[u8]) -> String {
    let end = data.iter().position(|&b| b == b'*').unwrap_or(data.len());
    String::from_utf8_lossy(&data[..end]).trim_end_matches('\0').to_string()
}

/// Lamp status from two bytes of 2-bit fields, only `01` counts as on
pub fn parse_lamp_status(status: [u8; 2]) -> u8 {
    let mut lamps = 0u8;
    for (byte_index, byte) in status.iter().enumerate() {
        for field in 0..4 {
            if (byte >> (field * 2)) & 0x3 == 1 {
                lamps |= 1 << (byte_index * 4 + field);
            }
        }
    }
    lamps
}

/// One 4-byte trouble code
///
/// All `0x00` or all `0xFF` is not a code. The value keeps the SPN/FMI
/// bytes as sent plus the conversion method bit in bit 31; the occurrence
/// count is split out.
pub fn parse_trouble_code(code: &[u8]) -> Option<DtcCode> {
    let code: [u8; 4] = code.get(..4)?.try_into().ok()?;
    if code == [0x00; 4] || code == [0xFF; 4] {
        return None;
    }
    let value = (u32::from(code[3] & 0x80) << 24)
        | (u32::from(code[2]) << 16)
        | (u32::from(code[1]) << 8)
        | u32::from(code[0]);
    Some(DtcCode::new(value, code[3] & 0x7F))
}

/// DM1: lamp status bytes, then 4-byte codes until the first sentinel
pub fn parse_dm1(data: &[u8]) -> Dm1 {
    let mut dm1 = Dm1::default();
    if data.len() > 2 {
        dm1.lamps = parse_lamp_status([data[0], data[1]]);
    }
    for chunk in data.get(2..).unwrap_or_default().chunks_exact(4) {
        match parse_trouble_code(chunk) {
            Some(code) => dm1.codes.push(code),
            None => break,
        }
    }
    dm1
}

/// High resolution total distance in meters (5 m/bit)
pub fn parse_odometer_hires(data: &[u8]) -> Option<u64> {
    let raw = get_le(data, 0, 4)?;
    (raw != NOT_AVAILABLE_U32).then_some(raw * 5)
}

/// Total distance in meters (125 m/bit); trip distance comes first
pub fn parse_odometer_lores(data: &[u8]) -> Option<u64> {
    let raw = get_le(data, 4, 4)?;
    (raw != NOT_AVAILABLE_U32).then_some(raw * 125)
}

/// Total fuel used in mL (500 mL/bit)
pub fn parse_fuel_consumption(data: &[u8]) -> Option<u64> {
    let raw = get_le(data, 4, 4)?;
    (raw != NOT_AVAILABLE_U32).then_some(raw * 500)
}

/// Average fuel economy in m/L (1/512 km/L per bit)
pub fn parse_fuel_economy(data: &[u8]) -> Option<u64> {
    let raw = get_le(data, 4, 2)?;
    (raw != NOT_AVAILABLE_U16).then_some(raw * 1000 / 512)
}

/// Parking brake switch: `00` off, `01` on, anything else is ignored
pub fn parse_parking_brake(data: &[u8]) -> Option<bool> {
    match data.first()? & 0x0C {
        0x04 => Some(true),
        0x00 => Some(false),
        _ => None,
    }
}

/// Reverse gear from the current gear byte
///
/// 125 is neutral, 251 park, below 125 reverse, above forward.
pub fn parse_reverse_gear(data: &[u8]) -> Option<bool> {
    let gear = *data.get(3)?;
    if gear == 0xFF {
        return None;
    }
    Some(gear > 0 && gear < 125)
}

/// Which odometer group supplies the distance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OdometerType {
    #[default]
    Unknown,
    LoRes,
    HiRes,
}

impl OdometerType {
    /// Whether a reading of `incoming` may be used; a hi-res reading locks lo-res out
    pub fn accept(&mut self, incoming: OdometerType) -> bool {
        if incoming == OdometerType::LoRes && *self == OdometerType::HiRes {
            return false;
        }
        *self = incoming;
        true
    }
}

/// Debounce of the parking brake across reporting nodes
///
/// Nodes may disagree, so the last few samples are kept. A state is only
/// reported once the history is full; disagreement reports the configured
/// conflict state.
#[derive(Debug, Clone)]
pub struct ParkingBrakeFilter {
    history: [bool; PARKING_BRAKE_HISTORY],
    count: usize,
    conflict_state: bool,
}

impl ParkingBrakeFilter {
    pub fn new(conflict_state: bool) -> Self {
        Self {
            history: [false; PARKING_BRAKE_HISTORY],
            count: 0,
            conflict_state,
        }
    }

    /// Add a sample, returns the filtered state once enough samples exist
    pub fn push(&mut self, on: bool) -> Option<bool> {
        self.history.rotate_right(1);
        self.history[0] = on;

        if self.count + 1 < PARKING_BRAKE_HISTORY {
            self.count += 1;
            return None;
        }

        if self.history.iter().all(|&s| s) {
            Some(true)
        } else if self.history.iter().all(|&s| !s) {
            Some(false)
        } else {
            Some(self.conflict_state)
        }
    }

    pub fn reset(&mut self) {
        self.count = 0;
        self.history = [false; PARKING_BRAKE_HISTORY];
    }
}
