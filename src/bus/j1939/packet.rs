//! J1939 packet view of a 29-bit CAN frame
//!
//! ```text
//! PRI(3) RSV(1) DP(1) PF(8) PS(8) SA(8)
//! ```

use crate::bus::frame::CanFrame;

pub const DEFAULT_PRIORITY: u8 = 6;

/// Fill value for unused data bytes
pub const PAD: u8 = 0xFF;

// PFs below 240 carry a destination address in PS
pub const PF_REQUEST: u8 = 0xEA;
pub const PF_CLAIMED_ADDRESS: u8 = 0xEE;
pub const PF_CONNECTION_MANAGE: u8 = 0xEC;
pub const PF_CONNECTION_DATA: u8 = 0xEB;

/// First PF whose PS byte is a group extension instead of an address
pub const PF_BROADCAST_MIN: u8 = 240;

pub const PGN_VIN: u32 = 0x00FEEC;
pub const PGN_FAULT_DM1: u32 = 0x00FECA;
pub const PGN_ODOMETER_HIRES: u32 = 0x00FEC1;
pub const PGN_ODOMETER_LORES: u32 = 0x00FEE0;
pub const PGN_FUEL_CONSUMPTION: u32 = 0x00FEE9;
pub const PGN_FUEL_ECONOMY: u32 = 0x00FEF2;
/// Cruise control / vehicle speed, carries the parking brake switch
pub const PGN_PARKING: u32 = 0x00FEF1;
/// ETC2, carries the current gear
pub const PGN_GEAR: u32 = 0x00F005;

pub const ADDRESS_NULL: u8 = 254;
pub const ADDRESS_GLOBAL: u8 = 255;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub priority: u8,
    pub protocol_format: u8,
    /// Destination address, or group extension when PF >= 240
    pub destination_address: u8,
    pub source_address: u8,
    pub data: [u8; 8],
}

impl Packet {
    pub fn new(protocol_format: u8, destination_address: u8, source_address: u8) -> Self {
        Self {
            priority: DEFAULT_PRIORITY,
            protocol_format,
            destination_address,
            source_address,
            data: [PAD; 8],
        }
    }

    pub fn pgn(&self) -> u32 {
        let pf = u32::from(self.protocol_format);
        if self.protocol_format < PF_BROADCAST_MIN {
            pf << 8
        } else {
            (pf << 8) | u32::from(self.destination_address)
        }
    }

    /// Whether the packet has a destination address (PDU1 format)
    pub fn is_addressed(&self) -> bool {
        self.protocol_format < PF_BROADCAST_MIN
    }

    /// Build the CAN frame carrying the first `length` data bytes
    pub fn to_frame(&self, length: usize) -> CanFrame {
        let id = (u32::from(self.priority & 0x7) << 26)
            | (u32::from(self.protocol_format) << 16)
            | (u32::from(self.destination_address) << 8)
            | u32::from(self.source_address);
        CanFrame::new(id, self.data[..length.min(8)].to_vec())
    }

    /// Parse a received frame, missing data bytes read as padding
    pub fn from_frame(frame: &CanFrame) -> Self {
        let mut data = [PAD; 8];
        let n = frame.data.len().min(8);
        data[..n].copy_from_slice(&frame.data[..n]);
        Self {
            priority: ((frame.id >> 26) & 0x7) as u8,
            protocol_format: ((frame.id >> 16) & 0xFF) as u8,
            destination_address: ((frame.id >> 8) & 0xFF) as u8,
            source_address: (frame.id & 0xFF) as u8,
            data,
        }
    }
}

/// Write the low `len` bytes of `value` little-endian at `offset`
pub fn put_le(data: &mut [u8], offset: usize, len: usize, value: u64) {
    for i in 0..len {
        data[offset + i] = (value >> (8 * i)) as u8;
    }
}

/// Read `len` little-endian bytes at `offset`, `None` if out of range
pub fn get_le(data: &[u8], offset: usize, len: usize) -> Option<u64> {
    let bytes = data.get(offset..offset + len)?;
    Some(
        bytes
            .iter()
            .rev()
            .fold(0u64, |acc, &b| (acc << 8) | u64::from(b)),
    )
}
