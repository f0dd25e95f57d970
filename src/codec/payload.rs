//! # Additional Data Payloads
//!
//! Builders for the event-specific `additional_data` blobs.

use bytes::{BufMut, BytesMut};

/// Fuel totals: liters (u32) then meters per liter (u16), both saturating
pub fn encode_all_fuel(fuel_ml: u64, fuel_m_per_l: u64) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(6);
    buf.put_u32_le((fuel_ml / 1000).min(u64::from(u32::MAX)) as u32);
    buf.put_u16_le(fuel_m_per_l.min(u64::from(u16::MAX)) as u16);
    buf.to_vec()
}

/// Fault code: bus type then the packed code value
pub fn encode_fault_code(bus_bits: u8, value: u32) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(5);
    buf.put_u8(bus_bits);
    buf.put_u32_le(value);
    buf.to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_fuel_layout() {
        let data = encode_all_fuel(1_234_567, 3000);
        assert_eq!(data.len(), 6);
        assert_eq!(u32::from_le_bytes([data[0], data[1], data[2], data[3]]), 1234);
        assert_eq!(u16::from_le_bytes([data[4], data[5]]), 3000);
    }

    #[test]
    fn test_all_fuel_saturates() {
        let data = encode_all_fuel(u64::MAX, 100_000);
        assert_eq!(&data[..4], &[0xFF; 4]);
        assert_eq!(&data[4..], &[0xFF, 0xFF]);
    }

    #[test]
    fn test_fault_code_layout() {
        assert_eq!(encode_fault_code(4, 0x0012_B4C2), vec![4, 0xC2, 0xB4, 0x12, 0x00]);
        assert_eq!(encode_fault_code(1, 0x8000_0001), vec![1, 0x01, 0, 0, 0x80]);
    }
}
