//! # Message Decoder
//!
//! Decodes inbound server commands and re-reads outbound event layouts.
//!
//! Every field boundary is length-checked. Any failure is returned as a
//! `Codec` error, which callers treat as "not for us": no ACK, no NAK, no
//! queue mutation.

use bytes::Buf;

use super::protocol::*;
use crate::codemap::CodeMap;
use crate::error::{Result, TelematicsError};
use crate::event::{fix_type, TelemetryEvent};

fn too_short(field: &str, len: usize) -> TelematicsError {
    TelematicsError::Codec(format!("Message too short for {} ({} bytes)", field, len))
}

/// Validate serial number and service type, leaving `buf` at the sequence id
fn decode_header(buf: &mut &[u8], total: usize, device_id: &str) -> Result<()> {
    if buf.remaining() < 1 {
        return Err(too_short("serial length", total));
    }
    let serial_len = buf.get_u8() as usize;
    if serial_len >= MAX_SERIAL_LENGTH {
        return Err(TelematicsError::Codec(format!(
            "Serial length {} out of range",
            serial_len
        )));
    }
    if buf.remaining() < serial_len {
        return Err(too_short("serial number", total));
    }
    if serial_len != device_id.len() {
        return Err(TelematicsError::Codec(format!(
            "Serial number has wrong length (expected {} was {})",
            device_id.len(),
            serial_len
        )));
    }
    if &buf[..serial_len] != device_id.as_bytes() {
        return Err(TelematicsError::Codec("Serial number does not match".to_string()));
    }
    buf.advance(serial_len);

    if buf.remaining() < 1 {
        return Err(too_short("service type", total));
    }
    let service = buf.get_u8();
    if service & SERVICE_TYPE_SOURCE_MASK != SOURCE_ID {
        return Err(TelematicsError::Codec(format!(
            "Application source does not match (was {})",
            service & SERVICE_TYPE_SOURCE_MASK
        )));
    }
    Ok(())
}

/// Decode an inbound command from a server
///
/// # Arguments
///
/// * `message` - Raw datagram
/// * `device_id` - Serial number of this device, must match exactly
/// * `code_map` - Inbound event code remapping
/// * `now` - Current epoch seconds, becomes the trigger time
///
/// # Returns
///
/// * `Result<TelemetryEvent>` - Sequence id, mapped event type and optional payload
///
/// # Errors
///
/// Returns `Codec` error if:
/// - The message ends before the event code
/// - The serial number length or content differ from `device_id`
/// - The service type source bits are not this application's
pub fn decode_command(
    message: &[u8],
    device_id: &str,
    code_map: &dyn CodeMap,
    now: u32,
) -> Result<TelemetryEvent> {
    let total = message.len();
    let mut buf = message;
    decode_header(&mut buf, total, device_id)?;

    if buf.remaining() < 3 {
        return Err(too_short("sequence and event code", total));
    }

    let mut event = TelemetryEvent::default();
    event.sequence_id = buf.get_u16_le();
    event.event_type = code_map.map_mt(buf.get_u8());
    event.trigger_time = now;

    // the payload length is optional on commands
    if buf.remaining() >= 2 {
        let len = buf.get_u16_le() as usize;
        if len > 0 && len <= buf.remaining() && len < MAX_SIZE_ADDITIONAL_DATA {
            event.additional_data = Some(buf[..len].to_vec());
        }
    }

    Ok(event)
}

/// Decode a full outbound event layout
///
/// The inverse of `encode_event` for events with an accuracy of at least
/// 10 m and a signal strength within -127..=0 dBm. Trigger time is
/// replaced by `now`. A single payload byte on REBOOT/ERROR is kept as
/// additional data and also copied into the legacy `extra` field.
pub fn decode_event(
    message: &[u8],
    device_id: &str,
    code_map: &dyn CodeMap,
    now: u32,
) -> Result<TelemetryEvent> {
    let total = message.len();
    let mut buf = message;
    decode_header(&mut buf, total, device_id)?;

    // the service type byte is already consumed
    if buf.remaining() < EVENT_FIXED_FIELDS_LENGTH - 1 {
        return Err(too_short("event fields", total));
    }

    let mut event = TelemetryEvent::default();
    event.sequence_id = buf.get_u16_le();
    event.event_type = code_map.unmap_mo(buf.get_u8());

    event.carrier_id = buf.get_uint_le(3) as u32;
    let signal = buf.get_u8();
    event.is_roaming = signal & SIGNAL_ROAMING_FLAG != 0;
    event.signal_strength = -i16::from(signal & !SIGNAL_ROAMING_FLAG);
    event.network_type = buf.get_u8();

    let _sender_time = buf.get_u32_le();
    event.trigger_time = now;
    event.battery_voltage = u16::from(buf.get_u8());
    event.input_bitfield = buf.get_u8();

    event.latitude = f64::from(buf.get_i32_le()) * 0.000_000_1;
    event.longitude = f64::from(buf.get_i32_le()) * 0.000_000_1;
    event.speed_cms = buf.get_u16_le();
    event.heading_deg = buf.get_u16_le();

    let fix = buf.get_u8();
    event.is_fix_historic = fix & fix_type::HISTORIC != 0;
    event.fix_type = fix & !fix_type::HISTORIC;

    event.fix_accuracy_m = u32::from(buf.get_u16_le()) + 10;
    event.sat_count = buf.get_u8();
    event.odometer_m = buf.get_u32_le();
    event.continuous_idle_s = buf.get_u16_le();

    if buf.remaining() >= 2 {
        let len = buf.get_u16_le() as usize;
        if len > buf.remaining() {
            return Err(too_short("additional data", total));
        }
        let data = buf[..len].to_vec();
        if len == 1 && event.event_type.has_legacy_extra() {
            event.extra = data[0];
        }
        event.additional_data = Some(data);
    }

    Ok(event)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::encoder::encode_event;
    use crate::codemap::MemoryCodeMap;
    use crate::event::EventType;

    const SERIAL: &str = "A0123456";
    const NOW: u32 = 1_700_000_000;

    fn command(seq: u16, code: u8, data: Option<&[u8]>) -> Vec<u8> {
        let mut msg = vec![SERIAL.len() as u8];
        msg.extend_from_slice(SERIAL.as_bytes());
        msg.push(0x80);
        msg.extend_from_slice(&seq.to_le_bytes());
        msg.push(code);
        if let Some(data) = data {
            msg.extend_from_slice(&(data.len() as u16).to_le_bytes());
            msg.extend_from_slice(data);
        }
        msg
    }

    fn sample_event() -> TelemetryEvent {
        TelemetryEvent {
            id: 0,
            sequence_id: 0xBEEF,
            event_type: EventType::FAULTCODE_ON,
            trigger_time: 0,
            battery_voltage: 138,
            input_bitfield: 0b1010_0001,
            latitude: 45.1234567,
            longitude: -93.7654321,
            speed_cms: 2500,
            heading_deg: 271,
            fix_type: fix_type::FIX_3D | fix_type::GNSS_SOURCED,
            is_fix_historic: true,
            fix_accuracy_m: 42,
            sat_count: 9,
            odometer_m: 123_456_789,
            continuous_idle_s: 600,
            extra: 0,
            carrier_id: 310260,
            network_type: 13,
            signal_strength: -85,
            is_roaming: true,
            additional_data: Some(vec![1, 0x2A, 0x10, 0x00, 0x80]),
        }
    }

    #[test]
    fn test_decode_command_ack() {
        let msg = command(0x0102, 1, None);
        let event = decode_command(&msg, SERIAL, &MemoryCodeMap::new(), NOW).unwrap();
        assert_eq!(event.sequence_id, 0x0102);
        assert_eq!(event.event_type, EventType::ACK);
        assert_eq!(event.trigger_time, NOW, "Trigger time is the local clock");
        assert!(event.additional_data.is_none());
    }

    #[test]
    fn test_decode_command_with_payload() {
        let msg = command(7, 100, Some(&[3, b'5', b'|', b'6']));
        let event = decode_command(&msg, SERIAL, &MemoryCodeMap::new(), NOW).unwrap();
        assert_eq!(event.event_type, EventType::CONFIGW);
        assert_eq!(event.additional_data, Some(vec![3, b'5', b'|', b'6']));
    }

    #[test]
    fn test_decode_command_maps_mt_code() {
        let mut map = MemoryCodeMap::new();
        map.write_mt(42, EventType::CLEAR_QUEUE.0);
        let event = decode_command(&command(1, 42, None), SERIAL, &map, NOW).unwrap();
        assert_eq!(event.event_type, EventType::CLEAR_QUEUE);
    }

    #[test]
    fn test_decode_command_payload_limits() {
        // declared length beyond the buffer is dropped, not an error
        let mut msg = command(1, 100, None);
        msg.extend_from_slice(&[10, 0, 1, 2]);
        let event = decode_command(&msg, SERIAL, &MemoryCodeMap::new(), NOW).unwrap();
        assert!(event.additional_data.is_none());

        // 250 bytes hits the safety cap
        let msg = command(1, 100, Some(&[0u8; 250]));
        let event = decode_command(&msg, SERIAL, &MemoryCodeMap::new(), NOW).unwrap();
        assert!(event.additional_data.is_none());

        let msg = command(1, 100, Some(&[0u8; 249]));
        let event = decode_command(&msg, SERIAL, &MemoryCodeMap::new(), NOW).unwrap();
        assert_eq!(event.additional_data.map(|d| d.len()), Some(249));
    }

    #[test]
    fn test_decode_too_short() {
        let map = MemoryCodeMap::new();
        assert!(decode_command(&[], SERIAL, &map, NOW).is_err());

        let msg = command(1, 1, None);
        for len in 0..msg.len() {
            assert!(
                decode_command(&msg[..len], SERIAL, &map, NOW).is_err(),
                "Truncated at {} must not decode",
                len
            );
        }
    }

    #[test]
    fn test_decode_serial_mismatch() {
        let map = MemoryCodeMap::new();
        let msg = command(1, 1, None);

        assert!(decode_command(&msg, "A012345", &map, NOW).is_err(), "Length mismatch");
        assert!(decode_command(&msg, "B0123456", &map, NOW).is_err(), "Content mismatch");

        let mut long = vec![20u8];
        long.extend_from_slice(&[b'A'; 20]);
        long.extend_from_slice(&[0, 1, 0, 1]);
        assert!(decode_command(&long, &"A".repeat(20), &map, NOW).is_err());
    }

    #[test]
    fn test_decode_wrong_source_id() {
        let mut msg = command(1, 1, None);
        msg[1 + SERIAL.len()] = 0x81;
        assert!(decode_command(&msg, SERIAL, &MemoryCodeMap::new(), NOW).is_err());
    }

    #[test]
    fn test_event_round_trip() {
        let map = MemoryCodeMap::new();
        let original = sample_event();
        let encoded = encode_event(&original, SERIAL, &map, None);
        let decoded = decode_event(&encoded, SERIAL, &map, NOW).unwrap();

        assert_eq!(decoded.trigger_time, NOW);
        assert!((decoded.latitude - original.latitude).abs() < 1e-7);
        assert!((decoded.longitude - original.longitude).abs() < 1e-7);

        let normalise = |mut e: TelemetryEvent| {
            e.trigger_time = 0;
            e.latitude = 0.0;
            e.longitude = 0.0;
            e
        };
        assert_eq!(normalise(decoded), normalise(original));
    }

    #[test]
    fn test_round_trip_through_remapped_code() {
        let mut map = MemoryCodeMap::new();
        map.write_mo(EventType::FAULTCODE_ON.0, 180);
        let encoded = encode_event(&sample_event(), SERIAL, &map, None);
        let decoded = decode_event(&encoded, SERIAL, &map, NOW).unwrap();
        assert_eq!(decoded.event_type, EventType::FAULTCODE_ON);
    }

    #[test]
    fn test_latitude_quantization() {
        let mut event = sample_event();
        event.latitude = 45.1234567;
        let encoded = encode_event(&event, SERIAL, &MemoryCodeMap::new(), None);

        let pos = 1 + SERIAL.len() + 15;
        let raw = i32::from_le_bytes([encoded[pos], encoded[pos + 1], encoded[pos + 2], encoded[pos + 3]]);
        assert_eq!(raw, 451_234_567);
        assert!((f64::from(raw) / 1e7 - 45.1234567).abs() <= 1e-7);
    }

    #[test]
    fn test_legacy_extra_round_trip() {
        let map = MemoryCodeMap::new();
        let mut event = TelemetryEvent::new(EventType::ERROR);
        event.extra = 21;
        event.fix_accuracy_m = 10;

        let encoded = encode_event(&event, SERIAL, &map, None);
        let decoded = decode_event(&encoded, SERIAL, &map, NOW).unwrap();
        assert_eq!(decoded.extra, 21);
        assert_eq!(decoded.additional_data, Some(vec![21]));
    }

    #[test]
    fn test_single_byte_payload_on_reboot_round_trips() {
        let map = MemoryCodeMap::new();
        let mut event = TelemetryEvent::with_data(EventType::REBOOT, vec![0x42]);
        event.fix_accuracy_m = 10;

        let encoded = encode_event(&event, SERIAL, &map, None);
        let decoded = decode_event(&encoded, SERIAL, &map, NOW).unwrap();
        assert_eq!(decoded.additional_data, Some(vec![0x42]));
        assert_eq!(decoded.extra, 0x42, "Old readers still see the byte");
        assert_eq!(decoded.event_type, EventType::REBOOT);
    }

    #[test]
    fn test_decode_event_truncated_payload() {
        let map = MemoryCodeMap::new();
        let encoded = encode_event(&sample_event(), SERIAL, &map, None);
        assert!(decode_event(&encoded[..encoded.len() - 1], SERIAL, &map, NOW).is_err());
    }
}
