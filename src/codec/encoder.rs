//! # Event Encoder
//!
//! Serialises a queued telemetry event into the outbound datagram layout.

use bytes::{BufMut, BytesMut};

use super::protocol::*;
use crate::codemap::CodeMap;
use crate::event::{fix_type, ConnectInfo, EventType, TelemetryEvent};

/// Encode an event for transmission
///
/// # Arguments
///
/// * `event` - Event to encode
/// * `device_id` - Serial number of this device (truncated to 20 bytes)
/// * `code_map` - Outbound event code remapping
/// * `live` - Live cellular info; `None` sends the values stored with the event
///
/// # Returns
///
/// * `Vec<u8>` - Encoded message, never longer than 512 bytes
///
/// # Layout
///
/// ```text
/// serial_len(1) serial(n) service(1) seq(2) code(1) carrier(3) rssi(1) net(1)
/// time(4) batt(1) inputs(1) lat(4) lon(4) speed(2) heading(2) fix(1) hdop(2)
/// sats(1) odometer(4) idle(2) [data_len(2) data(m)]
/// ```
pub fn encode_event(
    event: &TelemetryEvent,
    device_id: &str,
    code_map: &dyn CodeMap,
    live: Option<&ConnectInfo>,
) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(MAX_OUTGOING_MESSAGE_LENGTH);

    let serial = device_id.as_bytes();
    let serial = &serial[..serial.len().min(MAX_SERIAL_LENGTH)];
    buf.put_u8(serial.len() as u8);
    buf.put_slice(serial);

    buf.put_u8(service_type(event));
    buf.put_u16_le(event.sequence_id);
    buf.put_u8(code_map.map_mo(event.event_type));

    let (carrier_id, signal_strength, is_roaming, network_type) = match live {
        Some(info) => (
            info.carrier_id(),
            info.signal_strength,
            info.is_roaming,
            info.network_type,
        ),
        None => (
            event.carrier_id,
            event.signal_strength,
            event.is_roaming,
            event.network_type,
        ),
    };
    buf.put_uint_le(u64::from(carrier_id & 0x00FF_FFFF), 3);
    buf.put_u8(encode_signal(signal_strength, is_roaming));
    buf.put_u8(network_type);

    buf.put_u32_le(event.trigger_time);
    buf.put_u8(event.battery_voltage.min(255) as u8);
    buf.put_u8(event.input_bitfield);

    buf.put_i32_le(encode_coordinate(event.latitude));
    buf.put_i32_le(encode_coordinate(event.longitude));

    buf.put_u16_le(event.speed_cms);
    buf.put_u16_le(event.heading_deg);

    let mut fix = event.fix_type;
    if event.is_fix_historic {
        fix |= fix_type::HISTORIC;
    } else {
        fix &= !fix_type::HISTORIC;
    }
    buf.put_u8(fix);

    buf.put_u16_le(encode_hdop(event.fix_accuracy_m));
    buf.put_u8(event.sat_count);
    buf.put_u32_le(event.odometer_m);
    buf.put_u16_le(event.continuous_idle_s);

    match &event.additional_data {
        Some(data) => {
            let room = MAX_OUTGOING_MESSAGE_LENGTH.saturating_sub(buf.len() + 2);
            let data = &data[..data.len().min(room)];
            buf.put_u16_le(data.len() as u16);
            buf.put_slice(data);
        }
        None if event.event_type.has_legacy_extra() => {
            buf.put_u16_le(1);
            buf.put_u8(event.extra);
        }
        None => {}
    }

    buf.to_vec()
}

/// Service type byte: source id, plus the ack-required flag unless this is an ACK/NAK
///
/// ACK-TOP keeps the flag even though it leaves the queue once sent.
pub fn service_type(event: &TelemetryEvent) -> u8 {
    if matches!(event.event_type, EventType::ACK | EventType::NAK) {
        SOURCE_ID
    } else {
        SOURCE_ID | SERVICE_TYPE_ACK_REQUIRED
    }
}

/// Signal strength as magnitude in dBm, high bit flags roaming
pub fn encode_signal(signal_strength: i16, is_roaming: bool) -> u8 {
    let magnitude = signal_strength.unsigned_abs().min(0x7F) as u8;
    if is_roaming {
        magnitude | SIGNAL_ROAMING_FLAG
    } else {
        magnitude
    }
}

/// Degrees to 1e-7 degree units
pub fn encode_coordinate(degrees: f64) -> i32 {
    (degrees / 0.000_000_1).round() as i32
}

/// Accuracy in meters to the 10 m based HDOP-style field
pub fn encode_hdop(accuracy_m: u32) -> u16 {
    accuracy_m.saturating_sub(10).min(u32::from(u16::MAX)) as u16
}
