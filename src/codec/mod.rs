//! # Binary Telemetry Codec
//!
//! Fixed-layout, little-endian encoding of outbound event messages and
//! decoding of inbound server commands.
//!
//! This module handles:
//! - Outbound event layout (serial, service type, sequence, location, cellular, payload)
//! - Inbound command layout (serial, service type, sequence, event code, payload)
//! - Additional-data payload builders (fuel totals, fault codes)

pub mod protocol;
pub mod encoder;
pub mod decoder;
pub mod payload;
