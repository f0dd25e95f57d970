//! # Vehicle Bus Module
//!
//! Shared types for the J1939 (CAN) and J1587 (J1708) protocol stacks.
//!
//! This module handles:
//! - Bus type identifiers and arbitration priority
//! - Bus status state shared by both stacks
//! - The `BusStack` trait implemented by each protocol node
//! - Decoded readings handed to the engine arbiter
//! - Receive activity supervision (UP / UP_NOCOMM)

pub mod frame;
pub mod gateway;
pub mod j1587;
pub mod j1939;

use std::fmt;

use crate::dtc::DtcCode;
use crate::scheduler::Millis;

/// Interval between receive activity checks
pub const ACTIVITY_CHECK_MS: Millis = 1000;

/// Bus identifiers, also bit positions in the detected/communicating bitfields
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum BusType {
    #[default]
    None = 0,
    /// J1939 at 250 kb/s, also used for J1939 in general
    J1939 = 1,
    J1939At500k = 2,
    J1587 = 4,
}

impl BusType {
    pub fn bits(self) -> u8 {
        self as u8
    }

    pub fn from_bits(value: u8) -> Self {
        match value {
            1 => BusType::J1939,
            2 => BusType::J1939At500k,
            4 => BusType::J1587,
            _ => BusType::None,
        }
    }

    pub fn is_j1939(self) -> bool {
        matches!(self, BusType::J1939 | BusType::J1939At500k)
    }

    /// Whether a reading from `self` may replace one supplied by `current`
    ///
    /// J1939 always wins. J1587 wins over no data, but never over J1939.
    pub fn has_priority_over(self, current: BusType) -> bool {
        if self.is_j1939() {
            return true;
        }
        self == BusType::J1587 && !current.is_j1939()
    }

    pub fn name(self) -> &'static str {
        match self {
            BusType::None => "NONE",
            BusType::J1939 => "J1939-250",
            BusType::J1939At500k => "J1939-500",
            BusType::J1587 => "J1587",
        }
    }
}

impl fmt::Display for BusType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Bus stack status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BusStatus {
    #[default]
    Idle,
    /// Waiting for the transport to report a usable bitrate
    Discover,
    ClaimingAddress,
    Up,
    /// Up, but nothing received during the last activity window
    UpNoComm,
    Failed,
}

/// Data a stack can be asked to poll for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusRequest {
    Vin,
    Odometer,
    TotalFuel,
    Diagnostics,
}

/// Values decoded from the bus, in arbiter units
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusReading {
    Vin(String),
    OdometerMeters(u64),
    FuelConsumedMl(u64),
    FuelEconomyMPerL(u64),
    ParkingBrake(bool),
    ReverseGear(bool),
    /// Snapshot of every code seen during one collection window
    Dtcs(Vec<DtcCode>),
    AddressClaimed(u8),
    /// Address space exhausted, the stack is in `Failed`
    AddressUnavailable,
}

/// Common interface of both protocol stacks
pub trait BusStack {
    fn bus_type(&self) -> BusType;

    fn start(&mut self, now: Millis);

    /// Cancel all timers and connections
    fn stop(&mut self);

    fn status(&self) -> BusStatus;

    /// True only while `Up`
    fn is_communicating(&self) -> bool {
        self.status() == BusStatus::Up
    }

    fn log_status(&self);

    /// Transmit a request for `request`, returns false if not supported or not possible
    fn request(&mut self, request: BusRequest) -> bool;

    /// Run timers due at `now`
    fn poll(&mut self, now: Millis) -> Vec<BusReading>;

    /// Earliest pending timer
    fn next_deadline(&self) -> Option<Millis>;
}

/// Receive activity supervision shared by both stacks
#[derive(Debug, Default, Clone)]
pub struct ActivityMonitor {
    recent_rx: bool,
}

impl ActivityMonitor {
    /// Record a received frame, returns the status to move to
    pub fn frame_received(&mut self, status: BusStatus) -> BusStatus {
        self.recent_rx = true;
        if status == BusStatus::UpNoComm {
            BusStatus::Up
        } else {
            status
        }
    }

    /// Periodic check, returns the status to move to
    pub fn check(&mut self, status: BusStatus) -> BusStatus {
        let next = if !self.recent_rx && status == BusStatus::Up {
            BusStatus::UpNoComm
        } else {
            status
        };
        self.recent_rx = false;
        next
    }

    pub fn reset(&mut self) {
        self.recent_rx = false;
    }
}
