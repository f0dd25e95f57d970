//! # Diagnostic Trouble Codes
//!
//! Active fault code set shared by both vehicle buses, plus the per-bus
//! collection window that turns a stream of sightings into one snapshot.
//!
//! A code only leaves the active set after it is missing from
//! [`REMOVAL_COUNT`] consecutive snapshots of the bus that reported it.

use tracing::debug;

use crate::bus::BusType;

/// Consecutive snapshots a code must be missing from before it is removed
pub const REMOVAL_COUNT: u8 = 3;

/// Bytes per code in the persisted array: bus type then value (LE)
pub const DTC_ARRAY_ENTRY_SIZE: usize = 5;

/// One code as parsed from the bus
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DtcCode {
    /// Bus-specific packed code, sent to the server as is
    pub value: u32,
    pub occurrence_count: u8,
}

impl DtcCode {
    pub fn new(value: u32, occurrence_count: u8) -> Self {
        Self { value, occurrence_count }
    }
}

/// Active code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dtc {
    pub value: u32,
    pub bus_type: BusType,
    pub removal_count: u8,
}

impl Dtc {
    fn to_bytes(self) -> [u8; DTC_ARRAY_ENTRY_SIZE] {
        let v = self.value.to_le_bytes();
        [self.bus_type.bits(), v[0], v[1], v[2], v[3]]
    }

    fn from_bytes(entry: &[u8]) -> Self {
        Self {
            bus_type: BusType::from_bits(entry[0]),
            value: u32::from_le_bytes([entry[1], entry[2], entry[3], entry[4]]),
            removal_count: 0,
        }
    }
}

/// Result of reconciling one snapshot
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DtcChanges {
    pub added: Vec<Dtc>,
    pub removed: Vec<Dtc>,
}

impl DtcChanges {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Active code set with removal hysteresis
#[derive(Debug, Default, Clone)]
pub struct DtcTracker {
    active: Vec<Dtc>,
}

impl DtcTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restore from the persisted array, ignoring a trailing partial entry
    pub fn from_bytes(data: &[u8]) -> Self {
        let active = data
            .chunks_exact(DTC_ARRAY_ENTRY_SIZE)
            .map(Dtc::from_bytes)
            .collect();
        Self { active }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.active.iter().flat_map(|dtc| dtc.to_bytes()).collect()
    }

    pub fn active(&self) -> &[Dtc] {
        &self.active
    }

    pub fn len(&self) -> usize {
        self.active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }

    /// Reconcile a complete snapshot of the codes reported by `bus`
    ///
    /// Only codes from the same bus are candidates for removal.
    ///
    /// # Arguments
    ///
    /// * `bus` - Bus the snapshot came from
    /// * `snapshot` - Every code value seen on that bus during the window
    ///
    /// # Returns
    ///
    /// * `DtcChanges` - Codes added and removed by this snapshot
    pub fn check(&mut self, bus: BusType, snapshot: &[u32]) -> DtcChanges {
        let mut changes = DtcChanges::default();

        self.active.retain_mut(|dtc| {
            if dtc.bus_type != bus || snapshot.contains(&dtc.value) {
                return true;
            }
            dtc.removal_count += 1;
            if dtc.removal_count >= REMOVAL_COUNT {
                debug!(bus = %bus, "Removing DTC {:08X}", dtc.value);
                changes.removed.push(*dtc);
                false
            } else {
                true
            }
        });

        for &value in snapshot {
            match self
                .active
                .iter_mut()
                .find(|dtc| dtc.value == value && dtc.bus_type == bus)
            {
                Some(existing) => existing.removal_count = 0,
                None => {
                    debug!(bus = %bus, "Adding DTC {:08X}", value);
                    let dtc = Dtc {
                        value,
                        bus_type: bus,
                        removal_count: 0,
                    };
                    self.active.push(dtc);
                    changes.added.push(dtc);
                }
            }
        }

        changes
    }
}

/// Collection window state for one bus
///
/// The owning stack schedules the window when [`DtcCollector::begin`]
/// returns true and calls [`DtcCollector::finish`] when it expires.
#[derive(Debug, Default, Clone)]
pub struct DtcCollector {
    collecting: bool,
    codes: Vec<DtcCode>,
}

impl DtcCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a window, returns true if one was not already open
    pub fn begin(&mut self) -> bool {
        if self.collecting {
            return false;
        }
        self.collecting = true;
        self.codes.clear();
        true
    }

    pub fn is_collecting(&self) -> bool {
        self.collecting
    }

    /// Record a sighting, a repeated value only refreshes its occurrence count
    pub fn add(&mut self, code: DtcCode) {
        match self.codes.iter_mut().find(|c| c.value == code.value) {
            Some(existing) => existing.occurrence_count = code.occurrence_count,
            None => self.codes.push(code),
        }
    }

    /// Close the window and return the snapshot
    pub fn finish(&mut self) -> Vec<DtcCode> {
        self.collecting = false;
        std::mem::take(&mut self.codes)
    }

    /// Drop an open window without reporting it
    pub fn stop(&mut self) {
        self.collecting = false;
        self.codes.clear();
    }
}
