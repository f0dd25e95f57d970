//! # Engine Arbiter
//!
//! Owns the bus stacks and merges what they decode into one vehicle status.
//!
//! This module handles:
//! - Bus priority arbitration per value (J1939 beats J1587 beats nothing)
//! - Change detection, persistence and event generation
//! - DTC reconciliation through [`DtcTracker`]
//! - Periodic polling of the buses and the fuel status ping
//!
//! Events are collected in an outbox and handed back by the public entry
//! points; the caller records them with the delivery engine.

use tracing::{debug, info};

use crate::bus::frame::{CanFrame, J1708Frame};
use crate::bus::j1587::J1587Stack;
use crate::bus::j1939::J1939Stack;
use crate::bus::{BusReading, BusRequest, BusStack, BusType};
use crate::codec::payload::{encode_all_fuel, encode_fault_code};
use crate::dtc::{Dtc, DtcCode, DtcTracker};
use crate::event::{error_extra, EventRecord, EventType};
use crate::scheduler::{Millis, Scheduler};
use crate::state::{key, SharedState};

/// Period of bus polling
pub const POLL_TIME_MS: Millis = 1000;

/// VIN requests per bus after a cold start
pub const NUM_COLD_START_VIN_ATTEMPTS: u8 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Task {
    Poll,
    FuelStatus,
}

/// Arbitrated vehicle values
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VehicleStatus {
    pub vin: String,
    pub odometer_m: u64,
    pub fuel_ml: u64,
    pub fuel_m_per_l: u64,
    pub parking_brake: bool,
    pub reverse_gear: bool,
}

/// Bus that last supplied each value
#[derive(Debug, Clone, Copy, Default)]
struct Sources {
    vin: BusType,
    odometer_m: BusType,
    fuel_ml: BusType,
    fuel_m_per_l: BusType,
    parking_brake: BusType,
    reverse_gear: BusType,
}

pub struct EngineArbiter {
    state: SharedState,
    j1939: Option<J1939Stack>,
    j1587: Option<J1587Stack>,
    scheduler: Scheduler<Task>,
    started: bool,

    status: VehicleStatus,
    sources: Sources,
    dtcs: DtcTracker,

    warm_start: bool,
    j1939_vin_attempts: u8,
    j1587_vin_attempts: u8,
    every_other: u32,
    fuel_status_ms: Millis,

    events: Vec<EventRecord>,
}

impl EngineArbiter {
    /// Restore the last known vehicle status from `state`
    ///
    /// # Arguments
    ///
    /// * `state` - Persisted device state
    /// * `j1939` - J1939 stack, `None` when the bus is disabled
    /// * `j1587` - J1587 stack, `None` when the bus is disabled
    pub fn new(state: SharedState, j1939: Option<J1939Stack>, j1587: Option<J1587Stack>) -> Self {
        let status = VehicleStatus {
            vin: state.read_string(key::STRING_VIN),
            odometer_m: u64::try_from(state.read_int(key::ACTUAL_ODOMETER)).unwrap_or(0),
            fuel_ml: u64::try_from(state.read_int(key::FUEL_CONSUMPTION)).unwrap_or(0),
            fuel_m_per_l: u64::try_from(state.read_int(key::FUEL_ECONOMY)).unwrap_or(0),
            parking_brake: state.read_int(key::FLAG_PARKING_BRAKE) != 0,
            reverse_gear: state.read_int(key::FLAG_REVERSE_GEAR) != 0,
        };
        let dtcs = DtcTracker::from_bytes(&state.read_bytes(key::ARRAY_FAULT_CODES));
        let warm_start = state.read_int(key::ENGINE_WARM_START) != 0;

        Self {
            state,
            j1939,
            j1587,
            scheduler: Scheduler::new(),
            started: false,
            status,
            sources: Sources::default(),
            dtcs,
            warm_start,
            j1939_vin_attempts: 0,
            j1587_vin_attempts: 0,
            every_other: 0,
            fuel_status_ms: 0,
            events: Vec::new(),
        }
    }

    pub fn status(&self) -> &VehicleStatus {
        &self.status
    }

    pub fn active_dtcs(&self) -> &[Dtc] {
        self.dtcs.active()
    }

    pub fn is_enabled(&self) -> bool {
        self.j1939.is_some() || self.j1587.is_some()
    }

    pub fn is_warm_start(&self) -> bool {
        self.warm_start
    }

    pub fn j1939(&self) -> Option<&J1939Stack> {
        self.j1939.as_ref()
    }

    pub fn j1587(&self) -> Option<&J1587Stack> {
        self.j1587.as_ref()
    }

    /// Choose what the next `start` does
    ///
    /// A cold start polls for the VIN again, a warm start trusts the stored one.
    pub fn set_warm_start(&mut self, warm_start: bool) {
        debug!("Warm start set to {}", warm_start);
        self.warm_start = warm_start;
        self.state
            .write_int(key::ENGINE_WARM_START, i64::from(warm_start));
    }

    /// Start the buses and polling
    ///
    /// # Arguments
    ///
    /// * `now` - Current time
    /// * `fuel_status_seconds` - Fuel status ping period, 0 disables it
    pub fn start(&mut self, now: Millis, fuel_status_seconds: u32) {
        if !self.is_enabled() {
            info!("All vehicle buses disabled");
            return;
        }

        info!(
            "Starting engine monitoring ({}){}{}",
            if self.warm_start { "warm" } else { "cold" },
            if self.j1939.is_some() { " J1939" } else { "" },
            if self.j1587.is_some() { " J1587" } else { "" }
        );

        if self.warm_start {
            self.j1939_vin_attempts = 0;
            self.j1587_vin_attempts = 0;
        } else {
            self.j1939_vin_attempts = NUM_COLD_START_VIN_ATTEMPTS;
            self.j1587_vin_attempts = NUM_COLD_START_VIN_ATTEMPTS;
            self.sources.vin = BusType::None;
        }

        if let Some(j1939) = self.j1939.as_mut() {
            j1939.start(now);
        }
        if let Some(j1587) = self.j1587.as_mut() {
            j1587.start(now);
        }

        self.started = true;
        self.scheduler.schedule(Task::Poll, POLL_TIME_MS, now);

        self.fuel_status_ms = Millis::from(fuel_status_seconds) * 1000;
        self.restart_fuel_updates(now);
    }

    pub fn stop(&mut self) {
        debug!("Stopping engine monitoring");
        if let Some(j1587) = self.j1587.as_mut() {
            j1587.stop();
        }
        if let Some(j1939) = self.j1939.as_mut() {
            j1939.stop();
        }
        self.scheduler.cancel_all();
        self.started = false;
    }

    fn restart_fuel_updates(&mut self, now: Millis) {
        self.scheduler.cancel(Task::FuelStatus);
        if self.fuel_status_ms > 0 {
            self.scheduler
                .schedule(Task::FuelStatus, self.fuel_status_ms, now);
        }
    }

    fn emit(&mut self, event: EventRecord) {
        self.events.push(event);
    }

    fn take_events(&mut self) -> Vec<EventRecord> {
        std::mem::take(&mut self.events)
    }

    fn any_bus_communicating(&self) -> bool {
        self.j1939.as_ref().is_some_and(|s| s.is_communicating())
            || self.j1587.as_ref().is_some_and(|s| s.is_communicating())
    }

    /// Bus type J1939 readings are attributed to
    fn j1939_bus(&self) -> BusType {
        match self.j1939.as_ref().map(|s| s.bus_type()) {
            Some(bus) if bus.is_j1939() => bus,
            _ => BusType::J1939,
        }
    }

    // Frame entry points

    pub fn handle_can_frame(&mut self, frame: &CanFrame, now: Millis) -> Vec<EventRecord> {
        if let Some(j1939) = self.j1939.as_mut() {
            let readings = j1939.handle_frame(frame, now);
            let bus = self.j1939_bus();
            self.apply_readings(bus, readings);
        }
        self.take_events()
    }

    pub fn handle_j1708_frame(&mut self, frame: &J1708Frame, now: Millis) -> Vec<EventRecord> {
        if let Some(j1587) = self.j1587.as_mut() {
            let readings = j1587.handle_frame(frame, now);
            self.apply_readings(BusType::J1587, readings);
        }
        self.take_events()
    }

    /// CAN transport can transmit at `bitrate`
    pub fn can_bus_ready(&mut self, bitrate: u32, now: Millis) {
        if let Some(j1939) = self.j1939.as_mut() {
            j1939.bus_ready(bitrate, now);
        }
    }

    /// Run every timer due at `now`, the stacks' first
    pub fn poll(&mut self, now: Millis) -> Vec<EventRecord> {
        if let Some(j1939) = self.j1939.as_mut() {
            let readings = j1939.poll(now);
            let bus = self.j1939_bus();
            self.apply_readings(bus, readings);
        }
        if let Some(j1587) = self.j1587.as_mut() {
            let readings = j1587.poll(now);
            self.apply_readings(BusType::J1587, readings);
        }

        for task in self.scheduler.take_due(now) {
            match task {
                Task::Poll => {
                    self.poll_buses();
                    self.every_other = self.every_other.wrapping_add(1);
                    self.scheduler.schedule(Task::Poll, POLL_TIME_MS, now);
                }
                Task::FuelStatus => {
                    if self.any_bus_communicating() {
                        self.send_fuel_status_update();
                    }
                    self.restart_fuel_updates(now);
                }
            }
        }

        self.take_events()
    }

    /// Earliest time `poll` has work to do, stack timers included
    pub fn next_deadline(&self) -> Option<Millis> {
        [
            self.scheduler.next_deadline(),
            self.j1939.as_ref().and_then(|s| s.next_deadline()),
            self.j1587.as_ref().and_then(|s| s.next_deadline()),
        ]
        .into_iter()
        .flatten()
        .min()
    }

    fn apply_readings(&mut self, bus: BusType, readings: Vec<BusReading>) {
        for reading in readings {
            match reading {
                BusReading::Vin(vin) => {
                    self.check_vin(bus, &vin);
                }
                BusReading::OdometerMeters(m) => {
                    self.check_odometer(bus, m);
                }
                BusReading::FuelConsumedMl(ml) => {
                    self.check_fuel_consumption(bus, ml);
                }
                BusReading::FuelEconomyMPerL(m_per_l) => {
                    self.check_fuel_economy(bus, m_per_l);
                }
                BusReading::ParkingBrake(on) => {
                    self.check_parking_brake(bus, on);
                }
                BusReading::ReverseGear(on) => {
                    self.check_reverse_gear(bus, on);
                }
                BusReading::Dtcs(codes) => {
                    self.check_dtcs(bus, &codes);
                }
                BusReading::AddressClaimed(address) => {
                    debug!(bus = %bus, "Bus address {} claimed", address);
                }
                BusReading::AddressUnavailable => {
                    self.emit(EventRecord::with_extra(
                        EventType::ERROR,
                        error_extra::J1939_NO_ADDRESS_AVAILABLE,
                    ));
                }
            }
        }
    }

    fn poll_buses(&mut self) {
        if !self.started {
            return;
        }

        let vin_needed = self.sources.vin == BusType::None;
        let vin_turn = self.every_other & 1 == 0;

        if let Some(j1939) = self.j1939.as_mut().filter(|s| s.is_communicating()) {
            j1939.log_status();
            if self.j1939_vin_attempts > 0 && vin_needed {
                if vin_turn {
                    j1939.request(BusRequest::Vin);
                    self.j1939_vin_attempts -= 1;
                }
            } else {
                // lo-res odometer is refused by the stack once hi-res is seen
                j1939.request(BusRequest::Odometer);
                j1939.request(BusRequest::TotalFuel);
            }
        }

        if let Some(j1587) = self.j1587.as_mut().filter(|s| s.is_communicating()) {
            j1587.log_status();
            if self.j1587_vin_attempts > 0 && vin_needed {
                if vin_turn {
                    j1587.request(BusRequest::Vin);
                    self.j1587_vin_attempts -= 1;
                }
            } else {
                j1587.request(BusRequest::TotalFuel);
                j1587.request(BusRequest::Diagnostics);
            }
        }

        debug!(
            "DTCs {} Odom {}m FuelC {}mL FuelE {}m/L Brake {} Reverse {}",
            self.dtcs.len(),
            self.status.odometer_m,
            self.status.fuel_ml,
            self.status.fuel_m_per_l,
            u8::from(self.status.parking_brake),
            u8::from(self.status.reverse_gear)
        );
    }

    fn send_fuel_status_update(&mut self) {
        let data = encode_all_fuel(self.status.fuel_ml, self.status.fuel_m_per_l);
        self.emit(EventRecord::with_data(EventType::FUELSTATUS_PING, data));
    }

    // Setters, each returns the arbitrated value

    pub fn check_parking_brake(&mut self, bus: BusType, on: bool) -> bool {
        if !bus.has_priority_over(self.sources.parking_brake) {
            return self.status.parking_brake;
        }
        self.sources.parking_brake = bus;

        if on != self.status.parking_brake {
            self.status.parking_brake = on;
            debug!("Parking brake {}", if on { "on" } else { "off" });
            self.state.write_int(key::FLAG_PARKING_BRAKE, i64::from(on));
            self.emit(EventRecord::new(if on {
                EventType::PARKBRAKE_ON
            } else {
                EventType::PARKBRAKE_OFF
            }));
        }
        self.status.parking_brake
    }

    pub fn check_reverse_gear(&mut self, bus: BusType, on: bool) -> bool {
        if !bus.has_priority_over(self.sources.reverse_gear) {
            return self.status.reverse_gear;
        }
        self.sources.reverse_gear = bus;

        if on != self.status.reverse_gear {
            self.status.reverse_gear = on;
            debug!("Reverse gear {}", if on { "on" } else { "off" });
            self.state.write_int(key::FLAG_REVERSE_GEAR, i64::from(on));
            self.emit(EventRecord::new(if on {
                EventType::REVERSE_ON
            } else {
                EventType::REVERSE_OFF
            }));
        }
        self.status.reverse_gear
    }

    pub fn check_odometer(&mut self, bus: BusType, odometer_m: u64) -> u64 {
        if !bus.has_priority_over(self.sources.odometer_m) {
            return self.status.odometer_m;
        }
        self.sources.odometer_m = bus;

        if odometer_m != self.status.odometer_m {
            self.status.odometer_m = odometer_m;
            self.state
                .write_int(key::ACTUAL_ODOMETER, i64::try_from(odometer_m).unwrap_or(i64::MAX));
        }
        self.status.odometer_m
    }

    pub fn check_fuel_consumption(&mut self, bus: BusType, fuel_ml: u64) -> u64 {
        if !bus.has_priority_over(self.sources.fuel_ml) {
            return self.status.fuel_ml;
        }
        self.sources.fuel_ml = bus;

        if fuel_ml != self.status.fuel_ml {
            self.status.fuel_ml = fuel_ml;
            self.state
                .write_int(key::FUEL_CONSUMPTION, i64::try_from(fuel_ml).unwrap_or(i64::MAX));
        }
        self.status.fuel_ml
    }

    pub fn check_fuel_economy(&mut self, bus: BusType, fuel_m_per_l: u64) -> u64 {
        if !bus.has_priority_over(self.sources.fuel_m_per_l) {
            return self.status.fuel_m_per_l;
        }
        self.sources.fuel_m_per_l = bus;

        if fuel_m_per_l != self.status.fuel_m_per_l {
            self.status.fuel_m_per_l = fuel_m_per_l;
            self.state
                .write_int(key::FUEL_ECONOMY, i64::try_from(fuel_m_per_l).unwrap_or(i64::MAX));
        }
        self.status.fuel_m_per_l
    }

    pub fn check_vin(&mut self, bus: BusType, vin: &str) -> String {
        if !bus.has_priority_over(self.sources.vin) {
            return self.status.vin.clone();
        }
        self.sources.vin = bus;

        // the VIN is known now, later starts need not ask again
        self.set_warm_start(true);

        if vin == self.status.vin {
            debug!("VIN confirmed as {}", vin);
        } else {
            info!("VIN changed to {}", vin);
            self.status.vin = vin.to_string();
            self.state.write_string(key::STRING_VIN, vin);
        }
        self.status.vin.clone()
    }

    /// Reconcile a complete DTC snapshot from `bus`, emitting one event per change
    ///
    /// # Returns
    ///
    /// * `(usize, usize)` - Number of codes added and removed
    pub fn check_dtcs(&mut self, bus: BusType, codes: &[DtcCode]) -> (usize, usize) {
        let values: Vec<u32> = codes.iter().map(|c| c.value).collect();
        let changes = self.dtcs.check(bus, &values);

        for dtc in &changes.removed {
            let data = encode_fault_code(dtc.bus_type.bits(), dtc.value);
            self.emit(EventRecord::with_data(EventType::FAULTCODE_OFF, data));
        }
        for dtc in &changes.added {
            let data = encode_fault_code(dtc.bus_type.bits(), dtc.value);
            self.emit(EventRecord::with_data(EventType::FAULTCODE_ON, data));
        }

        if !changes.is_empty() {
            self.state
                .write_bytes(key::ARRAY_FAULT_CODES, &self.dtcs.to_bytes());
        }

        (changes.added.len(), changes.removed.len())
    }

    /// Events raised by direct setter calls since the last drain
    pub fn drain_events(&mut self) -> Vec<EventRecord> {
        self.take_events()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::frame::mocks::{RecordingCanSink, RecordingJ1708Sink};
    use crate::bus::j1939::J1939Config;
    use crate::bus::BusStatus;
    use crate::state::StateStore;

    fn arbiter() -> (EngineArbiter, SharedState) {
        let state = StateStore::in_memory().shared();
        (EngineArbiter::new(state.clone(), None, None), state)
    }

    fn j1587_arbiter(state: SharedState) -> (EngineArbiter, RecordingJ1708Sink) {
        let sink = RecordingJ1708Sink::new();
        let j1587 = J1587Stack::new(Box::new(sink.clone()));
        (EngineArbiter::new(state, None, Some(j1587)), sink)
    }

    fn event_types(events: &[EventRecord]) -> Vec<EventType> {
        events.iter().map(|e| e.event_type).collect()
    }

    #[test]
    fn test_j1939_value_sticks_over_j1587() {
        let (mut arbiter, state) = arbiter();
        assert_eq!(arbiter.check_odometer(BusType::J1587, 100), 100);
        assert_eq!(arbiter.check_odometer(BusType::J1939, 200), 200);
        assert_eq!(arbiter.check_odometer(BusType::J1587, 300), 200);
        assert_eq!(arbiter.status().odometer_m, 200);
        assert_eq!(state.read_int(key::ACTUAL_ODOMETER), 200);
    }

    #[test]
    fn test_no_event_without_change() {
        let (mut arbiter, state) = arbiter();
        arbiter.check_parking_brake(BusType::J1939, true);
        arbiter.check_parking_brake(BusType::J1939, true);
        arbiter.check_parking_brake(BusType::J1939, false);

        assert_eq!(
            event_types(&arbiter.drain_events()),
            vec![EventType::PARKBRAKE_ON, EventType::PARKBRAKE_OFF]
        );
        assert_eq!(state.read_int(key::FLAG_PARKING_BRAKE), 0);
    }

    #[test]
    fn test_lower_priority_change_ignored() {
        let (mut arbiter, _) = arbiter();
        arbiter.check_reverse_gear(BusType::J1939At500k, true);
        assert!(arbiter.check_reverse_gear(BusType::J1587, false));
        assert_eq!(event_types(&arbiter.drain_events()), vec![EventType::REVERSE_ON]);
    }

    #[test]
    fn test_status_restored_from_state() {
        let state = StateStore::in_memory().shared();
        state.write_int(key::ACTUAL_ODOMETER, 123_456);
        state.write_int(key::FLAG_REVERSE_GEAR, 1);
        state.write_string(key::STRING_VIN, "1FUJGLDR12LM12345");
        state.write_bytes(key::ARRAY_FAULT_CODES, &[1, 0x64, 0x00, 0x03, 0x00]);

        let arbiter = EngineArbiter::new(state, None, None);
        assert_eq!(arbiter.status().odometer_m, 123_456);
        assert!(arbiter.status().reverse_gear);
        assert_eq!(arbiter.status().vin, "1FUJGLDR12LM12345");
        assert_eq!(arbiter.active_dtcs().len(), 1);
        assert_eq!(arbiter.active_dtcs()[0].value, 0x0003_0064);
    }

    #[test]
    fn test_dtc_hysteresis_events() {
        let (mut arbiter, state) = arbiter();
        let code = [DtcCode::new(0x0012_B4C2, 1)];

        assert_eq!(arbiter.check_dtcs(BusType::J1939, &code), (1, 0));
        assert_eq!(arbiter.check_dtcs(BusType::J1939, &code), (0, 0));
        let on = arbiter.drain_events();
        assert_eq!(on.len(), 1);
        assert_eq!(on[0].event_type, EventType::FAULTCODE_ON);
        assert_eq!(on[0].data, Some(vec![1, 0xC2, 0xB4, 0x12, 0x00]));

        assert_eq!(arbiter.check_dtcs(BusType::J1939, &[]), (0, 0));
        assert_eq!(arbiter.check_dtcs(BusType::J1939, &[]), (0, 0));
        assert!(arbiter.drain_events().is_empty(), "Two misses keep the code");

        assert_eq!(arbiter.check_dtcs(BusType::J1939, &[]), (0, 1));
        let off = arbiter.drain_events();
        assert_eq!(event_types(&off), vec![EventType::FAULTCODE_OFF]);
        assert!(state.read_bytes(key::ARRAY_FAULT_CODES).is_empty());
    }

    #[test]
    fn test_dtc_array_persisted_on_change() {
        let (mut arbiter, state) = arbiter();
        arbiter.check_dtcs(BusType::J1587, &[DtcCode::new(0x0004_806E, 0)]);
        assert_eq!(
            state.read_bytes(key::ARRAY_FAULT_CODES),
            vec![4, 0x6E, 0x80, 0x04, 0x00]
        );
    }

    #[test]
    fn test_vin_sets_warm_start() {
        let (mut arbiter, state) = arbiter();
        assert!(!arbiter.is_warm_start());

        arbiter.check_vin(BusType::J1587, "1FUJGLDR12LM12345");
        assert!(arbiter.is_warm_start());
        assert_eq!(state.read_int(key::ENGINE_WARM_START), 1);
        assert_eq!(state.read_string(key::STRING_VIN), "1FUJGLDR12LM12345");

        assert_eq!(arbiter.check_vin(BusType::J1939, "2FUJ"), "2FUJ");
        assert_eq!(arbiter.check_vin(BusType::J1587, "3FUJ"), "2FUJ");
    }

    #[test]
    fn test_address_unavailable_raises_error() {
        let (mut arbiter, _) = arbiter();
        arbiter.apply_readings(BusType::J1939, vec![BusReading::AddressUnavailable]);
        let events = arbiter.drain_events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, EventType::ERROR);
        assert_eq!(events[0].extra, error_extra::J1939_NO_ADDRESS_AVAILABLE);
    }

    #[test]
    fn test_cold_start_polls_vin_every_other_second() {
        let state = StateStore::in_memory().shared();
        let (mut arbiter, sink) = j1587_arbiter(state);
        arbiter.start(0, 0);

        let keepalive = J1708Frame::new(6, 128, vec![84, 0x20]);
        for second in 1..=7 {
            arbiter.handle_j1708_frame(&keepalive, second * POLL_TIME_MS - 1);
            arbiter.poll(second * POLL_TIME_MS);
        }

        let requested: Vec<u8> = sink.frames().iter().map(|f| f.data[1]).collect();
        assert_eq!(
            requested,
            vec![237, 237, 237, 250, 194, 250, 194],
            "Three VIN attempts on even polls, then the normal routine"
        );
    }

    #[test]
    fn test_warm_start_skips_vin() {
        let state = StateStore::in_memory().shared();
        state.write_int(key::ENGINE_WARM_START, 1);
        let (mut arbiter, sink) = j1587_arbiter(state);
        arbiter.start(0, 0);

        arbiter.handle_j1708_frame(&J1708Frame::new(6, 128, vec![84, 0x20]), 500);
        arbiter.poll(POLL_TIME_MS);

        let requested: Vec<u8> = sink.frames().iter().map(|f| f.data[1]).collect();
        assert_eq!(requested, vec![250, 194]);
    }

    #[test]
    fn test_vin_received_stops_vin_polling() {
        let state = StateStore::in_memory().shared();
        let (mut arbiter, sink) = j1587_arbiter(state);
        arbiter.start(0, 0);

        let vin = J1708Frame::new(6, 128, vec![237, 4, b'1', b'F', b'U', b'J']);
        arbiter.handle_j1708_frame(&vin, 500);
        arbiter.poll(POLL_TIME_MS);

        assert_eq!(arbiter.status().vin, "1FUJ");
        let requested: Vec<u8> = sink.frames().iter().map(|f| f.data[1]).collect();
        assert_eq!(requested, vec![250, 194]);
    }

    #[test]
    fn test_fuel_status_ping() {
        let state = StateStore::in_memory().shared();
        let (mut arbiter, _) = j1587_arbiter(state);
        arbiter.start(0, 2);
        arbiter.check_fuel_consumption(BusType::J1587, 4730);

        assert!(arbiter.poll(2000).is_empty(), "No ping while no bus communicates");

        let fuel = J1708Frame::new(6, 128, vec![250, 4, 10, 0, 0, 0]);
        arbiter.handle_j1708_frame(&fuel, 3000);
        let events = arbiter.poll(4000);
        assert_eq!(event_types(&events), vec![EventType::FUELSTATUS_PING]);
        assert_eq!(events[0].data, Some(vec![4, 0, 0, 0, 0, 0]));
    }

    #[test]
    fn test_j1939_claim_failure_event_through_stack() {
        let state = StateStore::in_memory().shared();
        let sink = RecordingCanSink::new();
        let config = J1939Config {
            device_id: 7,
            bitrate: 250_000,
            parking_brake_conflict_state: true,
        };
        let j1939 = J1939Stack::new(config, Box::new(sink.clone()), state.clone());
        let mut arbiter = EngineArbiter::new(state, Some(j1939), None);
        arbiter.start(0, 0);
        arbiter.can_bus_ready(250_000, 0);

        for address in 128u8..=247 {
            let claim = CanFrame::new(0x18EE_FF00 | u32::from(address), vec![0; 8]);
            arbiter.handle_can_frame(&claim, 10);
        }
        let events = arbiter.poll(1250);
        assert_eq!(event_types(&events), vec![EventType::ERROR]);
        assert_eq!(arbiter.j1939().map(|s| s.status()), Some(BusStatus::Failed));
    }

    #[test]
    fn test_next_deadline_includes_stack_timers() {
        let state = StateStore::in_memory().shared();
        let config = J1939Config {
            device_id: 7,
            bitrate: 0,
            parking_brake_conflict_state: true,
        };
        let j1939 = J1939Stack::new(config, Box::new(RecordingCanSink::new()), state.clone());
        let mut arbiter = EngineArbiter::new(state, Some(j1939), None);
        assert_eq!(arbiter.next_deadline(), None);

        arbiter.start(0, 0);
        // TP timeout sweep runs before the 1 s poll
        assert_eq!(arbiter.next_deadline(), Some(500));
    }

    #[test]
    fn test_stop_cancels_polling() {
        let state = StateStore::in_memory().shared();
        let (mut arbiter, sink) = j1587_arbiter(state);
        arbiter.start(0, 1);
        arbiter.handle_j1708_frame(&J1708Frame::new(6, 128, vec![84, 0x20]), 500);
        arbiter.stop();

        assert!(arbiter.poll(10_000).is_empty());
        assert!(sink.frames().is_empty());
        assert_eq!(arbiter.next_deadline(), None);
    }
}
