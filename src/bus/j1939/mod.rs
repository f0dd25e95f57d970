//! # J1939 Stack
//!
//! CAN node for SAE J1939: discovery, dynamic address claiming, transport
//! protocol reassembly and decoding of the parameter groups the arbiter
//! consumes.
//!
//! The stack is a synchronous state machine. Received frames go in through
//! [`J1939Stack::handle_frame`], timers run from [`BusStack::poll`], and
//! both hand back the [`BusReading`]s they produced.

pub mod address;
pub mod packet;
pub mod pgn;
pub mod transport;

use std::cmp::Ordering;

use tracing::{debug, error, info, trace, warn};

use self::address::{
    build_name, cannot_claim_delay, compare_name_priority, AddressTable, ADDRESS_CLAIM_WAIT_MS,
    ADDRESS_COLLECT_WINDOW_MS,
};
use self::packet::*;
use self::pgn::{OdometerType, ParkingBrakeFilter};
use self::transport::{TpManager, CONNECTION_TIMEOUT_CHECK_MS};
use super::frame::{CanFrame, CanSink};
use super::{ActivityMonitor, BusReading, BusRequest, BusStack, BusStatus, BusType, ACTIVITY_CHECK_MS};
use crate::dtc::DtcCollector;
use crate::scheduler::{Millis, Scheduler};
use crate::state::{key, SharedState};

/// DM1 is broadcast at 1 Hz, the window must cover at least one cycle
pub const DTC_COLLECTION_TIME_MS: Millis = 2000;

/// Bitrate tried when nothing is configured or remembered
pub const DEFAULT_BITRATE: u32 = 250_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Task {
    ActivityCheck,
    ConnectionTimeout,
    AddressCollectWindow,
    AddressClaimSuccess,
    AddressNullResponse,
    DtcCollection,
}

/// Static configuration of the node
#[derive(Debug, Clone)]
pub struct J1939Config {
    /// Identity number placed in the node name
    pub device_id: u32,
    /// Configured bitrate, 0 to use the last one discovered
    pub bitrate: u32,
    /// Parking brake state reported when nodes disagree
    pub parking_brake_conflict_state: bool,
}

pub fn bitrate_to_bus_type(bitrate: u32) -> BusType {
    match bitrate {
        250_000 => BusType::J1939,
        500_000 => BusType::J1939At500k,
        _ => BusType::None,
    }
}

pub fn bus_type_to_bitrate(bus_type: BusType) -> u32 {
    match bus_type {
        BusType::J1939 => 250_000,
        BusType::J1939At500k => 500_000,
        _ => 0,
    }
}

pub struct J1939Stack {
    sink: Box<dyn CanSink>,
    state: SharedState,
    config: J1939Config,
    name: u64,
    scheduler: Scheduler<Task>,

    status: BusStatus,
    bus_type: BusType,
    tx_ready: bool,
    activity: ActivityMonitor,

    my_address: u8,
    attempting_address: u8,
    claim_attempted: bool,
    last_known_address: u8,
    addresses: AddressTable,

    tp: TpManager,
    dtcs: DtcCollector,
    lamps: u8,
    odometer_type: OdometerType,
    parking_brake: ParkingBrakeFilter,

    // Last decoded values, for status logging only
    vin: String,
    odometer_m: Option<u64>,
    fuel_ml: Option<u64>,
    fuel_m_per_l: Option<u64>,
    flag_parking_brake: bool,
    flag_reverse_gear: bool,
    num_collected_dtcs: usize,
}

impl J1939Stack {
    pub fn new(config: J1939Config, sink: Box<dyn CanSink>, state: SharedState) -> Self {
        Self {
            sink,
            state,
            name: build_name(config.device_id),
            parking_brake: ParkingBrakeFilter::new(config.parking_brake_conflict_state),
            config,
            scheduler: Scheduler::new(),
            status: BusStatus::Idle,
            bus_type: BusType::None,
            tx_ready: false,
            activity: ActivityMonitor::default(),
            my_address: ADDRESS_NULL,
            attempting_address: ADDRESS_NULL,
            claim_attempted: false,
            last_known_address: ADDRESS_NULL,
            addresses: AddressTable::default(),
            tp: TpManager::new(),
            dtcs: DtcCollector::new(),
            lamps: 0,
            odometer_type: OdometerType::Unknown,
            vin: String::new(),
            odometer_m: None,
            fuel_ml: None,
            fuel_m_per_l: None,
            flag_parking_brake: false,
            flag_reverse_gear: false,
            num_collected_dtcs: 0,
        }
    }

    pub fn name(&self) -> u64 {
        self.name
    }

    pub fn my_address(&self) -> u8 {
        self.my_address
    }

    pub fn is_high_res_odometer_present(&self) -> bool {
        self.odometer_type == OdometerType::HiRes
    }

    /// Bitrate to open the CAN transport with
    ///
    /// The configured bitrate wins, then the last bus type discovered, then the default.
    pub fn start_bitrate(&self) -> u32 {
        if self.config.bitrate != 0 {
            return self.config.bitrate;
        }
        let remembered = u8::try_from(self.state.read_int(key::J1939_BUS_TYPE)).unwrap_or(0);
        match bus_type_to_bitrate(BusType::from_bits(remembered)) {
            0 => DEFAULT_BITRATE,
            bitrate => bitrate,
        }
    }

    fn set_status(&mut self, status: BusStatus) {
        if self.status != status {
            debug!(bus = %self.bus_type, "J1939 status {:?} -> {:?}", self.status, status);
        }
        self.status = status;
    }

    fn send_packet(&mut self, packet: &Packet) {
        self.send_packet_with_length(packet, 8);
    }

    fn send_packet_with_length(&mut self, packet: &Packet, length: usize) {
        let frame = packet.to_frame(length);
        trace!("J1939 --> {}", frame);
        if !self.sink.send(frame) {
            warn!("CAN transport refused frame");
        }
    }

    /// The transport can transmit at `bitrate`: remember the bus and claim an address
    pub fn bus_ready(&mut self, bitrate: u32, now: Millis) {
        if self.tx_ready {
            return;
        }
        debug!("CAN transmit ready at {} b/s", bitrate);
        self.tx_ready = true;

        let bus_type = bitrate_to_bus_type(bitrate);
        if bus_type == BusType::None {
            error!("Transport reports unknown CAN bitrate {}", bitrate);
        } else {
            self.state.write_int(key::J1939_BUS_TYPE, i64::from(bus_type.bits()));
            self.bus_type = bus_type;
        }

        self.start_claiming_address(self.last_known_address, now);
    }

    // Address claiming

    fn start_claiming_address(&mut self, preferred_address: u8, now: Millis) {
        self.my_address = ADDRESS_NULL;
        self.attempting_address = ADDRESS_NULL;
        self.set_status(BusStatus::ClaimingAddress);

        if preferred_address != ADDRESS_NULL {
            debug!("Attempting to claim preferred J1939 address {}", preferred_address);
            self.send_claimed_address(preferred_address, now);
            return;
        }

        debug!("Attempting to claim an arbitrary J1939 address");
        self.request_all_addresses(now);
    }

    fn stop_claiming_address(&mut self) {
        self.scheduler.cancel(Task::AddressCollectWindow);
        self.scheduler.cancel(Task::AddressClaimSuccess);
        self.scheduler.cancel(Task::AddressNullResponse);
    }

    fn request_all_addresses(&mut self, now: Millis) {
        self.addresses.reset();

        let mut packet = Packet::new(PF_REQUEST, ADDRESS_GLOBAL, ADDRESS_NULL);
        packet.data[..3].copy_from_slice(&[0, PF_CLAIMED_ADDRESS, 0]);
        self.send_packet_with_length(&packet, 3);

        self.scheduler
            .schedule(Task::AddressCollectWindow, ADDRESS_COLLECT_WINDOW_MS, now);
    }

    /// Broadcast a claim; claiming the null address means "cannot claim"
    fn send_claimed_address(&mut self, address: u8, now: Millis) {
        self.scheduler.cancel(Task::AddressClaimSuccess);
        self.scheduler.cancel(Task::AddressNullResponse);

        let mut packet = Packet::new(PF_CLAIMED_ADDRESS, ADDRESS_GLOBAL, address);
        packet.data = self.name.to_le_bytes();
        self.send_packet(&packet);

        if address != ADDRESS_NULL {
            self.attempting_address = address;
            self.scheduler
                .schedule(Task::AddressClaimSuccess, ADDRESS_CLAIM_WAIT_MS, now);
        }
    }

    fn abort_claim_attempt(&mut self) {
        if self.attempting_address == ADDRESS_NULL {
            return;
        }
        debug!("Aborting outstanding attempt on address {}", self.attempting_address);
        self.attempting_address = ADDRESS_NULL;
        self.scheduler.cancel(Task::AddressClaimSuccess);
        self.claim_attempted = true;
    }

    fn address_collect_window_expired(&mut self, now: Millis, readings: &mut Vec<BusReading>) {
        match self.addresses.select() {
            Some(address) => {
                info!("Attempting to claim address {}", address);
                self.send_claimed_address(address, now);
            }
            None => {
                error!("Unable to find an available J1939 address");
                self.my_address = ADDRESS_NULL;
                self.claim_attempted = true;
                self.send_claimed_address(ADDRESS_NULL, now);
                self.set_status(BusStatus::Failed);
                readings.push(BusReading::AddressUnavailable);
            }
        }
    }

    fn address_claim_succeeded(&mut self, readings: &mut Vec<BusReading>) {
        self.claim_attempted = true;
        self.my_address = self.attempting_address;
        self.attempting_address = ADDRESS_NULL;
        self.last_known_address = self.my_address;

        self.state
            .write_int(key::J1939_BUS_ADDRESS, i64::from(self.my_address));

        self.set_status(BusStatus::Up);
        info!("Claimed J1939 address {}", self.my_address);
        readings.push(BusReading::AddressClaimed(self.my_address));
    }

    fn receive_request_address(&mut self, now: Millis) {
        if self.my_address == ADDRESS_NULL {
            // only answer "cannot claim" after a claim was actually tried
            if !self.claim_attempted {
                return;
            }
            self.scheduler
                .schedule(Task::AddressNullResponse, cannot_claim_delay(), now);
            return;
        }
        self.send_claimed_address(self.my_address, now);
    }

    fn receive_claimed_address(&mut self, address: u8, name: u64, now: Millis) {
        if address != self.my_address && address != self.attempting_address {
            return;
        }
        if address == ADDRESS_NULL {
            return;
        }

        if compare_name_priority(self.name, name) == Ordering::Less {
            debug!(
                "J1939 address battle won ({:X} vs {:X}), re-asserting",
                self.name, name
            );
            self.send_claimed_address(address, now);
        } else {
            info!(
                "J1939 address battle lost ({:X} vs {:X}), claiming a new address",
                self.name, name
            );
            self.tp.clear();
            self.abort_claim_attempt();
            self.start_claiming_address(ADDRESS_NULL, now);
        }
    }

    // Requests

    fn send_request_pgn(&mut self, pgn: u32) -> bool {
        if self.my_address == ADDRESS_NULL {
            return false;
        }
        let mut packet = Packet::new(PF_REQUEST, ADDRESS_GLOBAL, self.my_address);
        put_le(&mut packet.data, 0, 3, u64::from(pgn));
        self.send_packet_with_length(&packet, 3);
        true
    }

    // Receive

    /// Process one received CAN frame
    pub fn handle_frame(&mut self, frame: &CanFrame, now: Millis) -> Vec<BusReading> {
        let mut readings = Vec::new();
        let packet = Packet::from_frame(frame);

        self.status = self.activity.frame_received(self.status);

        if self.my_address != ADDRESS_NULL
            && packet.source_address == self.my_address
            && packet.protocol_format != PF_CLAIMED_ADDRESS
        {
            debug!("J1939 <-- {} address imposter detected", frame);
            self.send_claimed_address(self.my_address, now);
            return readings;
        }

        self.addresses.mark_in_use(packet.source_address);

        if packet.is_addressed()
            && packet.destination_address != self.my_address
            && packet.destination_address != ADDRESS_GLOBAL
        {
            return readings;
        }

        trace!("J1939 <-- {}", frame);

        let (sa, da) = (packet.source_address, packet.destination_address);
        match packet.protocol_format {
            PF_REQUEST => {
                if packet.data[..3] == [0, PF_CLAIMED_ADDRESS, 0] {
                    self.receive_request_address(now);
                    return readings;
                }
            }
            PF_CLAIMED_ADDRESS => {
                self.receive_claimed_address(sa, u64::from_le_bytes(packet.data), now);
                return readings;
            }
            PF_CONNECTION_MANAGE => {
                let replies = self
                    .tp
                    .receive_connection_manage(sa, da, &packet.data, self.my_address, now);
                for reply in &replies {
                    self.send_packet(reply);
                }
                return readings;
            }
            PF_CONNECTION_DATA => {
                let outcome = self
                    .tp
                    .receive_connection_data(sa, da, &packet.data, self.my_address, now);
                if let Some(message) = outcome.completed {
                    debug!(
                        "J1939 TP data <-- {:02X} ({:04X}) {} bytes",
                        message.source_address,
                        message.pgn,
                        message.data.len()
                    );
                    self.parse_pgn(message.pgn, &message.data, now, &mut readings);
                }
                for reply in &outcome.replies {
                    self.send_packet(reply);
                }
                return readings;
            }
            _ => {}
        }

        match packet.pgn() {
            PGN_FAULT_DM1 | PGN_ODOMETER_HIRES | PGN_ODOMETER_LORES | PGN_FUEL_CONSUMPTION
            | PGN_FUEL_ECONOMY | PGN_PARKING | PGN_GEAR => {
                let pgn = packet.pgn();
                let length = frame.data.len().min(8);
                self.parse_pgn(pgn, &packet.data[..length], now, &mut readings);
            }
            _ => {}
        }

        readings
    }

    fn parse_pgn(&mut self, pgn: u32, data: &[u8], now: Millis, readings: &mut Vec<BusReading>) {
        match pgn {
            PGN_VIN => {
                let vin = pgn::parse_vin(data);
                self.vin = vin.clone();
                readings.push(BusReading::Vin(vin));
            }
            PGN_FAULT_DM1 => {
                if self.dtcs.begin() {
                    self.lamps = 0;
                    self.scheduler
                        .schedule(Task::DtcCollection, DTC_COLLECTION_TIME_MS, now);
                }
                let dm1 = pgn::parse_dm1(data);
                self.lamps |= dm1.lamps;
                for code in dm1.codes {
                    self.dtcs.add(code);
                }
            }
            PGN_ODOMETER_HIRES => {
                if let Some(meters) = pgn::parse_odometer_hires(data) {
                    self.odometer_type.accept(OdometerType::HiRes);
                    self.odometer_m = Some(meters);
                    readings.push(BusReading::OdometerMeters(meters));
                }
            }
            PGN_ODOMETER_LORES => {
                if let Some(meters) = pgn::parse_odometer_lores(data) {
                    if self.odometer_type.accept(OdometerType::LoRes) {
                        self.odometer_m = Some(meters);
                        readings.push(BusReading::OdometerMeters(meters));
                    }
                }
            }
            PGN_FUEL_CONSUMPTION => {
                if let Some(ml) = pgn::parse_fuel_consumption(data) {
                    self.fuel_ml = Some(ml);
                    readings.push(BusReading::FuelConsumedMl(ml));
                }
            }
            PGN_FUEL_ECONOMY => {
                if let Some(m_per_l) = pgn::parse_fuel_economy(data) {
                    self.fuel_m_per_l = Some(m_per_l);
                    readings.push(BusReading::FuelEconomyMPerL(m_per_l));
                }
            }
            PGN_PARKING => {
                if let Some(on) = pgn::parse_parking_brake(data) {
                    if let Some(state) = self.parking_brake.push(on) {
                        self.flag_parking_brake = state;
                        readings.push(BusReading::ParkingBrake(state));
                    }
                }
            }
            PGN_GEAR => {
                if let Some(reverse) = pgn::parse_reverse_gear(data) {
                    self.flag_reverse_gear = reverse;
                    readings.push(BusReading::ReverseGear(reverse));
                }
            }
            _ => {}
        }
    }
}

impl BusStack for J1939Stack {
    fn bus_type(&self) -> BusType {
        self.bus_type
    }

    fn start(&mut self, now: Millis) {
        debug!("Starting J1939");
        self.set_status(BusStatus::Idle);
        self.bus_type = BusType::None;
        self.tx_ready = false;

        self.claim_attempted = false;
        self.my_address = ADDRESS_NULL;
        self.attempting_address = ADDRESS_NULL;

        self.last_known_address = match u8::try_from(self.state.read_int(key::J1939_BUS_ADDRESS)) {
            Ok(0) | Err(_) => ADDRESS_NULL,
            Ok(address) => address,
        };

        self.activity.reset();
        self.scheduler
            .schedule(Task::ActivityCheck, ACTIVITY_CHECK_MS, now);
        self.scheduler
            .schedule(Task::ConnectionTimeout, CONNECTION_TIMEOUT_CHECK_MS, now);

        self.set_status(BusStatus::Discover);
    }

    fn stop(&mut self) {
        debug!("Stopping J1939");
        self.stop_claiming_address();
        self.dtcs.stop();
        self.tp.clear();
        self.scheduler.cancel_all();
        self.tx_ready = false;
        self.set_status(BusStatus::Idle);
    }

    fn status(&self) -> BusStatus {
        self.status
    }

    fn next_deadline(&self) -> Option<Millis> {
        self.scheduler.next_deadline()
    }

    fn log_status(&self) {
        let odometer_type = match self.odometer_type {
            OdometerType::LoRes => "(L) ",
            OdometerType::HiRes => "(H) ",
            OdometerType::Unknown => "(?) ",
        };
        info!(
            "{}= {} Addr {} : DTCs {} Lamps {} Odom {} FuelC {} FuelE {} Brake {} Reverse {} VIN {}",
            self.bus_type,
            if self.is_communicating() { "UP" } else { "--" },
            self.my_address,
            self.num_collected_dtcs,
            self.lamps,
            self.odometer_m
                .map_or("?".to_string(), |m| format!("{}{}m", odometer_type, m)),
            self.fuel_ml.map_or("?".to_string(), |v| format!("{}mL", v)),
            self.fuel_m_per_l.map_or("?".to_string(), |v| format!("{}m/L", v)),
            u8::from(self.flag_parking_brake),
            u8::from(self.flag_reverse_gear),
            self.vin
        );
    }

    fn request(&mut self, request: BusRequest) -> bool {
        match request {
            BusRequest::Vin => self.send_request_pgn(PGN_VIN),
            BusRequest::Odometer => {
                if self.is_high_res_odometer_present() {
                    false
                } else {
                    self.send_request_pgn(PGN_ODOMETER_LORES)
                }
            }
            BusRequest::TotalFuel => self.send_request_pgn(PGN_FUEL_CONSUMPTION),
            // DM1 is broadcast unsolicited
            BusRequest::Diagnostics => false,
        }
    }

    fn poll(&mut self, now: Millis) -> Vec<BusReading> {
        let mut readings = Vec::new();

        for task in self.scheduler.take_due(now) {
            match task {
                Task::ActivityCheck => {
                    self.status = self.activity.check(self.status);
                    self.scheduler
                        .schedule(Task::ActivityCheck, ACTIVITY_CHECK_MS, now);
                }
                Task::ConnectionTimeout => {
                    for abort in self.tp.purge(now, self.my_address) {
                        self.send_packet(&abort);
                    }
                    self.scheduler
                        .schedule(Task::ConnectionTimeout, CONNECTION_TIMEOUT_CHECK_MS, now);
                }
                Task::AddressCollectWindow => {
                    self.address_collect_window_expired(now, &mut readings);
                }
                Task::AddressClaimSuccess => self.address_claim_succeeded(&mut readings),
                Task::AddressNullResponse => {
                    self.send_claimed_address(self.my_address, now);
                }
                Task::DtcCollection => {
                    let codes = self.dtcs.finish();
                    debug!("{} active J1939 DTCs", codes.len());
                    self.num_collected_dtcs = codes.len();
                    readings.push(BusReading::Dtcs(codes));
                }
            }
        }

        readings
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::frame::mocks::RecordingCanSink;
    use crate::bus::j1939::address::ADDRESS_RANGE_LOW;
    use crate::bus::j1939::transport::{TP_CM_BAM, TP_CM_CTS, TP_CM_EOM, TP_CM_RTS};
    use crate::state::StateStore;

    const MY_NAME_ID: u32 = 1000;

    struct Harness {
        stack: J1939Stack,
        sink: RecordingCanSink,
        state: SharedState,
    }

    fn harness_with_state(state: SharedState) -> Harness {
        let sink = RecordingCanSink::new();
        let config = J1939Config {
            device_id: MY_NAME_ID,
            bitrate: 250_000,
            parking_brake_conflict_state: true,
        };
        let stack = J1939Stack::new(config, Box::new(sink.clone()), state.clone());
        Harness { stack, sink, state }
    }

    fn harness() -> Harness {
        harness_with_state(StateStore::in_memory().shared())
    }

    fn frame(pf: u8, ps: u8, sa: u8, data: &[u8]) -> CanFrame {
        let mut packet = Packet::new(pf, ps, sa);
        packet.data[..data.len()].copy_from_slice(data);
        packet.to_frame(8)
    }

    fn claim_frame(sa: u8, name: u64) -> CanFrame {
        frame(PF_CLAIMED_ADDRESS, ADDRESS_GLOBAL, sa, &name.to_le_bytes())
    }

    /// Start, go through discovery and claim the first free address
    fn claimed(h: &mut Harness) -> u8 {
        h.stack.start(0);
        h.stack.bus_ready(250_000, 0);
        h.stack.poll(ADDRESS_COLLECT_WINDOW_MS);
        let readings = h.stack.poll(ADDRESS_COLLECT_WINDOW_MS + ADDRESS_CLAIM_WAIT_MS);
        h.sink.take();
        match readings.as_slice() {
            [BusReading::AddressClaimed(address)] => *address,
            other => panic!("unexpected readings {:?}", other),
        }
    }

    #[test]
    fn test_start_enters_discover() {
        let mut h = harness();
        h.stack.start(0);
        assert_eq!(h.stack.status(), BusStatus::Discover);
        assert!(h.sink.frames().is_empty(), "Nothing sent before the bus is ready");
    }

    #[test]
    fn test_bus_ready_requests_addresses() {
        let mut h = harness();
        h.stack.start(0);
        h.stack.bus_ready(500_000, 0);

        assert_eq!(h.stack.status(), BusStatus::ClaimingAddress);
        assert_eq!(h.stack.bus_type(), BusType::J1939At500k);
        assert_eq!(h.state.read_int(key::J1939_BUS_TYPE), 2);

        let frames = h.sink.frames();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].id, 0x18EA_FFFE, "Request from null to global");
        assert_eq!(frames[0].data, vec![0x00, 0xEE, 0x00]);
    }

    #[test]
    fn test_claims_lowest_free_address() {
        let mut h = harness();
        h.stack.start(0);
        h.stack.bus_ready(250_000, 0);
        h.sink.take();

        h.stack.handle_frame(&claim_frame(ADDRESS_RANGE_LOW, 1), 100);
        h.stack.handle_frame(&claim_frame(ADDRESS_RANGE_LOW + 1, 2), 200);
        assert!(h.stack.poll(ADDRESS_COLLECT_WINDOW_MS - 1).is_empty());

        h.stack.poll(ADDRESS_COLLECT_WINDOW_MS);
        let frames = h.sink.take();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].id & 0xFF, u32::from(ADDRESS_RANGE_LOW + 2));
        assert_eq!(frames[0].data, h.stack.name().to_le_bytes().to_vec());

        let readings = h.stack.poll(ADDRESS_COLLECT_WINDOW_MS + ADDRESS_CLAIM_WAIT_MS);
        assert_eq!(readings, vec![BusReading::AddressClaimed(ADDRESS_RANGE_LOW + 2)]);
        assert_eq!(h.stack.status(), BusStatus::Up);
        assert_eq!(h.state.read_int(key::J1939_BUS_ADDRESS), 130);
    }

    #[test]
    fn test_restart_prefers_last_address() {
        let state = StateStore::in_memory().shared();
        state.write_int(key::J1939_BUS_ADDRESS, 140);
        let mut h = harness_with_state(state);
        h.stack.start(0);
        h.stack.bus_ready(250_000, 0);

        let frames = h.sink.take();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].id, 0x18EE_FF8C, "Claim of 140 sent without a request");

        h.stack.poll(ADDRESS_CLAIM_WAIT_MS);
        assert_eq!(h.stack.my_address(), 140);
    }

    #[test]
    fn test_tie_break_higher_priority_reasserts() {
        let mut h = harness();
        let address = claimed(&mut h);

        let weaker = h.stack.name() + 2;
        h.stack.handle_frame(&claim_frame(address, weaker), 5000);

        let frames = h.sink.take();
        assert_eq!(frames.len(), 1, "Same claim sent again");
        assert_eq!(frames[0].id & 0xFF, u32::from(address));
        assert_eq!(frames[0].data, h.stack.name().to_le_bytes().to_vec());
        assert_eq!(h.stack.my_address(), address);
        h.stack.poll(5000 + ADDRESS_CLAIM_WAIT_MS);
        assert_eq!(h.stack.status(), BusStatus::Up);
    }

    #[test]
    fn test_tie_break_lower_priority_surrenders() {
        let mut h = harness();
        let address = claimed(&mut h);

        let stronger = h.stack.name() - 2;
        h.stack.handle_frame(&claim_frame(address, stronger), 5000);

        assert_eq!(h.stack.my_address(), ADDRESS_NULL);
        assert_eq!(h.stack.status(), BusStatus::ClaimingAddress);
        let frames = h.sink.take();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].id, 0x18EA_FFFE, "Restarted with a request, no preferred address");

        h.stack.handle_frame(&claim_frame(address, stronger), 5100);
        h.stack.poll(5000 + ADDRESS_COLLECT_WINDOW_MS);
        let frames = h.sink.take();
        assert_eq!(frames[0].id & 0xFF, u32::from(address) + 1, "Winner's address now in use");
    }

    #[test]
    fn test_address_exhaustion_fails() {
        let mut h = harness();
        h.stack.start(0);
        h.stack.bus_ready(250_000, 0);
        for address in ADDRESS_RANGE_LOW..=address::ADDRESS_RANGE_HIGH {
            h.stack.handle_frame(&claim_frame(address, 1), 10);
        }
        h.sink.take();

        let readings = h.stack.poll(ADDRESS_COLLECT_WINDOW_MS);
        assert_eq!(readings, vec![BusReading::AddressUnavailable]);
        assert_eq!(h.stack.status(), BusStatus::Failed);
        let frames = h.sink.take();
        assert_eq!(frames[0].id, 0x18EE_FFFE, "Cannot claim from null");

        let request = frame(PF_REQUEST, ADDRESS_GLOBAL, 0x20, &[0, 0xEE, 0]);
        h.stack.handle_frame(&request, 2000);
        assert!(h.sink.frames().is_empty(), "Response is delayed");
        h.stack.poll(2000 + address::ADDRESS_MAX_CANNOT_CLAIM_DELAY_MS);
        let frames = h.sink.take();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].id, 0x18EE_FFFE);
    }

    #[test]
    fn test_no_cannot_claim_before_any_attempt() {
        let mut h = harness();
        h.stack.start(0);
        h.stack.bus_ready(250_000, 0);
        h.sink.take();

        let request = frame(PF_REQUEST, ADDRESS_GLOBAL, 0x20, &[0, 0xEE, 0]);
        h.stack.handle_frame(&request, 100);
        h.stack.poll(100 + address::ADDRESS_MAX_CANNOT_CLAIM_DELAY_MS);
        assert!(h.sink.frames().is_empty());
    }

    #[test]
    fn test_address_request_answered_when_up() {
        let mut h = harness();
        let address = claimed(&mut h);
        let request = frame(PF_REQUEST, ADDRESS_GLOBAL, 0x20, &[0, 0xEE, 0]);
        h.stack.handle_frame(&request, 4000);
        let frames = h.sink.take();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].id & 0xFF, u32::from(address));
    }

    #[test]
    fn test_imposter_triggers_reclaim() {
        let mut h = harness();
        let address = claimed(&mut h);
        let readings = h.stack.handle_frame(&frame(0xFE, 0xC1, address, &[0x10, 0, 0, 0]), 4000);
        assert!(readings.is_empty(), "Imposter frame not parsed");
        let frames = h.sink.take();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].id, 0x18EE_FF00 | u32::from(address));
    }

    #[test]
    fn test_frames_for_other_nodes_ignored() {
        let mut h = harness();
        claimed(&mut h);
        let rts = [TP_CM_RTS, 17, 0, 3, 0xFF, 0xEC, 0xFE, 0x00];
        h.stack.handle_frame(&frame(PF_CONNECTION_MANAGE, 0x33, 0x00, &rts), 4000);
        assert!(h.sink.frames().is_empty());
    }

    #[test]
    fn test_vin_over_transport_protocol() {
        let mut h = harness();
        let me = claimed(&mut h);

        let rts = [TP_CM_RTS, 18, 0, 3, 0xFF, 0xEC, 0xFE, 0x00];
        h.stack.handle_frame(&frame(PF_CONNECTION_MANAGE, me, 0x00, &rts), 3000);
        assert_eq!(h.sink.take()[0].data[0], TP_CM_CTS);

        let vin = b"1FUJGLDR5CLBP8834*";
        let mut readings = Vec::new();
        for (i, chunk) in vin.chunks(7).enumerate() {
            let mut data = vec![(i + 1) as u8];
            data.extend_from_slice(chunk);
            readings.extend(h.stack.handle_frame(&frame(PF_CONNECTION_DATA, me, 0x00, &data), 3010));
        }

        assert_eq!(readings, vec![BusReading::Vin("1FUJGLDR5CLBP8834".to_string())]);
        let frames = h.sink.take();
        let eoms: Vec<_> = frames.iter().filter(|f| f.data[0] == TP_CM_EOM).collect();
        assert_eq!(eoms.len(), 1);
    }

    #[test]
    fn test_dm1_bam_collected_over_window() {
        let mut h = harness();
        claimed(&mut h);

        let bam = [TP_CM_BAM, 10, 0, 2, 0xFF, 0xCA, 0xFE, 0x00];
        h.stack.handle_frame(&frame(PF_CONNECTION_MANAGE, ADDRESS_GLOBAL, 0x00, &bam), 3000);
        h.stack.handle_frame(&frame(PF_CONNECTION_DATA, ADDRESS_GLOBAL, 0x00, &[1, 0x04, 0xFF, 0x64, 0x00, 0x03, 0x01, 0xBE]), 3010);
        h.stack.handle_frame(&frame(PF_CONNECTION_DATA, ADDRESS_GLOBAL, 0x00, &[2, 0x00, 0x04, 0x02, 0, 0, 0, 0]), 3020);

        assert!(h.sink.frames().is_empty(), "BAM is never answered");
        assert!(h.stack.poll(3000 + DTC_COLLECTION_TIME_MS - 1).iter().all(|r| !matches!(r, BusReading::Dtcs(_))));

        let readings = h.stack.poll(3020 + DTC_COLLECTION_TIME_MS);
        let codes = readings
            .iter()
            .find_map(|r| match r {
                BusReading::Dtcs(codes) => Some(codes.clone()),
                _ => None,
            })
            .expect("snapshot reported");
        assert_eq!(codes.iter().map(|c| c.value).collect::<Vec<_>>(), vec![0x0003_0064, 0x0004_00BE]);
    }

    #[test]
    fn test_single_frame_pgns() {
        let mut h = harness();
        claimed(&mut h);

        let r = h.stack.handle_frame(&frame(0xFE, 0xE9, 0x00, &[0, 0, 0, 0, 10, 0, 0, 0]), 3000);
        assert_eq!(r, vec![BusReading::FuelConsumedMl(5000)]);

        let r = h.stack.handle_frame(&frame(0xF0, 0x05, 0x03, &[0, 0, 0, 100, 0, 0, 0, 0]), 3000);
        assert_eq!(r, vec![BusReading::ReverseGear(true)]);

        let r = h.stack.handle_frame(&frame(0xFE, 0xF2, 0x00, &[0, 0, 0, 0, 0x00, 0x04, 0, 0]), 3000);
        assert_eq!(r, vec![BusReading::FuelEconomyMPerL(2000)]);
    }

    #[test]
    fn test_hires_odometer_locks_out_lores() {
        let mut h = harness();
        claimed(&mut h);

        let lores = frame(0xFE, 0xE0, 0x00, &[0, 0, 0, 0, 8, 0, 0, 0]);
        assert_eq!(h.stack.handle_frame(&lores, 3000), vec![BusReading::OdometerMeters(1000)]);
        assert!(h.stack.request(BusRequest::Odometer));

        let hires = frame(0xFE, 0xC1, 0x00, &[100, 0, 0, 0, 0, 0, 0, 0]);
        assert_eq!(h.stack.handle_frame(&hires, 3001), vec![BusReading::OdometerMeters(500)]);

        assert!(h.stack.handle_frame(&lores, 3002).is_empty());
        assert!(!h.stack.request(BusRequest::Odometer), "No lo-res polling once hi-res seen");
    }

    #[test]
    fn test_parking_brake_debounced() {
        let mut h = harness();
        claimed(&mut h);
        let on = frame(0xFE, 0xF1, 0x00, &[0x04]);
        for i in 0..4 {
            assert!(h.stack.handle_frame(&on, 3000 + i).is_empty());
        }
        assert_eq!(h.stack.handle_frame(&on, 3010), vec![BusReading::ParkingBrake(true)]);

        let unknown = frame(0xFE, 0xF1, 0x00, &[0x0C]);
        assert!(h.stack.handle_frame(&unknown, 3011).is_empty());
    }

    #[test]
    fn test_requests_need_an_address() {
        let mut h = harness();
        h.stack.start(0);
        assert!(!h.stack.request(BusRequest::Vin));

        claimed(&mut h);
        assert!(h.stack.request(BusRequest::TotalFuel));
        let frames = h.sink.take();
        assert_eq!(frames[0].data, vec![0xE9, 0xFE, 0x00]);
        assert!(!h.stack.request(BusRequest::Diagnostics));
    }

    #[test]
    fn test_activity_supervision() {
        let mut h = harness();
        claimed(&mut h);
        let t = ADDRESS_COLLECT_WINDOW_MS + ADDRESS_CLAIM_WAIT_MS;

        h.stack.poll(t + 2 * ACTIVITY_CHECK_MS);
        assert_eq!(h.stack.status(), BusStatus::UpNoComm);
        assert!(!h.stack.is_communicating());

        h.stack.handle_frame(&frame(0xFE, 0xF1, 0x00, &[0x0C]), t + 2500);
        assert_eq!(h.stack.status(), BusStatus::Up);
    }

    #[test]
    fn test_stop_cancels_everything() {
        let mut h = harness();
        h.stack.start(0);
        h.stack.bus_ready(250_000, 0);
        h.stack.stop();
        h.sink.take();

        assert!(h.stack.poll(100_000).is_empty());
        assert!(h.sink.frames().is_empty());
        assert_eq!(h.stack.status(), BusStatus::Idle);
    }
}
