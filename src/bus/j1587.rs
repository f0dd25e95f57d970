//! # J1587 Stack
//!
//! Listen-mostly node on a J1708 serial bus. Each frame carries one or more
//! PID records; requests are single-PID frames sent from a fixed MID.

use tracing::{debug, error, info, trace, warn};

use super::frame::{J1708Frame, J1708Sink};
use super::{ActivityMonitor, BusReading, BusRequest, BusStack, BusStatus, BusType, ACTIVITY_CHECK_MS};
use crate::dtc::{DtcCode, DtcCollector};
use crate::error::{Result, TelematicsError};
use crate::scheduler::{Millis, Scheduler};

/// DTCs are broadcast about every 15 s, the window must be longer
pub const DTC_COLLECTION_TIME_MS: Millis = 20_000;

/// MID requests are sent from
pub const ADDRESS_MID: u8 = 180;
/// MIDs below this belong to other protocols sharing J1708
pub const MID_J1587_MINIMUM: u8 = 128;
/// Requests go out at the lowest priority
pub const REQUEST_PRIORITY: u8 = 8;

pub const PID_REQUEST: u8 = 0;
pub const PID_DIAGNOSTICS: u16 = 194;
pub const PID_VIN: u16 = 237;
pub const PID_ODOMETER: u16 = 245;
pub const PID_FUEL_CONSUMPTION: u16 = 250;
/// Escape character, not a PID
pub const PID_ESCAPE: u8 = 254;
/// As first byte: every PID in the frame is on the second page (+256)
pub const PID_EXTENSION: u8 = 255;

const PID_MAX_ONE_BYTE: u8 = 127;
const PID_MAX_TWO_BYTE: u8 = 191;

const ODOMETER_M_PER_BIT: u64 = 161;
const FUEL_ML_PER_BIT: u64 = 473;

/// One PID and its value bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PidRecord<'a> {
    pub pid: u16,
    pub data: &'a [u8],
}

/// Iterator over the PID records of a frame
///
/// Yields an error and stops at the first framing problem; records before it
/// are still yielded.
pub struct PidRecords<'a> {
    data: &'a [u8],
    pos: usize,
    page_offset: u16,
    done: bool,
}

impl<'a> PidRecords<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        let (pos, page_offset) = match data.first() {
            Some(&PID_EXTENSION) => (1, 256),
            _ => (0, 0),
        };
        Self {
            data,
            pos,
            page_offset,
            done: false,
        }
    }

    fn fail(&mut self, message: String) -> Option<Result<PidRecord<'a>>> {
        self.done = true;
        Some(Err(TelematicsError::Bus(message)))
    }
}

impl<'a> Iterator for PidRecords<'a> {
    type Item = Result<PidRecord<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done || self.pos >= self.data.len() {
            return None;
        }

        let raw = self.data[self.pos];
        let pid = u16::from(raw) + self.page_offset;
        self.pos += 1;

        let length = match raw {
            PID_ESCAPE => {
                return self.fail(format!("escape character at [{}]", self.pos));
            }
            0..=PID_MAX_ONE_BYTE => 1,
            0x80..=PID_MAX_TWO_BYTE => 2,
            PID_EXTENSION => 0,
            _ => {
                let Some(&length) = self.data.get(self.pos) else {
                    return self.fail(format!("missing length at [{}] for PID {}", self.pos, pid));
                };
                self.pos += 1;
                usize::from(length)
            }
        };

        let Some(data) = self.data.get(self.pos..self.pos + length) else {
            return self.fail(format!(
                "expected {} bytes at [{}] for PID {}",
                length, self.pos, pid
            ));
        };
        self.pos += length;

        Some(Ok(PidRecord { pid, data }))
    }
}

/// One 2 or 3 byte trouble code, returns the code and the bytes used
///
/// Byte 1 is the PID/SID, byte 2 the code character; bit 8 of byte 2 means
/// an occurrence count byte follows. The value is `00 DCC MID PID` with the
/// status bits of the code character masked off.
pub fn parse_trouble_code(mid: u8, data: &[u8]) -> Option<(DtcCode, usize)> {
    let (&pid, &character) = (data.first()?, data.get(1)?);
    if pid == 0x00 || pid == 0xFF {
        return None;
    }

    let (occurrence_count, used) = if character & 0x80 != 0 {
        (*data.get(2)?, 3)
    } else {
        (0, 2)
    };

    let value = (u32::from(character & 0x3F) << 16) | (u32::from(mid) << 8) | u32::from(pid);
    Some((DtcCode::new(value, occurrence_count), used))
}

/// Every trouble code in a diagnostics PID
pub fn parse_diagnostics(mid: u8, data: &[u8]) -> Vec<DtcCode> {
    let mut codes = Vec::new();
    let mut pos = 0;
    while pos < data.len() {
        match parse_trouble_code(mid, &data[pos..]) {
            Some((code, used)) => {
                codes.push(code);
                pos += used;
            }
            None => break,
        }
    }
    codes
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Task {
    ActivityCheck,
    DtcCollection,
}

pub struct J1587Stack {
    sink: Box<dyn J1708Sink>,
    scheduler: Scheduler<Task>,
    status: BusStatus,
    running: bool,
    activity: ActivityMonitor,
    dtcs: DtcCollector,

    vin: String,
    odometer_m: Option<u64>,
    fuel_ml: Option<u64>,
    num_collected_dtcs: usize,
}

impl J1587Stack {
    pub fn new(sink: Box<dyn J1708Sink>) -> Self {
        Self {
            sink,
            scheduler: Scheduler::new(),
            status: BusStatus::Idle,
            running: false,
            activity: ActivityMonitor::default(),
            dtcs: DtcCollector::new(),
            vin: String::new(),
            odometer_m: None,
            fuel_ml: None,
            num_collected_dtcs: 0,
        }
    }

    fn request_pid(&mut self, pid: u16) -> bool {
        if !self.running {
            return false;
        }
        let frame = J1708Frame::new(REQUEST_PRIORITY, ADDRESS_MID, vec![PID_REQUEST, pid as u8]);
        trace!("J1587 --> P{} {} : {:02X?}", frame.priority, frame.id, frame.data);
        let sent = self.sink.send(frame);
        if !sent {
            warn!("J1708 transport refused frame");
        }
        sent
    }

    /// Process one received J1708 frame
    pub fn handle_frame(&mut self, frame: &J1708Frame, now: Millis) -> Vec<BusReading> {
        let mut readings = Vec::new();

        if frame.id < MID_J1587_MINIMUM {
            return readings;
        }

        self.status = self.activity.frame_received(self.status);
        if self.running {
            self.set_status(BusStatus::Up);
        }

        trace!("J1587 <-- P{} {} : {:02X?}", frame.priority, frame.id, frame.data);

        if frame.data.is_empty() {
            error!("Empty J1587 message from MID {} has no PIDs", frame.id);
            return readings;
        }

        for record in PidRecords::new(&frame.data) {
            match record {
                Ok(record) => self.parse_pid(frame.id, record, now, &mut readings),
                Err(e) => {
                    error!("J1587 frame from MID {} dropped: {}", frame.id, e);
                    break;
                }
            }
        }

        readings
    }

    fn parse_pid(&mut self, mid: u8, record: PidRecord<'_>, now: Millis, readings: &mut Vec<BusReading>) {
        match record.pid {
            PID_VIN => {
                let vin = String::from_utf8_lossy(record.data).to_string();
                debug!("J1587 VIN from MID {}: {}", mid, vin);
                self.vin = vin.clone();
                readings.push(BusReading::Vin(vin));
            }
            PID_ODOMETER => {
                let Ok(raw) = <[u8; 4]>::try_from(record.data) else {
                    error!("Expected 4 byte odometer from MID {}", mid);
                    return;
                };
                let meters = u64::from(u32::from_le_bytes(raw)) * ODOMETER_M_PER_BIT;
                self.odometer_m = Some(meters);
                readings.push(BusReading::OdometerMeters(meters));
            }
            PID_FUEL_CONSUMPTION => {
                let Ok(raw) = <[u8; 4]>::try_from(record.data) else {
                    error!("Expected 4 byte total fuel from MID {}", mid);
                    return;
                };
                let ml = u64::from(u32::from_le_bytes(raw)) * FUEL_ML_PER_BIT;
                self.fuel_ml = Some(ml);
                readings.push(BusReading::FuelConsumedMl(ml));
            }
            PID_DIAGNOSTICS => {
                trace!("J1587 DTCs from MID {} ({} bytes)", mid, record.data.len());
                if self.dtcs.begin() {
                    self.scheduler
                        .schedule(Task::DtcCollection, DTC_COLLECTION_TIME_MS, now);
                }
                for code in parse_diagnostics(mid, record.data) {
                    self.dtcs.add(code);
                }
            }
            _ => {}
        }
    }

    fn set_status(&mut self, status: BusStatus) {
        if self.status != status {
            debug!("J1587 status {:?} -> {:?}", self.status, status);
        }
        self.status = status;
    }
}

impl BusStack for J1587Stack {
    fn bus_type(&self) -> BusType {
        BusType::J1587
    }

    fn start(&mut self, now: Millis) {
        debug!("Starting J1587");
        self.set_status(BusStatus::Idle);
        self.running = true;
        self.activity.reset();
        self.scheduler
            .schedule(Task::ActivityCheck, ACTIVITY_CHECK_MS, now);
    }

    fn stop(&mut self) {
        debug!("Stopping J1587");
        self.dtcs.stop();
        self.scheduler.cancel_all();
        self.running = false;
        self.set_status(BusStatus::Idle);
    }

    fn status(&self) -> BusStatus {
        self.status
    }

    fn next_deadline(&self) -> Option<Millis> {
        self.scheduler.next_deadline()
    }

    fn log_status(&self) {
        info!(
            "{}= {} Addr {} : DTCs {} Odom {} FuelC {} VIN {}",
            BusType::J1587,
            if self.is_communicating() { "UP" } else { "--" },
            ADDRESS_MID,
            self.num_collected_dtcs,
            self.odometer_m.map_or("?".to_string(), |m| format!("{}m", m)),
            self.fuel_ml.map_or("?".to_string(), |v| format!("{}mL", v)),
            self.vin
        );
    }

    fn request(&mut self, request: BusRequest) -> bool {
        let pid = match request {
            BusRequest::Vin => PID_VIN,
            BusRequest::Odometer => PID_ODOMETER,
            BusRequest::TotalFuel => PID_FUEL_CONSUMPTION,
            BusRequest::Diagnostics => PID_DIAGNOSTICS,
        };
        self.request_pid(pid)
    }

    fn poll(&mut self, now: Millis) -> Vec<BusReading> {
        let mut readings = Vec::new();
        for task in self.scheduler.take_due(now) {
            match task {
                Task::ActivityCheck => {
                    let status = self.activity.check(self.status);
                    self.set_status(status);
                    self.scheduler
                        .schedule(Task::ActivityCheck, ACTIVITY_CHECK_MS, now);
                }
                Task::DtcCollection => {
                    let codes = self.dtcs.finish();
                    debug!("{} active J1587 DTCs", codes.len());
                    self.num_collected_dtcs = codes.len();
                    readings.push(BusReading::Dtcs(codes));
                }
            }
        }
        readings
    }
}
