//! Server communication watchdog
//!
//! Runs for the primary server only. Once armed it escalates through
//! stages until a message from the server clears it:
//! reset UDP, toggle mobile data, toggle airplane mode, restart the radio
//! driver, power down. A stage with a timeout of 0 is skipped.

use std::fmt;

use tracing::{debug, info, warn};

use super::device::Device;
use crate::event::{error_extra, EventRecord, EventType};
use crate::scheduler::{Millis, Scheduler};
use crate::settings::{param, setting, Settings};

/// Time mobile data stays off during a toggle
pub const MOBILE_DATA_TOGGLE_OFF_MS: Millis = 4000;
/// Time airplane mode stays on during a toggle
pub const AIRPLANE_TOGGLE_ON_MS: Millis = 4000;
/// Delay before the first toggle of a stage
const TOGGLE_START_MS: Millis = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum WatchdogStage {
    #[default]
    Off,
    Udp,
    MobileData,
    Airplane,
    RadioDriver,
    PowerDown,
}

impl fmt::Display for WatchdogStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Off => "OFF",
            Self::Udp => "UDP",
            Self::MobileData => "MOBILEDATA",
            Self::Airplane => "AIRPLANE",
            Self::RadioDriver => "RILDRIVER",
            Self::PowerDown => "POWERDOWN",
        };
        f.write_str(name)
    }
}

/// Stage timeouts in seconds, 0 disables a stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WatchdogTimeouts {
    pub udp_s: u32,
    pub mobile_data_s: u32,
    pub airplane_s: u32,
    pub radio_driver_s: u32,
    pub shutdown_s: u32,
    /// Repeat period of the toggles within a stage
    pub retry_s: u32,
}

impl WatchdogTimeouts {
    pub fn from_settings(settings: &dyn Settings) -> Self {
        let read = |index| settings.read_parameter_int(setting::COM_WATCHDOG, index);
        Self {
            udp_s: read(param::WATCHDOG_UDP_SECONDS),
            mobile_data_s: read(param::WATCHDOG_MOBILEDATA_SECONDS),
            airplane_s: read(param::WATCHDOG_AIRPLANE_SECONDS),
            radio_driver_s: read(param::WATCHDOG_RILDRIVER_SECONDS),
            shutdown_s: read(param::WATCHDOG_SHUTDOWN_SECONDS),
            retry_s: read(param::WATCHDOG_RETRY_SECONDS),
        }
    }

    fn for_stage(&self, stage: WatchdogStage) -> u32 {
        match stage {
            WatchdogStage::Off => 0,
            WatchdogStage::Udp => self.udp_s,
            WatchdogStage::MobileData => self.mobile_data_s,
            WatchdogStage::Airplane => self.airplane_s,
            WatchdogStage::RadioDriver => self.radio_driver_s,
            WatchdogStage::PowerDown => self.shutdown_s,
        }
    }
}

const ESCALATION: [WatchdogStage; 5] = [
    WatchdogStage::Udp,
    WatchdogStage::MobileData,
    WatchdogStage::Airplane,
    WatchdogStage::RadioDriver,
    WatchdogStage::PowerDown,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Task {
    Stage,
    MobileDataToggle,
    AirplaneToggle,
    RadioDriverRestart,
}

/// Result of a watchdog poll
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct WatchdogOutput {
    pub events: Vec<EventRecord>,
    /// The UDP stage fired: every server transport must be restarted
    pub reset_transports: bool,
}

#[derive(Debug, Default)]
pub struct Watchdog {
    /// Stage that fires when the stage timer expires
    stage: WatchdogStage,
    mobile_data_off: bool,
    airplane_on: bool,
    scheduler: Scheduler<Task>,
}

impl Watchdog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stage(&self) -> WatchdogStage {
        self.stage
    }

    pub fn is_running(&self) -> bool {
        self.stage != WatchdogStage::Off
    }

    pub fn next_deadline(&self) -> Option<Millis> {
        self.scheduler.next_deadline()
    }

    /// Arm the watchdog unless it is already running
    pub fn start(&mut self, timeouts: &WatchdogTimeouts, now: Millis) {
        if self.is_running() {
            return;
        }
        self.escalate(timeouts, now);
    }

    fn escalate(&mut self, timeouts: &WatchdogTimeouts, now: Millis) {
        let next = ESCALATION
            .iter()
            .copied()
            .filter(|&stage| stage > self.stage)
            .find(|&stage| timeouts.for_stage(stage) != 0);

        match next {
            Some(stage) => {
                let seconds = timeouts.for_stage(stage);
                debug!("Server-comm watchdog will escalate to stage {} in {} s", stage, seconds);
                self.stage = stage;
                self.scheduler.schedule(Task::Stage, Millis::from(seconds) * 1000, now);
            }
            None => {
                self.scheduler.cancel(Task::Stage);
            }
        }
    }

    /// Stop the watchdog and undo any radio toggling in progress
    pub fn clear(&mut self, device: &mut dyn Device) {
        if self.is_running() {
            debug!("Server-comm watchdog cleared");
        }
        self.stop_mobile_data_toggling(device);
        self.stop_airplane_toggling(device);
        self.scheduler.cancel_all();
        self.stage = WatchdogStage::Off;
    }

    fn stop_mobile_data_toggling(&mut self, device: &mut dyn Device) {
        self.scheduler.cancel(Task::MobileDataToggle);
        if self.mobile_data_off {
            device.set_mobile_data(true);
            self.mobile_data_off = false;
        }
    }

    fn stop_airplane_toggling(&mut self, device: &mut dyn Device) {
        self.scheduler.cancel(Task::AirplaneToggle);
        if self.airplane_on {
            device.set_airplane_mode(false);
            self.airplane_on = false;
        }
    }

    /// Run every expired stage or toggle step
    ///
    /// # Arguments
    ///
    /// * `timeouts` - Current stage timeouts
    /// * `device` - Radio and power control
    /// * `now` - Current time
    ///
    /// # Returns
    ///
    /// * `WatchdogOutput` - ERROR events to record and whether to reset the transports
    pub fn poll(
        &mut self,
        timeouts: &WatchdogTimeouts,
        device: &mut dyn Device,
        now: Millis,
    ) -> WatchdogOutput {
        let mut output = WatchdogOutput::default();
        for task in self.scheduler.take_due(now) {
            match task {
                Task::Stage => self.fire_stage(timeouts, device, now, &mut output),
                Task::MobileDataToggle => self.toggle_mobile_data(timeouts, device, now, &mut output),
                Task::AirplaneToggle => self.toggle_airplane(timeouts, device, now, &mut output),
                Task::RadioDriverRestart => self.restart_radio_driver(timeouts, device, now, &mut output),
            }
        }
        output
    }

    fn fire_stage(
        &mut self,
        timeouts: &WatchdogTimeouts,
        device: &mut dyn Device,
        now: Millis,
        output: &mut WatchdogOutput,
    ) {
        info!("Server-comm watchdog triggered at stage {}", self.stage);
        match self.stage {
            WatchdogStage::Off => {}
            WatchdogStage::Udp => {
                output
                    .events
                    .push(EventRecord::with_extra(EventType::ERROR, error_extra::OTA_STAGE_UDP));
                output.reset_transports = true;
                self.escalate(timeouts, now);
            }
            WatchdogStage::MobileData => {
                self.mobile_data_off = false;
                self.scheduler.schedule(Task::MobileDataToggle, TOGGLE_START_MS, now);
                self.escalate(timeouts, now);
            }
            WatchdogStage::Airplane => {
                self.stop_mobile_data_toggling(device);
                self.airplane_on = false;
                self.scheduler.schedule(Task::AirplaneToggle, TOGGLE_START_MS, now);
                self.escalate(timeouts, now);
            }
            WatchdogStage::RadioDriver => {
                self.stop_mobile_data_toggling(device);
                self.stop_airplane_toggling(device);
                self.scheduler.schedule(Task::RadioDriverRestart, TOGGLE_START_MS, now);
                self.escalate(timeouts, now);
            }
            WatchdogStage::PowerDown => {
                self.stop_mobile_data_toggling(device);
                self.stop_airplane_toggling(device);
                self.scheduler.cancel(Task::RadioDriverRestart);
                output
                    .events
                    .push(EventRecord::with_extra(EventType::ERROR, error_extra::OTA_STAGE_REBOOT));
                device.power_down();
            }
        }
    }

    fn toggle_mobile_data(
        &mut self,
        timeouts: &WatchdogTimeouts,
        device: &mut dyn Device,
        now: Millis,
        output: &mut WatchdogOutput,
    ) {
        info!("Server-comm watchdog mobile data toggle, off={}", self.mobile_data_off);
        if !self.mobile_data_off {
            self.mobile_data_off = true;
            output.events.push(EventRecord::with_extra(
                EventType::ERROR,
                error_extra::OTA_STAGE_MOBILEDATA,
            ));
            device.set_mobile_data(false);
            self.scheduler
                .schedule(Task::MobileDataToggle, MOBILE_DATA_TOGGLE_OFF_MS, now);
        } else {
            device.set_mobile_data(true);
            self.mobile_data_off = false;
            if timeouts.retry_s > 0 {
                debug!("Will retry mobile data toggle in {} s", timeouts.retry_s);
                self.scheduler.schedule(
                    Task::MobileDataToggle,
                    Millis::from(timeouts.retry_s) * 1000,
                    now,
                );
            }
        }
    }

    fn toggle_airplane(
        &mut self,
        timeouts: &WatchdogTimeouts,
        device: &mut dyn Device,
        now: Millis,
        output: &mut WatchdogOutput,
    ) {
        info!("Server-comm watchdog airplane mode toggle, on={}", self.airplane_on);
        if !self.airplane_on {
            self.airplane_on = true;
            output.events.push(EventRecord::with_extra(
                EventType::ERROR,
                error_extra::OTA_STAGE_AIRPLANEMODE,
            ));
            device.set_airplane_mode(true);
            self.scheduler.schedule(Task::AirplaneToggle, AIRPLANE_TOGGLE_ON_MS, now);
        } else {
            device.set_airplane_mode(false);
            self.airplane_on = false;
            if timeouts.retry_s > 0 {
                self.scheduler
                    .schedule(Task::AirplaneToggle, Millis::from(timeouts.retry_s) * 1000, now);
            }
        }
    }

    fn restart_radio_driver(
        &mut self,
        timeouts: &WatchdogTimeouts,
        device: &mut dyn Device,
        now: Millis,
        output: &mut WatchdogOutput,
    ) {
        info!("Server-comm watchdog radio driver restart");
        let extra = if device.restart_radio_driver() {
            error_extra::OTA_STAGE_RILDRIVER
        } else {
            warn!("Radio driver restart failed");
            error_extra::OTA_STAGE_RILDRIVER_FAILURE
        };
        output.events.push(EventRecord::with_extra(EventType::ERROR, extra));

        if timeouts.retry_s > 0 {
            self.scheduler.schedule(
                Task::RadioDriverRestart,
                Millis::from(timeouts.retry_s) * 1000,
                now,
            );
        }
    }
}
