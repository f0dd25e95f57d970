//! # Delivery Engine
//!
//! Reliable at-least-once delivery of queued events to up to two servers
//! over datagrams, and execution of the commands those servers send back.
//!
//! This module handles:
//! - The periodic check tick: listen, receive/dispatch, send
//! - Per-server retry backoff
//! - The primary server communication watchdog
//! - ACK/NAK replies and remote configuration commands
//! - Stamping and queueing of new events
//!
//! Only the head of each server's queue is ever in flight. It leaves the
//! queue when the server ACKs it or, for ACK/NAK types, as soon as it is sent.

pub mod backoff;
pub mod device;
pub mod queue;
pub mod transport;
pub mod watchdog;

use tracing::{debug, error, info, trace, warn};

use self::backoff::{Backoff, BackoffWait};
use self::device::{Device, NetworkKind};
use self::queue::EventQueue;
use self::transport::DatagramTransport;
use self::watchdog::{Watchdog, WatchdogStage, WatchdogTimeouts};
use crate::codec::protocol::{NakReason, SEQUENCE_ID_RECEIVE_MASK};
use crate::codec::{decoder, encoder};
use crate::codemap::CodeMap;
use crate::event::{EventRecord, EventType, TelemetryEvent};
use crate::scheduler::{Millis, Scheduler};
use crate::settings::{param, setting, Settings};
use crate::state::{key, SharedState};

pub const NUM_SUPPORTED_SERVERS: usize = 2;
pub const SERVER_PRIMARY: usize = 0;
pub const SERVER_SECONDARY: usize = 1;

/// Check period when nothing was just sent
pub const CHECK_TIMER_MS_NORMAL: Millis = 500;
/// Check period right after a send or receive
pub const CHECK_TIMER_MS_JUSTSENT: Millis = 200;

/// Poll period while waiting for a RESTART ACK to leave
const RESTART_FLUSH_POLL_MS: Millis = 50;
/// Polls before restarting without the ACK having left
const RESTART_FLUSH_ATTEMPTS: u32 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Task {
    Check,
    Backoff(usize),
    RestartFlush,
}

/// Options from the application config
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryOptions {
    /// Serial number sent in and expected on every message
    pub device_id: String,
    /// Send the cellular info at send time instead of trigger time
    pub use_live_connect_info: bool,
    pub tick_normal_ms: Millis,
    pub tick_after_send_ms: Millis,
}

impl DeliveryOptions {
    pub fn new(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            use_live_connect_info: false,
            tick_normal_ms: CHECK_TIMER_MS_NORMAL,
            tick_after_send_ms: CHECK_TIMER_MS_JUSTSENT,
        }
    }
}

struct Server {
    name: &'static str,
    enabled: bool,
    transport: Box<dyn DatagramTransport>,
    backoff: Backoff,
    address_setting: u8,
    local_port_setting: u8,
    backoff_setting: u8,
}

impl Server {
    fn new(index: usize, transport: Box<dyn DatagramTransport>) -> Self {
        if index == SERVER_PRIMARY {
            Self {
                name: "primary",
                enabled: false,
                transport,
                backoff: Backoff::new(),
                address_setting: setting::SERVER_ADDRESS,
                local_port_setting: setting::LOCAL_PORT,
                backoff_setting: setting::BACKOFF_RETRIES,
            }
        } else {
            Self {
                name: "secondary",
                enabled: false,
                transport,
                backoff: Backoff::new(),
                address_setting: setting::SECONDARY_SERVER_ADDRESS,
                local_port_setting: setting::SECONDARY_LOCAL_PORT,
                backoff_setting: setting::SECONDARY_BACKOFF_RETRIES,
            }
        }
    }

    /// Whether a setting id changes this server's endpoint
    fn uses_setting(&self, id: u8) -> bool {
        id == self.address_setting || id == self.local_port_setting
    }
}

/// Delivery engine for both servers
pub struct DeliveryEngine {
    options: DeliveryOptions,
    settings: Box<dyn Settings>,
    code_map: Box<dyn CodeMap>,
    queue: Box<dyn EventQueue>,
    device: Box<dyn Device>,
    state: SharedState,
    servers: Vec<Server>,
    watchdog: Watchdog,
    scheduler: Scheduler<Task>,
    restart_attempts: u32,
    /// Network seen on the last check tick
    network: Option<NetworkKind>,
}

/// Current wall clock as epoch seconds
fn epoch_now() -> u32 {
    u32::try_from(chrono::Utc::now().timestamp()).unwrap_or(0)
}

impl DeliveryEngine {
    /// Create a delivery engine
    ///
    /// # Arguments
    ///
    /// * `transports` - Primary then secondary server transport
    pub fn new(
        options: DeliveryOptions,
        settings: Box<dyn Settings>,
        code_map: Box<dyn CodeMap>,
        queue: Box<dyn EventQueue>,
        device: Box<dyn Device>,
        state: SharedState,
        transports: [Box<dyn DatagramTransport>; NUM_SUPPORTED_SERVERS],
    ) -> Self {
        let servers = transports
            .into_iter()
            .enumerate()
            .map(|(index, transport)| Server::new(index, transport))
            .collect();

        Self {
            options,
            settings,
            code_map,
            queue,
            device,
            state,
            servers,
            watchdog: Watchdog::new(),
            scheduler: Scheduler::new(),
            restart_attempts: 0,
            network: None,
        }
    }

    pub fn settings(&self) -> &dyn Settings {
        self.settings.as_ref()
    }

    pub fn code_map(&self) -> &dyn CodeMap {
        self.code_map.as_ref()
    }

    pub fn queue(&self) -> &dyn EventQueue {
        self.queue.as_ref()
    }

    pub fn watchdog_stage(&self) -> WatchdogStage {
        self.watchdog.stage()
    }

    /// Start the check tick
    pub fn start(&mut self, now: Millis) {
        info!("Starting delivery");
        self.network = self.device.network();
        self.scheduler.schedule(Task::Check, 0, now);
    }

    /// Stop every timer and close the transports
    pub fn stop(&mut self) {
        info!("Stopping delivery");
        self.scheduler.cancel_all();
        self.watchdog.clear(self.device.as_mut());
        for server in &mut self.servers {
            server.enabled = false;
            server.backoff.clear();
            server.transport.stop();
        }
    }

    pub fn next_deadline(&self) -> Option<Millis> {
        match (self.scheduler.next_deadline(), self.watchdog.next_deadline()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Run every expired timer
    pub fn poll(&mut self, now: Millis) {
        let timeouts = WatchdogTimeouts::from_settings(self.settings.as_ref());
        let output = self.watchdog.poll(&timeouts, self.device.as_mut(), now);
        if output.reset_transports {
            for server in &mut self.servers {
                server.enabled = false;
                server.transport.stop();
            }
        }
        for record in output.events {
            self.record_event(record);
        }

        for task in self.scheduler.take_due(now) {
            match task {
                Task::Check => self.check(now),
                Task::Backoff(index) => {
                    trace!(server = self.servers[index].name, "Backoff timer expired");
                    self.servers[index].backoff.timer_expired();
                    self.attempt_send(index, now);
                }
                Task::RestartFlush => self.restart_flush(now),
            }
        }
    }

    /// Stamp an event with the next sequence id and the current time and queue it
    pub fn record_event(&mut self, record: EventRecord) -> u16 {
        self.record_event_at(record, epoch_now())
    }

    /// Stamp and queue an event with an explicit trigger time
    ///
    /// One copy is queued for the primary server and one for the secondary
    /// server when it has an address configured.
    ///
    /// # Returns
    ///
    /// * `u16` - Sequence id given to the event
    pub fn record_event_at(&mut self, record: EventRecord, trigger_time: u32) -> u16 {
        let sequence_id = self.next_sequence_id();
        let info = self.device.connect_info();

        let event = TelemetryEvent {
            sequence_id,
            event_type: record.event_type,
            trigger_time,
            extra: record.extra,
            additional_data: record.data,
            carrier_id: info.carrier_id(),
            network_type: info.network_type,
            signal_strength: info.signal_strength,
            is_roaming: info.is_roaming,
            ..Default::default()
        };

        for index in 0..self.servers.len() {
            if self.has_destination(index) {
                self.queue.push(index, event.clone());
            }
        }
        sequence_id
    }

    /// Sequence ids skip values whose received bits are all zero
    fn next_sequence_id(&mut self) -> u16 {
        let current = self.state.read_int(key::MESSAGE_SEQUENCE) & 0xFFFF;
        let mut next = current + 1;
        if next & i64::from(SEQUENCE_ID_RECEIVE_MASK) == 0 {
            next += 1;
        }
        self.state.write_int(key::MESSAGE_SEQUENCE, next & 0xFFFF);
        current as u16
    }

    fn has_destination(&self, index: usize) -> bool {
        index == SERVER_PRIMARY
            || !self
                .settings
                .read_parameter_string(self.servers[index].address_setting, param::SERVER_ADDRESS_IP)
                .trim()
                .is_empty()
    }

    /// Release every server waiting for a connectivity change and retry
    pub fn connectivity_changed(&mut self, now: Millis) {
        debug!("Connectivity changed");
        for index in 0..self.servers.len() {
            self.servers[index].backoff.connectivity_changed();
            self.attempt_send(index, now);
        }
    }

    /// Release connectivity waits when the device network differs from the last tick
    fn track_network(&mut self) {
        let network = self.device.network();
        if network == self.network {
            return;
        }
        info!("Network changed {:?} -> {:?}", self.network, network);
        self.network = network;
        for server in &mut self.servers {
            server.backoff.connectivity_changed();
        }
    }

    fn check(&mut self, now: Millis) {
        self.track_network();
        self.attempt_listen();

        let mut just_sent = false;
        for index in 0..self.servers.len() {
            just_sent |= self.attempt_receive(index, now);
            just_sent |= self.attempt_send(index, now);
        }

        let delay = if just_sent {
            self.options.tick_after_send_ms
        } else {
            self.options.tick_normal_ms
        };
        self.scheduler.schedule(Task::Check, delay, now);
    }

    /// Start the transport of every stopped server that has a complete endpoint
    fn attempt_listen(&mut self) {
        for server in &mut self.servers {
            if server.enabled && !server.transport.has_stopped() {
                continue;
            }

            let local_port = self
                .settings
                .read_parameter_int(server.local_port_setting, param::LOCAL_PORT);
            let remote = self
                .settings
                .read_parameter_string(server.address_setting, param::SERVER_ADDRESS_IP);
            let remote_port = self
                .settings
                .read_parameter_int(server.address_setting, param::SERVER_ADDRESS_PORT);

            let (Ok(local_port), Ok(remote_port)) =
                (u16::try_from(local_port), u16::try_from(remote_port))
            else {
                continue;
            };
            let remote = remote.trim();
            if local_port == 0 || remote_port == 0 || remote.is_empty() {
                continue;
            }

            debug!(server = server.name, "Starting transport :{} -> {}:{}", local_port, remote, remote_port);
            server.enabled = server.transport.start(local_port, remote, remote_port);
        }
    }

    /// Only cellular data is used unless setting 23 allows other networks
    fn is_network_available(&self) -> bool {
        match self.device.network() {
            None => false,
            Some(NetworkKind::Cellular) => true,
            Some(NetworkKind::Other) => {
                self.settings
                    .read_parameter_int(setting::SERVER_COMMUNICATION, param::NONCELLULAR_OK)
                    != 0
            }
        }
    }

    /// Send the queue head of a server if nothing holds it back
    fn attempt_send(&mut self, index: usize, now: Millis) -> bool {
        if !self.servers[index].enabled {
            return false;
        }
        let Some(event) = self.queue.first(index).cloned() else {
            return false;
        };

        if index == SERVER_PRIMARY {
            let timeouts = WatchdogTimeouts::from_settings(self.settings.as_ref());
            self.watchdog.start(&timeouts, now);
        }

        if self.servers[index].backoff.is_backed_off()
            || !self.is_network_available()
            || !self.device.is_io_initialized()
        {
            return false;
        }

        self.send_message(index, &event, now);
        true
    }

    fn attempt_receive(&mut self, index: usize, now: Millis) -> bool {
        match self.servers[index].transport.receive() {
            Some(message) => self.receive_message(index, &message, now),
            None => false,
        }
    }

    fn encode(&self, event: &TelemetryEvent) -> Vec<u8> {
        let live = self
            .options
            .use_live_connect_info
            .then(|| self.device.connect_info());
        encoder::encode_event(
            event,
            &self.options.device_id,
            self.code_map.as_ref(),
            live.as_ref(),
        )
    }

    fn send_message(&mut self, index: usize, event: &TelemetryEvent, now: Millis) {
        let message = self.encode(event);
        self.attempt_listen();

        let server = &mut self.servers[index];
        debug!(
            server = server.name,
            "Sending event type {} seq {}", event.event_type, event.sequence_id
        );
        server.transport.send(&message);

        if event.event_type.requires_ack() {
            let delays = self.settings.read_parameter_array(server.backoff_setting);
            match server.backoff.next(&delays) {
                BackoffWait::Timer(delay_ms) => {
                    self.scheduler.schedule(Task::Backoff(index), delay_ms, now)
                }
                BackoffWait::Connectivity => {
                    debug!(server = server.name, "Backing off until connectivity changes")
                }
            }
        } else {
            if index == SERVER_PRIMARY {
                self.watchdog.clear(self.device.as_mut());
            }
            self.queue.delete_by_id(event.id);
        }
    }

    fn send_reply(&mut self, index: usize, event_type: EventType, sequence_id: u16, data: Option<Vec<u8>>) {
        let info = self.device.connect_info();
        let reply = TelemetryEvent {
            sequence_id,
            event_type,
            trigger_time: epoch_now(),
            additional_data: data,
            carrier_id: info.carrier_id(),
            network_type: info.network_type,
            signal_strength: info.signal_strength,
            is_roaming: info.is_roaming,
            ..Default::default()
        };
        let message = self.encode(&reply);
        self.attempt_listen();
        self.servers[index].transport.send(&message);
    }

    fn send_ack(&mut self, index: usize, sequence_id: u16) {
        debug!(server = self.servers[index].name, "Sending ACK seq {}", sequence_id);
        self.send_reply(index, EventType::ACK, sequence_id, None);
    }

    fn send_nak(&mut self, index: usize, reason: NakReason, sequence_id: u16) {
        debug!(server = self.servers[index].name, "Sending NAK seq {} reason {:?}", sequence_id, reason);
        self.send_reply(index, EventType::NAK, sequence_id, Some(vec![reason.code()]));
    }

    /// Decode and execute one inbound message
    ///
    /// Undecodable messages are dropped without any reply or state change.
    /// Commands rejected for missing data are NAKed but leave the backoff
    /// and watchdog running.
    ///
    /// # Returns
    ///
    /// * `bool` - True if the command was accepted and the server is alive
    fn receive_message(&mut self, index: usize, message: &[u8], now: Millis) -> bool {
        let command = match decoder::decode_command(
            message,
            &self.options.device_id,
            self.code_map.as_ref(),
            epoch_now(),
        ) {
            Ok(command) => command,
            Err(e) => {
                debug!(server = self.servers[index].name, "Discarding inbound message: {}", e);
                return false;
            }
        };

        let sequence_id = command.sequence_id;
        let data = command.additional_data.unwrap_or_default();
        info!(
            server = self.servers[index].name,
            "Received command {} seq {}", command.event_type, sequence_id
        );

        match command.event_type {
            EventType::ACK_TOP => {
                let target = data
                    .first()
                    .map(|&b| usize::from(b))
                    .filter(|&target| target < self.servers.len())
                    .unwrap_or(index);
                self.queue.delete_top(target);
            }
            EventType::ACK => {
                self.queue
                    .delete_by_sequence(index, sequence_id, SEQUENCE_ID_RECEIVE_MASK);
            }
            EventType::RESTART => {
                self.send_ack(index, sequence_id);
                self.begin_restart(index, now);
            }
            EventType::CLEAR_QUEUE => {
                self.queue.clear_all();
                self.send_ack(index, sequence_id);
            }
            EventType::RESET_FOTA_UPDATER => {
                self.device.reset_fota_updater();
                self.send_ack(index, sequence_id);
            }
            EventType::CLEAR_ODOMETER => {
                self.device.clear_odometer();
                self.send_ack(index, sequence_id);
            }
            EventType::MOREMAPW | EventType::MTREMAPW => {
                let &[first, second] = data.as_slice() else {
                    self.send_nak(index, NakReason::MissingRequiredData, sequence_id);
                    return false;
                };
                let saved = if command.event_type == EventType::MOREMAPW {
                    self.code_map.write_mo(first, second)
                } else {
                    self.code_map.write_mt(first, second)
                };
                if saved {
                    self.send_ack(index, sequence_id);
                } else {
                    self.send_nak(index, NakReason::ErrorInSaving, sequence_id);
                }
            }
            EventType::CONFIGW => {
                let Some((&setting_id, value)) = data.split_first() else {
                    self.send_nak(index, NakReason::MissingRequiredData, sequence_id);
                    return false;
                };
                match self.write_config(setting_id, value) {
                    Ok(()) => self.send_ack(index, sequence_id),
                    Err(reason) => self.send_nak(index, reason, sequence_id),
                }
            }
            other => {
                warn!(server = self.servers[index].name, "Unknown command {}", other);
                self.send_nak(index, NakReason::UnknownCommand, sequence_id);
            }
        }

        self.servers[index].backoff.clear();
        self.scheduler.cancel(Task::Backoff(index));
        if index == SERVER_PRIMARY {
            self.watchdog.clear(self.device.as_mut());
        }
        self.attempt_send(index, now);
        true
    }

    /// Write or clear a setting; the value is ISO-8859-1 text
    fn write_config(&mut self, setting_id: u8, value: &[u8]) -> Result<(), NakReason> {
        if !self.settings.setting_exists(setting_id) {
            return Err(NakReason::BadSettingId);
        }

        let saved = if value.is_empty() {
            info!(setting = setting_id, "Clearing setting");
            self.settings.clear_setting(setting_id)
        } else {
            let text: String = value.iter().map(|&b| char::from(b)).collect();
            info!(setting = setting_id, "Writing setting: {}", text);
            self.settings.write_setting(setting_id, &text)
        };
        if !saved {
            return Err(NakReason::ErrorInSaving);
        }

        // new endpoint takes effect on the next listen attempt
        for server in &mut self.servers {
            if server.uses_setting(setting_id) {
                server.enabled = false;
                server.transport.stop();
            }
        }
        Ok(())
    }

    fn begin_restart(&mut self, index: usize, now: Millis) {
        if self.servers[index].transport.has_outgoing() {
            self.restart_attempts = RESTART_FLUSH_ATTEMPTS;
            self.scheduler.schedule(Task::RestartFlush, RESTART_FLUSH_POLL_MS, now);
        } else {
            info!("Restarting on server request");
            self.device.restart();
        }
    }

    fn restart_flush(&mut self, now: Millis) {
        let pending = self.servers.iter().any(|s| s.transport.has_outgoing());
        if pending && self.restart_attempts > 1 {
            self.restart_attempts -= 1;
            self.scheduler.schedule(Task::RestartFlush, RESTART_FLUSH_POLL_MS, now);
            return;
        }
        if pending {
            error!("Unable to send RESTART ACK before timing out, restarting without it");
        } else {
            info!("Restarting on server request");
        }
        self.device.restart();
    }
}
