//! Device control collaborator
//!
//! Radio, power and network queries the delivery engine needs. The host
//! implementation only logs radio actions and turns restart/power-down
//! requests into a flag the main loop watches.

use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[cfg(test)]
use mockall::automock;
use tracing::{info, warn};

use crate::event::ConnectInfo;

/// Kind of data network currently connected
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkKind {
    Cellular,
    /// Wi-Fi, ethernet or anything else that is not the modem
    Other,
}

/// Device control and status
#[cfg_attr(test, automock)]
pub trait Device: Send {
    /// Connected data network, `None` when offline
    fn network(&self) -> Option<NetworkKind>;

    /// Cellular details stamped into events
    fn connect_info(&self) -> ConnectInfo;

    /// False until device inputs have been read at least once
    fn is_io_initialized(&self) -> bool;

    fn set_mobile_data(&mut self, enabled: bool);

    fn set_airplane_mode(&mut self, enabled: bool);

    /// Restart the modem driver, returns true on success
    fn restart_radio_driver(&mut self) -> bool;

    fn power_down(&mut self);

    /// Restart this agent
    fn restart(&mut self);

    fn reset_fota_updater(&mut self);

    fn clear_odometer(&mut self);
}

/// Why the host device asked the agent to exit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitRequest {
    Restart,
    PowerDown,
}

/// Device implementation for a plain Linux host
///
/// The network is reachable unless a route check target is set and the host
/// has no route to it.
#[derive(Debug, Clone, Default)]
pub struct HostDevice {
    network: Option<NetworkKind>,
    route_check: Option<SocketAddr>,
    connect_info: ConnectInfo,
    restart: Arc<AtomicBool>,
    power_down: Arc<AtomicBool>,
}

impl HostDevice {
    pub fn new(network: NetworkKind, connect_info: ConnectInfo) -> Self {
        Self {
            network: Some(network),
            connect_info,
            ..Default::default()
        }
    }

    /// Report offline while there is no route to `target`
    pub fn with_route_check(mut self, target: SocketAddr) -> Self {
        self.route_check = Some(target);
        self
    }

    /// Handle the main loop polls for exit requests
    pub fn exit_handle(&self) -> ExitHandle {
        ExitHandle {
            restart: Arc::clone(&self.restart),
            power_down: Arc::clone(&self.power_down),
        }
    }
}

impl Device for HostDevice {
    fn network(&self) -> Option<NetworkKind> {
        match self.route_check {
            Some(target) if !has_route(target) => None,
            _ => self.network,
        }
    }

    fn connect_info(&self) -> ConnectInfo {
        self.connect_info.clone()
    }

    fn is_io_initialized(&self) -> bool {
        true
    }

    fn set_mobile_data(&mut self, enabled: bool) {
        info!("Mobile data {}", if enabled { "enabled" } else { "disabled" });
    }

    fn set_airplane_mode(&mut self, enabled: bool) {
        info!("Airplane mode {}", if enabled { "on" } else { "off" });
    }

    fn restart_radio_driver(&mut self) -> bool {
        warn!("Radio driver restart not available on this host");
        false
    }

    fn power_down(&mut self) {
        warn!("Power down requested");
        self.power_down.store(true, Ordering::SeqCst);
    }

    fn restart(&mut self) {
        info!("Restart requested");
        self.restart.store(true, Ordering::SeqCst);
    }

    fn reset_fota_updater(&mut self) {
        info!("FOTA updater reset requested");
    }

    fn clear_odometer(&mut self) {
        info!("Device odometer cleared");
    }
}

/// Connecting a datagram socket only does the route lookup, nothing is sent
fn has_route(target: SocketAddr) -> bool {
    let local: SocketAddr = if target.is_ipv4() {
        ([0u8; 4], 0).into()
    } else {
        ([0u16; 8], 0).into()
    };
    UdpSocket::bind(local)
        .and_then(|socket| socket.connect(target))
        .is_ok()
}

/// Shared view of the exit flags of a [`HostDevice`]
#[derive(Debug, Clone)]
pub struct ExitHandle {
    restart: Arc<AtomicBool>,
    power_down: Arc<AtomicBool>,
}

impl ExitHandle {
    pub fn requested(&self) -> Option<ExitRequest> {
        if self.power_down.load(Ordering::SeqCst) {
            Some(ExitRequest::PowerDown)
        } else if self.restart.load(Ordering::SeqCst) {
            Some(ExitRequest::Restart)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_device_exit_requests() {
        let mut device = HostDevice::new(NetworkKind::Cellular, ConnectInfo::default());
        let handle = device.exit_handle();
        assert_eq!(handle.requested(), None);

        device.restart();
        assert_eq!(handle.requested(), Some(ExitRequest::Restart));

        device.power_down();
        assert_eq!(handle.requested(), Some(ExitRequest::PowerDown), "Power down wins");
    }

    #[test]
    fn test_host_device_reports_network() {
        let device = HostDevice::new(
            NetworkKind::Other,
            ConnectInfo {
                network_operator: "310260".to_string(),
                ..Default::default()
            },
        );
        assert_eq!(device.network(), Some(NetworkKind::Other));
        assert_eq!(HostDevice::default().network(), None, "Offline until constructed");
        assert!(device.is_io_initialized());
        assert_eq!(device.connect_info().carrier_id(), 310260);
    }

    #[test]
    fn test_host_device_route_check() {
        let device = HostDevice::new(NetworkKind::Cellular, ConnectInfo::default())
            .with_route_check("127.0.0.1:9".parse().unwrap());
        assert_eq!(device.network(), Some(NetworkKind::Cellular), "Loopback is always routable");
    }
}
