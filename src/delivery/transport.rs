//! Datagram transport to one server

use std::io;
use std::net::{IpAddr, SocketAddr};

use tokio::net::UdpSocket;
use tokio::sync::oneshot::{self, error::TryRecvError};
use tracing::{debug, info, trace, warn};

use crate::codec::protocol::MAX_INCOMING_MESSAGE_LENGTH;
use crate::error::Result;

/// Non-blocking datagram channel polled from the delivery tick
pub trait DatagramTransport: Send {
    /// Bind `local_port` and target `remote:remote_port`, returns false on failure
    ///
    /// Returns false while a host name is still being resolved, the caller
    /// retries on its next tick.
    fn start(&mut self, local_port: u16, remote: &str, remote_port: u16) -> bool;

    fn stop(&mut self);

    fn has_stopped(&self) -> bool;

    /// Hand a datagram to the network, returns false if it was dropped
    fn send(&mut self, data: &[u8]) -> bool;

    /// Next received datagram, if any
    fn receive(&mut self) -> Option<Vec<u8>>;

    /// True while a sent datagram is still waiting to leave
    fn has_outgoing(&self) -> bool;
}

/// Host name lookup running on the runtime
#[derive(Debug)]
struct Lookup {
    host: String,
    port: u16,
    result: oneshot::Receiver<Option<SocketAddr>>,
}

/// UDP transport over a tokio socket
///
/// Must be started from within a tokio runtime.
#[derive(Debug, Default)]
pub struct UdpTransport {
    socket: Option<UdpSocket>,
    remote: Option<SocketAddr>,
    lookup: Option<Lookup>,
}

impl UdpTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remote address without blocking
    ///
    /// IP literals resolve at once. Host names are looked up in a spawned
    /// task and yield `None` until a later call finds the answer.
    fn resolve(&mut self, remote: &str, remote_port: u16) -> Option<SocketAddr> {
        if let Ok(ip) = remote.parse::<IpAddr>() {
            self.lookup = None;
            return Some(SocketAddr::new(ip, remote_port));
        }

        let answer = match &mut self.lookup {
            Some(lookup) if lookup.host == remote && lookup.port == remote_port => {
                Some(lookup.result.try_recv())
            }
            _ => None,
        };
        match answer {
            Some(Err(TryRecvError::Empty)) => return None,
            Some(Ok(addr)) => {
                self.lookup = None;
                if addr.is_none() {
                    warn!("Cannot resolve {}", remote);
                }
                return addr;
            }
            Some(Err(TryRecvError::Closed)) | None => {}
        }

        debug!("Resolving {}", remote);
        let (tx, rx) = oneshot::channel();
        let host = remote.to_string();
        tokio::spawn(async move {
            let addr = match tokio::net::lookup_host((host.as_str(), remote_port)).await {
                Ok(addrs) => {
                    // the socket is bound on IPv4
                    let addrs: Vec<SocketAddr> = addrs.collect();
                    addrs
                        .iter()
                        .copied()
                        .find(SocketAddr::is_ipv4)
                        .or_else(|| addrs.first().copied())
                }
                Err(e) => {
                    debug!("Lookup of {} failed: {}", host, e);
                    None
                }
            };
            let _ = tx.send(addr);
        });
        self.lookup = Some(Lookup {
            host: remote.to_string(),
            port: remote_port,
            result: rx,
        });
        None
    }

    fn bind(local_port: u16) -> Result<UdpSocket> {
        let socket = std::net::UdpSocket::bind(("0.0.0.0", local_port))?;
        socket.set_nonblocking(true)?;
        Ok(UdpSocket::from_std(socket)?)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.as_ref()?.local_addr().ok()
    }
}

impl DatagramTransport for UdpTransport {
    fn start(&mut self, local_port: u16, remote: &str, remote_port: u16) -> bool {
        self.stop();
        let Some(remote_addr) = self.resolve(remote, remote_port) else {
            return false;
        };
        match Self::bind(local_port) {
            Ok(socket) => {
                info!("UDP started :{} -> {}", local_port, remote_addr);
                self.socket = Some(socket);
                self.remote = Some(remote_addr);
                true
            }
            Err(e) => {
                warn!("Failed to start UDP :{} -> {}:{}: {}", local_port, remote, remote_port, e);
                false
            }
        }
    }

    fn stop(&mut self) {
        if self.socket.take().is_some() {
            debug!("UDP stopped");
        }
        self.remote = None;
    }

    fn has_stopped(&self) -> bool {
        self.socket.is_none()
    }

    fn send(&mut self, data: &[u8]) -> bool {
        let (Some(socket), Some(remote)) = (&self.socket, self.remote) else {
            return false;
        };
        match socket.try_send_to(data, remote) {
            Ok(_) => {
                trace!("Sent {} bytes to {}", data.len(), remote);
                true
            }
            Err(e) => {
                warn!("UDP send to {} failed: {}", remote, e);
                false
            }
        }
    }

    fn receive(&mut self) -> Option<Vec<u8>> {
        let socket = self.socket.as_ref()?;
        let mut buf = [0u8; MAX_INCOMING_MESSAGE_LENGTH];
        match socket.try_recv_from(&mut buf) {
            Ok((len, from)) => {
                trace!("Received {} bytes from {}", len, from);
                Some(buf[..len].to_vec())
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => None,
            Err(e) => {
                warn!("UDP receive failed: {}", e);
                None
            }
        }
    }

    fn has_outgoing(&self) -> bool {
        false
    }
}
