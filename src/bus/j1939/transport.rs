//! J1939 transport protocol (multi-packet receive)
//!
//! Only the receiving side is implemented: RTS/CTS/EOM sessions addressed to
//! us and BAM broadcasts, for a short allow-list of PGNs. Sessions live in a
//! fixed pool and are aborted by a periodic timeout sweep.

use tracing::{debug, trace, warn};

use super::packet::{get_le, put_le, Packet, ADDRESS_GLOBAL, ADDRESS_NULL, PF_CONNECTION_MANAGE};
use super::packet::{PGN_FAULT_DM1, PGN_VIN};
use crate::scheduler::Millis;

pub const TP_CM_RTS: u8 = 16;
pub const TP_CM_CTS: u8 = 17;
pub const TP_CM_EOM: u8 = 19;
pub const TP_CM_BAM: u8 = 32;
pub const TP_CM_ABORT: u8 = 255;

/// Simultaneous sessions
pub const MAX_TP_CONNECTIONS: usize = 5;
/// Packets accepted per CTS
pub const MAX_TP_FRAMES_PER_BURST: u8 = 1;
/// Session idle timeout (T2/T3)
pub const TP_TIMEOUT_MS: Millis = 1250;
/// Interval of the timeout sweep
pub const CONNECTION_TIMEOUT_CHECK_MS: Millis = 500;

/// PGNs accepted over the transport protocol
pub const TP_PGNS: [u32; 2] = [PGN_VIN, PGN_FAULT_DM1];

/// Data bytes carried by each TP.DT packet
const BYTES_PER_PACKET: usize = 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AbortReason {
    MaxConnections = 1,
    NoSystemResources = 2,
    Timeout = 3,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TpConnection {
    pub pgn: u32,
    pub expected_bytes: usize,
    pub expected_packets: u8,
    pub max_packets_per_burst: u8,
    pub source_address: u8,
    /// Us, or the global address for BAM
    pub destination_address: u8,
    pub timeout_deadline: Millis,
    pub data: Vec<u8>,
}

impl TpConnection {
    fn is_broadcast(&self) -> bool {
        self.destination_address == ADDRESS_GLOBAL
    }
}

/// A fully reassembled message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedMessage {
    pub source_address: u8,
    pub pgn: u32,
    pub data: Vec<u8>,
}

/// Result of one TP.DT packet
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DataOutcome {
    pub replies: Vec<Packet>,
    pub completed: Option<CompletedMessage>,
}

/// Pool of open receive sessions
#[derive(Debug, Default)]
pub struct TpManager {
    connections: [Option<TpConnection>; MAX_TP_CONNECTIONS],
}

impl TpManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open_count(&self) -> usize {
        self.connections.iter().filter(|c| c.is_some()).count()
    }

    fn find_open(&self, source_address: u8, destination_address: u8) -> Option<usize> {
        self.connections.iter().position(|c| {
            matches!(c, Some(tp) if tp.source_address == source_address
                && tp.destination_address == destination_address)
        })
    }

    /// Handle a TP.CM packet
    ///
    /// # Arguments
    ///
    /// * `source_address` - Sender of the request
    /// * `destination_address` - Our address, or global for BAM
    /// * `data` - Connection management payload
    /// * `my_address` - Our claimed address, replies are only sent from it
    /// * `now` - Current time
    ///
    /// # Returns
    ///
    /// * `Vec<Packet>` - CTS or abort replies to transmit
    pub fn receive_connection_manage(
        &mut self,
        source_address: u8,
        destination_address: u8,
        data: &[u8; 8],
        my_address: u8,
        now: Millis,
    ) -> Vec<Packet> {
        let command = data[0];
        if command != TP_CM_RTS && command != TP_CM_BAM {
            return Vec::new();
        }

        let send_response = command == TP_CM_RTS
            && my_address != ADDRESS_NULL
            && destination_address == my_address;

        let pgn = get_le(data, 5, 3).unwrap_or(0) as u32;
        if !TP_PGNS.contains(&pgn) {
            trace!("Refusing TP connection for PGN {:04X}", pgn);
            return if send_response {
                vec![abort_packet(my_address, source_address, pgn, AbortReason::NoSystemResources)]
            } else {
                Vec::new()
            };
        }

        let expected_packets = data[3];
        if expected_packets == 0 {
            return Vec::new();
        }

        let slot = self
            .find_open(source_address, destination_address)
            .or_else(|| self.connections.iter().position(Option::is_none));

        let Some(slot) = slot else {
            warn!("Max open TP connections {} reached, connection discarded", MAX_TP_CONNECTIONS);
            return if send_response {
                vec![abort_packet(my_address, source_address, pgn, AbortReason::MaxConnections)]
            } else {
                Vec::new()
            };
        };

        let expected_bytes = usize::from(u16::from_le_bytes([data[1], data[2]]));
        let max_packets_per_burst = data[4].min(MAX_TP_FRAMES_PER_BURST);

        debug!(
            "TP accept {:02X} to {:02X} ({:04X}) expect {} packets {} bytes",
            source_address, destination_address, pgn, expected_packets, expected_bytes
        );

        self.connections[slot] = Some(TpConnection {
            pgn,
            expected_bytes,
            expected_packets,
            max_packets_per_burst,
            source_address,
            destination_address,
            timeout_deadline: now + TP_TIMEOUT_MS,
            data: vec![0xFF; expected_bytes],
        });

        if send_response {
            vec![cts_packet(my_address, source_address, pgn, max_packets_per_burst, 1)]
        } else {
            Vec::new()
        }
    }

    /// Handle a TP.DT packet
    pub fn receive_connection_data(
        &mut self,
        source_address: u8,
        destination_address: u8,
        data: &[u8; 8],
        my_address: u8,
        now: Millis,
    ) -> DataOutcome {
        let mut outcome = DataOutcome::default();

        let Some(slot) = self.find_open(source_address, destination_address) else {
            return outcome;
        };
        let Some(tp) = self.connections[slot].as_mut() else {
            return outcome;
        };

        tp.timeout_deadline = now + TP_TIMEOUT_MS;
        let send_response = !tp.is_broadcast() && tp.destination_address == my_address;

        let sequence = data[0];
        if sequence == 0 {
            warn!("Bad sequence number 0 on TP data packet");
            return outcome;
        }

        let start = usize::from(sequence - 1) * BYTES_PER_PACKET;
        for (i, &byte) in data[1..].iter().enumerate() {
            if let Some(dst) = tp.data.get_mut(start + i) {
                *dst = byte;
            }
        }

        if sequence >= tp.expected_packets {
            let (pgn, bytes, packets) = (tp.pgn, tp.expected_bytes, tp.expected_packets);
            let data = std::mem::take(&mut tp.data);
            self.connections[slot] = None;

            outcome.completed = Some(CompletedMessage {
                source_address,
                pgn,
                data,
            });
            if send_response {
                outcome.replies.push(eom_packet(my_address, source_address, pgn, bytes, packets));
            }
        } else if send_response {
            outcome.replies.push(cts_packet(
                my_address,
                source_address,
                tp.pgn,
                tp.max_packets_per_burst,
                sequence + 1,
            ));
        }

        outcome
    }

    /// Remove sessions idle past their deadline, aborting the unicast ones
    pub fn purge(&mut self, now: Millis, my_address: u8) -> Vec<Packet> {
        let mut aborts = Vec::new();
        for slot in self.connections.iter_mut() {
            let expired = matches!(slot, Some(tp) if tp.timeout_deadline < now);
            if !expired {
                continue;
            }
            if let Some(tp) = slot.take() {
                debug!(
                    "TP connection {:02X} ({:04X}) timed out",
                    tp.source_address, tp.pgn
                );
                if !tp.is_broadcast() && my_address != ADDRESS_NULL {
                    aborts.push(abort_packet(my_address, tp.source_address, tp.pgn, AbortReason::Timeout));
                }
            }
        }
        aborts
    }

    /// Drop every session without sending aborts
    pub fn clear(&mut self) {
        self.connections = Default::default();
    }
}

fn cm_packet(from: u8, to: u8, pgn: u32) -> Packet {
    let mut packet = Packet::new(PF_CONNECTION_MANAGE, to, from);
    put_le(&mut packet.data, 5, 3, u64::from(pgn));
    packet
}

pub fn abort_packet(from: u8, to: u8, pgn: u32, reason: AbortReason) -> Packet {
    let mut packet = cm_packet(from, to, pgn);
    packet.data[0] = TP_CM_ABORT;
    packet.data[1] = reason as u8;
    packet
}

pub fn cts_packet(from: u8, to: u8, pgn: u32, max_packets: u8, next_packet: u8) -> Packet {
    let mut packet = cm_packet(from, to, pgn);
    packet.data[0] = TP_CM_CTS;
    packet.data[1] = max_packets;
    packet.data[2] = next_packet;
    packet
}

pub fn eom_packet(from: u8, to: u8, pgn: u32, total_bytes: usize, total_packets: u8) -> Packet {
    let mut packet = cm_packet(from, to, pgn);
    packet.data[0] = TP_CM_EOM;
    put_le(&mut packet.data, 1, 2, total_bytes as u64);
    packet.data[3] = total_packets;
    packet
}

#[cfg(test)]
mod tests {
    use super::*;

    const ME: u8 = 0x80;
    const PEER: u8 = 0x00;

    fn rts(bytes: u16, packets: u8, pgn: u32) -> [u8; 8] {
        let b = bytes.to_le_bytes();
        let p = pgn.to_le_bytes();
        [TP_CM_RTS, b[0], b[1], packets, 0xFF, p[0], p[1], p[2]]
    }

    fn bam(bytes: u16, packets: u8, pgn: u32) -> [u8; 8] {
        let mut data = rts(bytes, packets, pgn);
        data[0] = TP_CM_BAM;
        data
    }

    fn dt(sequence: u8, fill: u8) -> [u8; 8] {
        let mut data = [fill; 8];
        data[0] = sequence;
        data
    }

    #[test]
    fn test_rts_accepted_with_cts() {
        let mut tp = TpManager::new();
        let replies = tp.receive_connection_manage(PEER, ME, &rts(17, 3, PGN_VIN), ME, 0);

        assert_eq!(replies.len(), 1);
        let cts = &replies[0];
        assert_eq!(cts.destination_address, PEER);
        assert_eq!(cts.source_address, ME);
        assert_eq!(cts.data, [TP_CM_CTS, 1, 1, 0xFF, 0xFF, 0xEC, 0xFE, 0x00]);
        assert_eq!(tp.open_count(), 1);
    }

    #[test]
    fn test_three_packet_reassembly() {
        let mut tp = TpManager::new();
        tp.receive_connection_manage(PEER, ME, &rts(17, 3, PGN_VIN), ME, 0);

        let first = tp.receive_connection_data(PEER, ME, &dt(1, b'A'), ME, 10);
        assert!(first.completed.is_none());
        assert_eq!(first.replies[0].data[0], TP_CM_CTS);
        assert_eq!(first.replies[0].data[2], 2, "Next packet requested");

        let second = tp.receive_connection_data(PEER, ME, &dt(2, b'B'), ME, 20);
        assert!(second.completed.is_none());

        let last = tp.receive_connection_data(PEER, ME, &dt(3, b'C'), ME, 30);
        let message = last.completed.expect("message completed");
        assert_eq!(message.pgn, PGN_VIN);
        assert_eq!(message.source_address, PEER);
        assert_eq!(message.data, b"AAAAAAABBBBBBBCCC".to_vec(), "Trailing bytes beyond declared size dropped");

        assert_eq!(last.replies.len(), 1, "Exactly one EOM");
        assert_eq!(last.replies[0].data[..4], [TP_CM_EOM, 17, 0, 3]);
        assert_eq!(tp.open_count(), 0);
    }

    #[test]
    fn test_bam_reassembly_is_silent() {
        let mut tp = TpManager::new();
        let replies = tp.receive_connection_manage(PEER, ADDRESS_GLOBAL, &bam(10, 2, PGN_FAULT_DM1), ME, 0);
        assert!(replies.is_empty());

        let first = tp.receive_connection_data(PEER, ADDRESS_GLOBAL, &dt(1, 1), ME, 50);
        assert!(first.replies.is_empty());
        let last = tp.receive_connection_data(PEER, ADDRESS_GLOBAL, &dt(2, 2), ME, 100);
        assert!(last.replies.is_empty(), "No EOM for broadcast");
        assert_eq!(last.completed.map(|m| m.data.len()), Some(10));
    }

    #[test]
    fn test_unlisted_pgn_refused() {
        let mut tp = TpManager::new();
        let replies = tp.receive_connection_manage(PEER, ME, &rts(20, 3, 0xFEE5), ME, 0);
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].data[0], TP_CM_ABORT);
        assert_eq!(replies[0].data[1], AbortReason::NoSystemResources as u8);
        assert_eq!(tp.open_count(), 0);

        let replies = tp.receive_connection_manage(PEER, ADDRESS_GLOBAL, &bam(20, 3, 0xFEE5), ME, 0);
        assert!(replies.is_empty(), "Never answer a broadcast");
    }

    #[test]
    fn test_pool_full_refused() {
        let mut tp = TpManager::new();
        for source in 0..MAX_TP_CONNECTIONS as u8 {
            tp.receive_connection_manage(source, ME, &rts(17, 3, PGN_VIN), ME, 0);
        }
        assert_eq!(tp.open_count(), MAX_TP_CONNECTIONS);

        let replies = tp.receive_connection_manage(0x40, ME, &rts(17, 3, PGN_VIN), ME, 0);
        assert_eq!(replies[0].data[0], TP_CM_ABORT);
        assert_eq!(replies[0].data[1], AbortReason::MaxConnections as u8);

        let replies = tp.receive_connection_manage(0x40, ADDRESS_GLOBAL, &bam(17, 3, PGN_VIN), ME, 0);
        assert!(replies.is_empty());
    }

    #[test]
    fn test_repeat_rts_reuses_slot() {
        let mut tp = TpManager::new();
        tp.receive_connection_manage(PEER, ME, &rts(17, 3, PGN_VIN), ME, 0);
        tp.receive_connection_manage(PEER, ME, &rts(30, 5, PGN_FAULT_DM1), ME, 0);
        assert_eq!(tp.open_count(), 1);
    }

    #[test]
    fn test_timeout_aborts_once_without_dispatch() {
        let mut tp = TpManager::new();
        tp.receive_connection_manage(PEER, ME, &rts(35, 5, PGN_FAULT_DM1), ME, 0);
        for seq in 1..=3 {
            assert!(tp.receive_connection_data(PEER, ME, &dt(seq, 0), ME, 100).completed.is_none());
        }

        assert!(tp.purge(100 + TP_TIMEOUT_MS, ME).is_empty(), "Deadline not yet passed");

        let aborts = tp.purge(100 + TP_TIMEOUT_MS + 1, ME);
        assert_eq!(aborts.len(), 1);
        assert_eq!(aborts[0].data[0], TP_CM_ABORT);
        assert_eq!(aborts[0].data[1], AbortReason::Timeout as u8);
        assert_eq!(aborts[0].destination_address, PEER);

        assert!(tp.purge(100 + 10 * TP_TIMEOUT_MS, ME).is_empty(), "Only one abort");
        assert_eq!(tp.open_count(), 0);
    }

    #[test]
    fn test_broadcast_timeout_is_silent() {
        let mut tp = TpManager::new();
        tp.receive_connection_manage(PEER, ADDRESS_GLOBAL, &bam(35, 5, PGN_FAULT_DM1), ME, 0);
        assert!(tp.purge(TP_TIMEOUT_MS + 1, ME).is_empty());
        assert_eq!(tp.open_count(), 0);
    }

    #[test]
    fn test_data_without_connection_ignored() {
        let mut tp = TpManager::new();
        let outcome = tp.receive_connection_data(PEER, ME, &dt(1, 0), ME, 0);
        assert_eq!(outcome, DataOutcome::default());
    }

    #[test]
    fn test_clear_drops_sessions() {
        let mut tp = TpManager::new();
        tp.receive_connection_manage(PEER, ME, &rts(17, 3, PGN_VIN), ME, 0);
        tp.clear();
        assert_eq!(tp.open_count(), 0);
        assert!(tp.purge(10_000, ME).is_empty());
    }
}
