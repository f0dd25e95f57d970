//! Outbound event queue, one FIFO per server

use std::collections::VecDeque;

use tracing::{debug, info, trace};

use crate::event::TelemetryEvent;

/// Persistent or in-memory store of events waiting for delivery
pub trait EventQueue: Send {
    /// Append an event for `server`, returns the assigned id
    fn push(&mut self, server: usize, event: TelemetryEvent) -> u64;

    /// Oldest event for `server`
    fn first(&self, server: usize) -> Option<&TelemetryEvent>;

    fn delete_by_id(&mut self, id: u64) -> bool;

    /// Delete the oldest event for `server` whatever its sequence id
    fn delete_top(&mut self, server: usize) -> bool;

    /// Delete the oldest event for `server` only if its masked sequence id matches
    fn delete_by_sequence(&mut self, server: usize, sequence_id: u16, mask: u16) -> bool;

    fn clear_all(&mut self);

    fn len(&self, server: usize) -> usize;
}

/// Queue held in memory
#[derive(Debug, Clone)]
pub struct MemoryQueue {
    servers: Vec<VecDeque<TelemetryEvent>>,
    next_id: u64,
}

impl MemoryQueue {
    pub fn new(num_servers: usize) -> Self {
        Self {
            servers: vec![VecDeque::new(); num_servers],
            next_id: 1,
        }
    }
}

impl EventQueue for MemoryQueue {
    fn push(&mut self, server: usize, mut event: TelemetryEvent) -> u64 {
        let Some(fifo) = self.servers.get_mut(server) else {
            return 0;
        };
        let id = self.next_id;
        self.next_id += 1;
        event.id = id;
        info!(
            server,
            "Queued event: type {} seq {} id {}", event.event_type, event.sequence_id, id
        );
        fifo.push_back(event);
        id
    }

    fn first(&self, server: usize) -> Option<&TelemetryEvent> {
        self.servers.get(server)?.front()
    }

    fn delete_by_id(&mut self, id: u64) -> bool {
        for fifo in &mut self.servers {
            if let Some(pos) = fifo.iter().position(|e| e.id == id) {
                trace!("Deleting queued event id {}", id);
                fifo.remove(pos);
                return true;
            }
        }
        false
    }

    fn delete_top(&mut self, server: usize) -> bool {
        self.servers
            .get_mut(server)
            .and_then(VecDeque::pop_front)
            .is_some()
    }

    fn delete_by_sequence(&mut self, server: usize, sequence_id: u16, mask: u16) -> bool {
        let Some(fifo) = self.servers.get_mut(server) else {
            return false;
        };
        match fifo.front() {
            Some(head) if head.sequence_id & mask == sequence_id & mask => {
                fifo.pop_front();
                true
            }
            Some(head) => {
                debug!(
                    server,
                    "Sequence mismatch, expected {} received {}", head.sequence_id, sequence_id
                );
                false
            }
            None => false,
        }
    }

    fn clear_all(&mut self) {
        for fifo in &mut self.servers {
            fifo.clear();
        }
    }

    fn len(&self, server: usize) -> usize {
        self.servers.get(server).map_or(0, VecDeque::len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventType;

    fn event(sequence_id: u16) -> TelemetryEvent {
        TelemetryEvent {
            sequence_id,
            ..TelemetryEvent::new(EventType::PING)
        }
    }

    #[test]
    fn test_fifo_per_server() {
        let mut queue = MemoryQueue::new(2);
        let a = queue.push(0, event(1));
        queue.push(0, event(2));
        queue.push(1, event(1));

        assert_eq!(queue.first(0).map(|e| e.id), Some(a));
        assert_eq!(queue.len(0), 2);
        assert_eq!(queue.len(1), 1);

        assert!(queue.delete_top(0));
        assert_eq!(queue.first(0).map(|e| e.sequence_id), Some(2));
        assert_eq!(queue.len(1), 1, "Other server untouched");
    }

    #[test]
    fn test_delete_by_sequence_only_matches_head() {
        let mut queue = MemoryQueue::new(2);
        queue.push(0, event(1));
        queue.push(0, event(2));

        assert!(!queue.delete_by_sequence(0, 2, 0xFFFF), "Not the head");
        assert_eq!(queue.len(0), 2);
        assert!(queue.delete_by_sequence(0, 1, 0xFFFF));
        assert!(queue.delete_by_sequence(0, 2, 0xFFFF));
        assert!(!queue.delete_by_sequence(0, 2, 0xFFFF), "Empty");
    }

    #[test]
    fn test_delete_by_sequence_uses_mask() {
        let mut queue = MemoryQueue::new(1);
        queue.push(0, event(0x1234));
        assert!(!queue.delete_by_sequence(0, 0x0034, 0xFFFF));
        assert!(queue.delete_by_sequence(0, 0x0034, 0x00FF));
    }

    #[test]
    fn test_delete_by_id_and_clear() {
        let mut queue = MemoryQueue::new(2);
        queue.push(0, event(1));
        let id = queue.push(1, event(2));
        assert!(queue.delete_by_id(id));
        assert!(!queue.delete_by_id(id));

        queue.push(1, event(3));
        queue.clear_all();
        assert_eq!(queue.len(0) + queue.len(1), 0);
    }

    #[test]
    fn test_unknown_server_ignored() {
        let mut queue = MemoryQueue::new(1);
        assert_eq!(queue.push(3, event(1)), 0);
        assert!(queue.first(3).is_none());
        assert!(!queue.delete_top(3));
    }
}
