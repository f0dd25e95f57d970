//! # Event Code Map
//!
//! Translates internal event type codes to the codes a server expects and
//! back. MO (mobile originated) maps cover outbound events, MT (mobile
//! terminated) maps cover inbound commands. Unmapped codes pass through.

use std::collections::HashMap;

use crate::event::EventType;

/// Event code remapping collaborator
pub trait CodeMap: Send {
    /// Inbound external code to internal event type
    fn map_mt(&self, external: u8) -> EventType;

    /// Outbound internal event type to external code
    fn map_mo(&self, internal: EventType) -> u8;

    /// Reverse of `map_mo`, used when re-reading outbound layouts
    fn unmap_mo(&self, external: u8) -> EventType;

    /// Store an outbound remap; an external code of 0 removes the entry
    fn write_mo(&mut self, internal: u8, external: u8) -> bool;

    /// Store an inbound remap; an internal code of 0 removes the entry
    fn write_mt(&mut self, external: u8, internal: u8) -> bool;

    fn clear_all(&mut self);
}

/// Code map held in memory
#[derive(Debug, Default, Clone)]
pub struct MemoryCodeMap {
    mo: HashMap<u8, u8>,
    mt: HashMap<u8, u8>,
}

impl MemoryCodeMap {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CodeMap for MemoryCodeMap {
    fn map_mt(&self, external: u8) -> EventType {
        EventType(self.mt.get(&external).copied().unwrap_or(external))
    }

    fn map_mo(&self, internal: EventType) -> u8 {
        self.mo.get(&internal.0).copied().unwrap_or(internal.0)
    }

    fn unmap_mo(&self, external: u8) -> EventType {
        let mapped = self
            .mo
            .iter()
            .find(|(_, &ext)| ext == external)
            .map(|(&int, _)| int);

        match mapped {
            Some(internal) => EventType(internal),
            // an unmapped code is only itself if nothing else claimed it
            None => EventType(external),
        }
    }

    fn write_mo(&mut self, internal: u8, external: u8) -> bool {
        if external == 0 {
            self.mo.remove(&internal);
        } else {
            self.mo.insert(internal, external);
        }
        true
    }

    fn write_mt(&mut self, external: u8, internal: u8) -> bool {
        if internal == 0 {
            self.mt.remove(&external);
        } else {
            self.mt.insert(external, internal);
        }
        true
    }

    fn clear_all(&mut self) {
        self.mo.clear();
        self.mt.clear();
    }
}
