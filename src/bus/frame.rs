//! Raw bus frames and the transmit side of the vehicle bus transport

use std::fmt;

/// CAN frame, 29-bit extended id, at most 8 data bytes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanFrame {
    pub id: u32,
    pub data: Vec<u8>,
}

impl CanFrame {
    pub fn new(id: u32, data: Vec<u8>) -> Self {
        Self { id, data }
    }
}

impl fmt::Display for CanFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08X} [", self.id)?;
        for (i, b) in self.data.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{:02X}", b)?;
        }
        f.write_str("]")
    }
}

/// J1708 frame: priority, message id (MID) and payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct J1708Frame {
    pub priority: u8,
    pub id: u8,
    pub data: Vec<u8>,
}

impl J1708Frame {
    pub fn new(priority: u8, id: u8, data: Vec<u8>) -> Self {
        Self { priority, id, data }
    }
}

/// Transmit side of a CAN transport
pub trait CanSink: Send {
    /// Queue a frame for transmission, returns false if the transport refused it
    fn send(&mut self, frame: CanFrame) -> bool;
}

/// Transmit side of a J1708 transport
pub trait J1708Sink: Send {
    fn send(&mut self, frame: J1708Frame) -> bool;
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_can_frame_display() {
        let frame = CanFrame::new(0x18EAFFFE, vec![0x00, 0xEE, 0x00]);
        assert_eq!(frame.to_string(), "18EAFFFE [00 EE 00]");
    }
}
