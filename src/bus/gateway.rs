//! Datagram link to the vehicle bus gateway
//!
//! The gateway owns the CAN and J1708 hardware and exchanges frames with
//! this agent over local datagrams:
//!
//! ```text
//! kind(1)=1 CAN       id(4, LE) data(0..=8)
//! kind(1)=2 J1708     priority(1) mid(1) data(0..)
//! kind(1)=3 CAN bitrate bitrate(4, LE)
//! ```

use bytes::{Buf, BufMut, BytesMut};
use tokio::sync::mpsc;

use super::frame::{CanFrame, CanSink, J1708Frame, J1708Sink};
use crate::error::{Result, TelematicsError};

pub const KIND_CAN: u8 = 1;
pub const KIND_J1708: u8 = 2;
pub const KIND_CAN_BITRATE: u8 = 3;

/// Most data bytes in one CAN frame
pub const CAN_MAX_DATA: usize = 8;

/// One gateway datagram
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayMessage {
    Can(CanFrame),
    J1708(J1708Frame),
    /// To the gateway: open the CAN interface at this bitrate.
    /// From the gateway: the interface is up and can transmit at it.
    CanBitrate(u32),
}

impl GatewayMessage {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(16);
        match self {
            Self::Can(frame) => {
                buf.put_u8(KIND_CAN);
                buf.put_u32_le(frame.id);
                buf.put_slice(&frame.data);
            }
            Self::J1708(frame) => {
                buf.put_u8(KIND_J1708);
                buf.put_u8(frame.priority);
                buf.put_u8(frame.id);
                buf.put_slice(&frame.data);
            }
            Self::CanBitrate(bitrate) => {
                buf.put_u8(KIND_CAN_BITRATE);
                buf.put_u32_le(*bitrate);
            }
        }
        buf.to_vec()
    }

    pub fn decode(message: &[u8]) -> Result<Self> {
        let mut buf = message;
        if !buf.has_remaining() {
            return Err(TelematicsError::Bus("Empty gateway message".to_string()));
        }
        match buf.get_u8() {
            KIND_CAN => {
                if buf.remaining() < 4 || buf.remaining() > 4 + CAN_MAX_DATA {
                    return Err(TelematicsError::Bus(format!(
                        "Bad CAN message length {}",
                        message.len()
                    )));
                }
                let id = buf.get_u32_le();
                Ok(Self::Can(CanFrame::new(id, buf.to_vec())))
            }
            KIND_J1708 => {
                if buf.remaining() < 2 {
                    return Err(TelematicsError::Bus("J1708 message too short".to_string()));
                }
                let priority = buf.get_u8();
                let mid = buf.get_u8();
                Ok(Self::J1708(J1708Frame::new(priority, mid, buf.to_vec())))
            }
            KIND_CAN_BITRATE => {
                if buf.remaining() < 4 {
                    return Err(TelematicsError::Bus("CAN bitrate message too short".to_string()));
                }
                Ok(Self::CanBitrate(buf.get_u32_le()))
            }
            kind => Err(TelematicsError::Bus(format!("Unknown gateway message kind {}", kind))),
        }
    }
}

/// Transmit sink handing frames to the gateway task
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<GatewayMessage>,
}

/// Sink plus the receiver the gateway task drains
pub fn channel() -> (ChannelSink, mpsc::UnboundedReceiver<GatewayMessage>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (ChannelSink { tx }, rx)
}

impl CanSink for ChannelSink {
    fn send(&mut self, frame: CanFrame) -> bool {
        self.tx.send(GatewayMessage::Can(frame)).is_ok()
    }
}

impl J1708Sink for ChannelSink {
    fn send(&mut self, frame: J1708Frame) -> bool {
        self.tx.send(GatewayMessage::J1708(frame)).is_ok()
    }
}
