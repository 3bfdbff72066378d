//! Control message types.
//!
//! The ordinal values are part of the wire contract and must never be
//! reordered.

use std::fmt;

use crate::error::FrameError;

/// Control frame type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    /// Initiator asks to open a session.
    Connect = 0,
    /// Responder accepts a session.
    ConnectAck = 1,
    /// Liveness signal, empty body.
    Heartbeat = 2,
    /// Orderly session teardown.
    Disconnect = 3,
}

impl MessageType {
    /// Wire ordinal.
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Human-readable name.
    pub fn name(self) -> &'static str {
        match self {
            MessageType::Connect => "CONNECT",
            MessageType::ConnectAck => "CONNECT_ACK",
            MessageType::Heartbeat => "HEARTBEAT",
            MessageType::Disconnect => "DISCONNECT",
        }
    }
}

impl TryFrom<u8> for MessageType {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(MessageType::Connect),
            1 => Ok(MessageType::ConnectAck),
            2 => Ok(MessageType::Heartbeat),
            3 => Ok(MessageType::Disconnect),
            other => Err(FrameError::UnknownType(other)),
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordinals_are_stable() {
        assert_eq!(MessageType::Connect.as_u8(), 0);
        assert_eq!(MessageType::ConnectAck.as_u8(), 1);
        assert_eq!(MessageType::Heartbeat.as_u8(), 2);
        assert_eq!(MessageType::Disconnect.as_u8(), 3);
    }

    #[test]
    fn unknown_tag_rejected() {
        assert_eq!(MessageType::try_from(4), Err(FrameError::UnknownType(4)));
        assert_eq!(MessageType::try_from(255), Err(FrameError::UnknownType(255)));
    }

    #[test]
    fn display_uses_wire_names() {
        assert_eq!(MessageType::ConnectAck.to_string(), "CONNECT_ACK");
    }
}
