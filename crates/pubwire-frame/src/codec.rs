use bytes::{Buf, BufMut, Bytes, BytesMut};
use uuid::Uuid;

use crate::error::{FrameError, Result};
use crate::message_type::MessageType;

/// Frame header: type (1) + session id (8) = 9 bytes.
pub const HEADER_SIZE: usize = 9;

const UUID_SIZE: usize = 16;
const INT_SIZE: usize = 4;
const LONG_SIZE: usize = 8;

/// Type-specific body of a control frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlFrame {
    /// Initiator asks to open a session and advertises where it listens.
    Connect {
        connect_request_id: Uuid,
        client_channel: String,
        client_control_stream_id: i32,
        client_session_stream_id: i32,
    },
    /// Responder accepts the session identified by `connect_request_id`.
    ConnectAck {
        server_session_stream_id: i32,
        connect_request_id: Uuid,
    },
    /// Liveness signal.
    Heartbeat,
    /// Orderly teardown of `session_id`.
    Disconnect { session_id: u64 },
}

impl ControlFrame {
    /// The wire type tag of this body.
    pub fn message_type(&self) -> MessageType {
        match self {
            ControlFrame::Connect { .. } => MessageType::Connect,
            ControlFrame::ConnectAck { .. } => MessageType::ConnectAck,
            ControlFrame::Heartbeat => MessageType::Heartbeat,
            ControlFrame::Disconnect { .. } => MessageType::Disconnect,
        }
    }

    /// Exact encoded body length in bytes.
    pub fn body_len(&self) -> usize {
        match self {
            ControlFrame::Connect { client_channel, .. } => {
                UUID_SIZE + INT_SIZE + client_channel.len() + INT_SIZE * 2
            }
            ControlFrame::ConnectAck { .. } => INT_SIZE + UUID_SIZE,
            ControlFrame::Heartbeat => 0,
            ControlFrame::Disconnect { .. } => LONG_SIZE,
        }
    }

    fn put_body(&self, dst: &mut BytesMut) {
        match self {
            ControlFrame::Connect {
                connect_request_id,
                client_channel,
                client_control_stream_id,
                client_session_stream_id,
            } => {
                put_uuid(dst, connect_request_id);
                dst.put_i32_le(client_channel.len() as i32);
                dst.put_slice(client_channel.as_bytes());
                dst.put_i32_le(*client_control_stream_id);
                dst.put_i32_le(*client_session_stream_id);
            }
            ControlFrame::ConnectAck {
                server_session_stream_id,
                connect_request_id,
            } => {
                dst.put_i32_le(*server_session_stream_id);
                put_uuid(dst, connect_request_id);
            }
            ControlFrame::Heartbeat => {}
            ControlFrame::Disconnect { session_id } => dst.put_u64_le(*session_id),
        }
    }
}

/// A complete control frame: header session id plus body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Session this frame belongs to (0 before the responder assigned one).
    pub session_id: u64,
    /// The type-specific body.
    pub body: ControlFrame,
}

impl Frame {
    /// Create a new frame.
    pub fn new(session_id: u64, body: ControlFrame) -> Self {
        Self { session_id, body }
    }

    /// The frame type tag.
    pub fn message_type(&self) -> MessageType {
        self.body.message_type()
    }

    /// The total wire size of this frame (header + body).
    pub fn wire_size(&self) -> usize {
        HEADER_SIZE + self.body.body_len()
    }

    /// Encode into a freshly allocated buffer of exactly [`Frame::wire_size`] bytes.
    pub fn to_bytes(&self) -> Result<Bytes> {
        let mut dst = BytesMut::with_capacity(self.wire_size());
        encode_frame(self, &mut dst)?;
        Ok(dst.freeze())
    }
}

/// Encode the 9-byte header.
///
/// ```text
/// ┌──────────┬──────────────────────┐
/// │ Type (1B)│ Session id (8B LE)   │
/// └──────────┴──────────────────────┘
/// ```
pub fn encode_header(message_type: MessageType, session_id: u64) -> [u8; HEADER_SIZE] {
    let mut header = [0u8; HEADER_SIZE];
    header[0] = message_type.as_u8();
    header[1..].copy_from_slice(&session_id.to_le_bytes());
    header
}

/// Decode the 9-byte header at the start of `src`.
pub fn decode_header(src: &[u8]) -> Result<(MessageType, u64)> {
    need(src, HEADER_SIZE)?;
    let message_type = MessageType::try_from(src[0])?;
    let mut session = [0u8; LONG_SIZE];
    session.copy_from_slice(&src[1..HEADER_SIZE]);
    Ok((message_type, u64::from_le_bytes(session)))
}

/// Encode a frame into the wire format.
///
/// Fails only if the client channel of a CONNECT body does not fit an `i32`
/// length field.
pub fn encode_frame(frame: &Frame, dst: &mut BytesMut) -> Result<()> {
    if let ControlFrame::Connect { client_channel, .. } = &frame.body {
        if client_channel.len() > i32::MAX as usize {
            return Err(FrameError::InvalidLength(i32::MAX));
        }
    }

    dst.reserve(frame.wire_size());
    dst.put_slice(&encode_header(frame.message_type(), frame.session_id));
    frame.body.put_body(dst);
    Ok(())
}

/// Decode one complete frame from a datagram.
///
/// The datagram must contain exactly one frame; short buffers, unknown type
/// tags, negative lengths and trailing bytes are all rejected.
pub fn decode_frame(src: &[u8]) -> Result<Frame> {
    let (message_type, session_id) = decode_header(src)?;
    let mut body = &src[HEADER_SIZE..];

    let control = match message_type {
        MessageType::Connect => {
            let connect_request_id = get_uuid(&mut body)?;
            let channel_len = get_i32(&mut body)?;
            if channel_len < 0 {
                return Err(FrameError::InvalidLength(channel_len));
            }
            let channel_len = channel_len as usize;
            need(body, channel_len)?;
            let client_channel = std::str::from_utf8(&body[..channel_len])
                .map_err(|_| FrameError::InvalidUtf8)?
                .to_string();
            body.advance(channel_len);
            let client_control_stream_id = get_i32(&mut body)?;
            let client_session_stream_id = get_i32(&mut body)?;
            ControlFrame::Connect {
                connect_request_id,
                client_channel,
                client_control_stream_id,
                client_session_stream_id,
            }
        }
        MessageType::ConnectAck => {
            let server_session_stream_id = get_i32(&mut body)?;
            let connect_request_id = get_uuid(&mut body)?;
            ControlFrame::ConnectAck {
                server_session_stream_id,
                connect_request_id,
            }
        }
        MessageType::Heartbeat => ControlFrame::Heartbeat,
        MessageType::Disconnect => {
            need(body, LONG_SIZE)?;
            ControlFrame::Disconnect {
                session_id: body.get_u64_le(),
            }
        }
    };

    if !body.is_empty() {
        return Err(FrameError::TrailingBytes(body.len()));
    }

    Ok(Frame::new(session_id, control))
}

/// Encoded CONNECT body.
pub fn connect_body(
    connect_request_id: Uuid,
    client_channel: &str,
    client_control_stream_id: i32,
    client_session_stream_id: i32,
) -> Bytes {
    body_bytes(&ControlFrame::Connect {
        connect_request_id,
        client_channel: client_channel.to_string(),
        client_control_stream_id,
        client_session_stream_id,
    })
}

/// Encoded CONNECT_ACK body.
pub fn connect_ack_body(connect_request_id: Uuid, server_session_stream_id: i32) -> Bytes {
    body_bytes(&ControlFrame::ConnectAck {
        server_session_stream_id,
        connect_request_id,
    })
}

/// Encoded HEARTBEAT body (always empty).
pub fn heartbeat_body() -> Bytes {
    Bytes::new()
}

/// Encoded DISCONNECT body.
pub fn disconnect_body(session_id: u64) -> Bytes {
    body_bytes(&ControlFrame::Disconnect { session_id })
}

fn body_bytes(body: &ControlFrame) -> Bytes {
    let mut dst = BytesMut::with_capacity(body.body_len());
    body.put_body(&mut dst);
    dst.freeze()
}

fn put_uuid(dst: &mut BytesMut, id: &Uuid) {
    let (high, low) = id.as_u64_pair();
    dst.put_u64_le(high);
    dst.put_u64_le(low);
}

fn get_uuid(src: &mut &[u8]) -> Result<Uuid> {
    need(src, UUID_SIZE)?;
    let high = src.get_u64_le();
    let low = src.get_u64_le();
    Ok(Uuid::from_u64_pair(high, low))
}

fn get_i32(src: &mut &[u8]) -> Result<i32> {
    need(src, INT_SIZE)?;
    Ok(src.get_i32_le())
}

fn need(src: &[u8], needed: usize) -> Result<()> {
    if src.len() < needed {
        return Err(FrameError::Truncated {
            needed,
            available: src.len(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connect_frame() -> Frame {
        Frame::new(
            0,
            ControlFrame::Connect {
                connect_request_id: Uuid::from_u64_pair(0x0102_0304_0506_0708, 0x1112_1314_1516_1718),
                client_channel: "udp://127.0.0.1:13001".to_string(),
                client_control_stream_id: 3,
                client_session_stream_id: 4,
            },
        )
    }

    #[test]
    fn test_header_layout() {
        let header = encode_header(MessageType::ConnectAck, 0x0A0B);
        assert_eq!(header[0], 1);
        assert_eq!(&header[1..], &0x0A0Bu64.to_le_bytes());
        assert_eq!(decode_header(&header).unwrap(), (MessageType::ConnectAck, 0x0A0B));
    }

    #[test]
    fn test_decode_header_too_short() {
        for len in 0..HEADER_SIZE {
            let buf = vec![0u8; len];
            assert_eq!(
                decode_header(&buf),
                Err(FrameError::Truncated {
                    needed: HEADER_SIZE,
                    available: len
                })
            );
            assert!(decode_frame(&buf).is_err());
        }
    }

    #[test]
    fn test_decode_unknown_type() {
        let mut buf = encode_header(MessageType::Heartbeat, 1);
        buf[0] = 9;
        assert_eq!(decode_frame(&buf), Err(FrameError::UnknownType(9)));
    }

    #[test]
    fn test_roundtrip_all_variants() {
        let id = Uuid::new_v4();
        let frames = [
            connect_frame(),
            Frame::new(
                42,
                ControlFrame::ConnectAck {
                    server_session_stream_id: 7,
                    connect_request_id: id,
                },
            ),
            Frame::new(42, ControlFrame::Heartbeat),
            Frame::new(42, ControlFrame::Disconnect { session_id: 42 }),
        ];

        for frame in frames {
            let wire = frame.to_bytes().unwrap();
            assert_eq!(wire.len(), frame.wire_size());
            assert_eq!(decode_frame(&wire).unwrap(), frame);
        }
    }

    #[test]
    fn test_connect_body_layout() {
        let frame = connect_frame();
        let wire = frame.to_bytes().unwrap();
        let body = &wire[HEADER_SIZE..];

        assert_eq!(&body[..8], &0x0102_0304_0506_0708u64.to_le_bytes());
        assert_eq!(&body[8..16], &0x1112_1314_1516_1718u64.to_le_bytes());
        let channel = "udp://127.0.0.1:13001";
        assert_eq!(&body[16..20], &(channel.len() as i32).to_le_bytes());
        assert_eq!(&body[20..20 + channel.len()], channel.as_bytes());
        assert_eq!(&body[20 + channel.len()..24 + channel.len()], &3i32.to_le_bytes());
        assert_eq!(&body[24 + channel.len()..], &4i32.to_le_bytes());
    }

    #[test]
    fn test_body_helpers_match_frame_encoding() {
        let id = Uuid::new_v4();
        let wire = Frame::new(
            5,
            ControlFrame::ConnectAck {
                server_session_stream_id: 11,
                connect_request_id: id,
            },
        )
        .to_bytes()
        .unwrap();
        assert_eq!(&wire[HEADER_SIZE..], connect_ack_body(id, 11).as_ref());

        let wire = Frame::new(5, ControlFrame::Disconnect { session_id: 5 })
            .to_bytes()
            .unwrap();
        assert_eq!(&wire[HEADER_SIZE..], disconnect_body(5).as_ref());
        assert!(heartbeat_body().is_empty());
        assert_eq!(
            connect_body(id, "c", 1, 2).len(),
            ControlFrame::Connect {
                connect_request_id: id,
                client_channel: "c".to_string(),
                client_control_stream_id: 1,
                client_session_stream_id: 2,
            }
            .body_len()
        );
    }

    #[test]
    fn test_truncated_bodies_rejected() {
        let frames = [
            connect_frame(),
            Frame::new(
                1,
                ControlFrame::ConnectAck {
                    server_session_stream_id: 1,
                    connect_request_id: Uuid::nil(),
                },
            ),
            Frame::new(1, ControlFrame::Disconnect { session_id: 1 }),
        ];
        for frame in frames {
            let wire = frame.to_bytes().unwrap();
            for cut in HEADER_SIZE..wire.len() {
                assert!(
                    matches!(decode_frame(&wire[..cut]), Err(FrameError::Truncated { .. })),
                    "{:?} cut at {cut}",
                    frame.message_type()
                );
            }
        }
    }

    #[test]
    fn test_negative_channel_length_rejected() {
        let mut buf = BytesMut::new();
        buf.put_slice(&encode_header(MessageType::Connect, 0));
        put_uuid(&mut buf, &Uuid::nil());
        buf.put_i32_le(-1);
        buf.put_i32_le(0);
        buf.put_i32_le(0);
        assert_eq!(decode_frame(&buf), Err(FrameError::InvalidLength(-1)));
    }

    #[test]
    fn test_oversized_channel_length_rejected_without_allocation() {
        let mut buf = BytesMut::new();
        buf.put_slice(&encode_header(MessageType::Connect, 0));
        put_uuid(&mut buf, &Uuid::nil());
        buf.put_i32_le(i32::MAX);
        assert!(matches!(
            decode_frame(&buf),
            Err(FrameError::Truncated { .. })
        ));
    }

    #[test]
    fn test_invalid_utf8_channel_rejected() {
        let mut buf = BytesMut::new();
        buf.put_slice(&encode_header(MessageType::Connect, 0));
        put_uuid(&mut buf, &Uuid::nil());
        buf.put_i32_le(2);
        buf.put_slice(&[0xC3, 0x28]);
        buf.put_i32_le(0);
        buf.put_i32_le(0);
        assert_eq!(decode_frame(&buf), Err(FrameError::InvalidUtf8));
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let mut buf = BytesMut::new();
        buf.put_slice(&encode_header(MessageType::Heartbeat, 3));
        buf.put_u8(0);
        assert_eq!(decode_frame(&buf), Err(FrameError::TrailingBytes(1)));
    }

    #[test]
    fn test_heartbeat_is_header_only() {
        let wire = Frame::new(77, ControlFrame::Heartbeat).to_bytes().unwrap();
        assert_eq!(wire.len(), HEADER_SIZE);
        assert_eq!(wire.as_ref(), &encode_header(MessageType::Heartbeat, 77));
    }
}
