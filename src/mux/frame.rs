//! Frame encoding/decoding for the multiplexing protocol
//!
//! Frame format (big-endian):
//! ```text
//! +--------+-----------------+-----------------+
//! |  Type  |   Length (2B)   |  Stream ID (2B) |
//! +--------+-----------------+-----------------+
//! |            Payload (Length bytes)          |
//! +--------------------------------------------+
//! ```
//!
//! Stream ID 0 is reserved for session-level frames (AUTH/RESULT handshake,
//! PING). A declared length that does not match the payload a type requires
//! is a protocol violation: decoding fails and the link is torn down. There
//! is no resynchronization once the frame boundary is in doubt.

use super::MuxError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

/// Fixed header size in bytes: type(1) + length(2) + stream_id(2)
pub const FRAME_HEADER_SIZE: usize = 5;

/// Maximum payload size (16-bit length field)
pub const MAX_PAYLOAD_SIZE: usize = 65535;

const TYPE_RESULT: u8 = 0x00;
const TYPE_AUTH: u8 = 0x01;
const TYPE_DATA: u8 = 0x02;
const TYPE_SYN: u8 = 0x03;
const TYPE_ACK: u8 = 0x04;
const TYPE_FIN: u8 = 0x05;
const TYPE_RST: u8 = 0x06;
const TYPE_PING: u8 = 0x07;
const TYPE_DNS: u8 = 0x08;

/// Status codes carried by RESULT frames
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ReplyCode {
    /// Request accepted
    Ok = 0,
    /// Credentials rejected during handshake
    AuthFailed = 1,
    /// SYN named a stream id that is already live
    IdExists = 2,
    /// Outbound dial to the requested target failed
    ConnFailed = 3,
    /// Stream already torn down
    Closed = 4,
    /// DNS resolution over the link failed
    DnsFailed = 5,
}

impl TryFrom<u32> for ReplyCode {
    type Error = MuxError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(ReplyCode::Ok),
            1 => Ok(ReplyCode::AuthFailed),
            2 => Ok(ReplyCode::IdExists),
            3 => Ok(ReplyCode::ConnFailed),
            4 => Ok(ReplyCode::Closed),
            5 => Ok(ReplyCode::DnsFailed),
            other => Err(MuxError::UnknownReplyCode(other)),
        }
    }
}

/// A protocol frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Outcome of a handshake, SYN or DNS request
    Result { stream_id: u16, code: ReplyCode },
    /// Session authentication request (stream 0 only)
    Auth {
        stream_id: u16,
        username: String,
        password: String,
    },
    /// Stream payload bytes
    Data { stream_id: u16, payload: Bytes },
    /// Open a new stream to the given target address
    Syn { stream_id: u16, address: String },
    /// Window replenishment: the peer consumed `window` bytes
    Ack { stream_id: u16, window: u32 },
    /// Graceful stream close
    Fin { stream_id: u16 },
    /// Abrupt stream reset
    Rst { stream_id: u16 },
    /// Liveness probe / probe acknowledgement
    Ping { stream_id: u16 },
    /// DNS query or response routed over the link
    Dns { stream_id: u16, payload: Bytes },
}

impl Frame {
    /// The stream this frame is scoped to (0 = session level)
    pub fn stream_id(&self) -> u16 {
        match *self {
            Frame::Result { stream_id, .. }
            | Frame::Auth { stream_id, .. }
            | Frame::Data { stream_id, .. }
            | Frame::Syn { stream_id, .. }
            | Frame::Ack { stream_id, .. }
            | Frame::Fin { stream_id }
            | Frame::Rst { stream_id }
            | Frame::Ping { stream_id }
            | Frame::Dns { stream_id, .. } => stream_id,
        }
    }

    /// Short name for logs and error messages
    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Result { .. } => "RESULT",
            Frame::Auth { .. } => "AUTH",
            Frame::Data { .. } => "DATA",
            Frame::Syn { .. } => "SYN",
            Frame::Ack { .. } => "ACK",
            Frame::Fin { .. } => "FIN",
            Frame::Rst { .. } => "RST",
            Frame::Ping { .. } => "PING",
            Frame::Dns { .. } => "DNS",
        }
    }

    fn type_byte(&self) -> u8 {
        match self {
            Frame::Result { .. } => TYPE_RESULT,
            Frame::Auth { .. } => TYPE_AUTH,
            Frame::Data { .. } => TYPE_DATA,
            Frame::Syn { .. } => TYPE_SYN,
            Frame::Ack { .. } => TYPE_ACK,
            Frame::Fin { .. } => TYPE_FIN,
            Frame::Rst { .. } => TYPE_RST,
            Frame::Ping { .. } => TYPE_PING,
            Frame::Dns { .. } => TYPE_DNS,
        }
    }

    fn payload_len(&self) -> usize {
        match self {
            Frame::Result { .. } | Frame::Ack { .. } => 4,
            Frame::Auth {
                username, password, ..
            } => 4 + username.len() + password.len(),
            Frame::Data { payload, .. } | Frame::Dns { payload, .. } => payload.len(),
            Frame::Syn { address, .. } => 2 + address.len(),
            Frame::Fin { .. } | Frame::Rst { .. } | Frame::Ping { .. } => 0,
        }
    }

    /// Total size on the wire once encoded
    pub fn wire_len(&self) -> usize {
        FRAME_HEADER_SIZE + self.payload_len()
    }

    /// Encode the frame to bytes
    pub fn encode(&self) -> BytesMut {
        let payload_len = self.payload_len();
        debug_assert!(payload_len <= MAX_PAYLOAD_SIZE);

        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + payload_len);
        buf.put_u8(self.type_byte());
        buf.put_u16(payload_len as u16);
        buf.put_u16(self.stream_id());

        match self {
            Frame::Result { code, .. } => buf.put_u32(*code as u32),
            Frame::Auth {
                username, password, ..
            } => {
                buf.put_u16(username.len() as u16);
                buf.extend_from_slice(username.as_bytes());
                buf.put_u16(password.len() as u16);
                buf.extend_from_slice(password.as_bytes());
            }
            Frame::Data { payload, .. } | Frame::Dns { payload, .. } => {
                buf.extend_from_slice(payload);
            }
            Frame::Syn { address, .. } => {
                buf.put_u16(address.len() as u16);
                buf.extend_from_slice(address.as_bytes());
            }
            Frame::Ack { window, .. } => buf.put_u32(*window),
            Frame::Fin { .. } | Frame::Rst { .. } | Frame::Ping { .. } => {}
        }

        buf
    }

    /// Read one frame from the wire.
    ///
    /// Reads the fixed header, then exactly `length` payload bytes (never
    /// more, never less) so the stream stays framed even after a
    /// semantically unexpected frame. Truncated input, an unknown type byte
    /// or a length that contradicts the type's layout all fail the read.
    pub async fn read_from<R>(reader: &mut R) -> Result<Self, MuxError>
    where
        R: AsyncRead + Unpin,
    {
        let mut header = [0u8; FRAME_HEADER_SIZE];
        reader.read_exact(&mut header).await?;

        let frame_type = header[0];
        let length = u16::from_be_bytes([header[1], header[2]]) as usize;
        let stream_id = u16::from_be_bytes([header[3], header[4]]);

        let mut payload = vec![0u8; length];
        reader.read_exact(&mut payload).await?;

        Self::parse(frame_type, stream_id, payload)
    }

    fn parse(frame_type: u8, stream_id: u16, payload: Vec<u8>) -> Result<Self, MuxError> {
        let length = payload.len();
        match frame_type {
            TYPE_RESULT => {
                if length != 4 {
                    return Err(MuxError::LengthMismatch {
                        frame: "RESULT",
                        declared: length,
                    });
                }
                let errno = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
                Ok(Frame::Result {
                    stream_id,
                    code: ReplyCode::try_from(errno)?,
                })
            }
            TYPE_AUTH => {
                let mut buf = Bytes::from(payload);
                let username = take_string(&mut buf, "AUTH")?;
                let password = take_string(&mut buf, "AUTH")?;
                if buf.has_remaining() {
                    return Err(MuxError::LengthMismatch {
                        frame: "AUTH",
                        declared: length,
                    });
                }
                Ok(Frame::Auth {
                    stream_id,
                    username,
                    password,
                })
            }
            TYPE_DATA => Ok(Frame::Data {
                stream_id,
                payload: Bytes::from(payload),
            }),
            TYPE_SYN => {
                let mut buf = Bytes::from(payload);
                let address = take_string(&mut buf, "SYN")?;
                if buf.has_remaining() {
                    return Err(MuxError::LengthMismatch {
                        frame: "SYN",
                        declared: length,
                    });
                }
                Ok(Frame::Syn { stream_id, address })
            }
            TYPE_ACK => {
                if length != 4 {
                    return Err(MuxError::LengthMismatch {
                        frame: "ACK",
                        declared: length,
                    });
                }
                let window = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
                Ok(Frame::Ack { stream_id, window })
            }
            TYPE_FIN | TYPE_RST | TYPE_PING => {
                if length != 0 {
                    let frame = match frame_type {
                        TYPE_FIN => "FIN",
                        TYPE_RST => "RST",
                        _ => "PING",
                    };
                    return Err(MuxError::LengthMismatch {
                        frame,
                        declared: length,
                    });
                }
                Ok(match frame_type {
                    TYPE_FIN => Frame::Fin { stream_id },
                    TYPE_RST => Frame::Rst { stream_id },
                    _ => Frame::Ping { stream_id },
                })
            }
            TYPE_DNS => Ok(Frame::Dns {
                stream_id,
                payload: Bytes::from(payload),
            }),
            other => Err(MuxError::UnknownFrameType(other)),
        }
    }
}

/// Take one 2-byte-length-prefixed UTF-8 string out of a payload buffer
fn take_string(buf: &mut Bytes, frame: &'static str) -> Result<String, MuxError> {
    if buf.remaining() < 2 {
        return Err(MuxError::MalformedPayload(frame));
    }
    let len = buf.get_u16() as usize;
    if buf.remaining() < len {
        return Err(MuxError::MalformedPayload(frame));
    }
    let raw = buf.split_to(len);
    String::from_utf8(raw.to_vec()).map_err(|_| MuxError::MalformedPayload(frame))
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn roundtrip(frame: Frame) -> Frame {
        let encoded = frame.encode();
        let mut cursor: &[u8] = &encoded;
        Frame::read_from(&mut cursor).await.unwrap()
    }

    #[tokio::test]
    async fn test_roundtrip_all_types() {
        let frames = vec![
            Frame::Result {
                stream_id: 0,
                code: ReplyCode::Ok,
            },
            Frame::Result {
                stream_id: 9,
                code: ReplyCode::ConnFailed,
            },
            Frame::Auth {
                stream_id: 0,
                username: "alice".into(),
                password: "sekrit".into(),
            },
            Frame::Data {
                stream_id: 42,
                payload: Bytes::from_static(b"Hello, World!"),
            },
            Frame::Syn {
                stream_id: 7,
                address: "example.com:80".into(),
            },
            Frame::Ack {
                stream_id: 42,
                window: 65536,
            },
            Frame::Fin { stream_id: 42 },
            Frame::Rst { stream_id: 42 },
            Frame::Ping { stream_id: 0 },
            Frame::Dns {
                stream_id: 3,
                payload: Bytes::from_static(&[0x00, 0x0b]),
            },
        ];

        for frame in frames {
            let decoded = roundtrip(frame.clone()).await;
            assert_eq!(decoded, frame);
        }
    }

    #[tokio::test]
    async fn test_roundtrip_empty_and_max_payloads() {
        let empty = roundtrip(Frame::Data {
            stream_id: 1,
            payload: Bytes::new(),
        })
        .await;
        assert_eq!(
            empty,
            Frame::Data {
                stream_id: 1,
                payload: Bytes::new()
            }
        );

        let big = Bytes::from(vec![0xA5u8; MAX_PAYLOAD_SIZE]);
        let decoded = roundtrip(Frame::Data {
            stream_id: 65535,
            payload: big.clone(),
        })
        .await;
        assert_eq!(
            decoded,
            Frame::Data {
                stream_id: 65535,
                payload: big
            }
        );

        // Longest SYN address that still fits the 16-bit length
        let address = "a".repeat(MAX_PAYLOAD_SIZE - 2);
        let decoded = roundtrip(Frame::Syn {
            stream_id: 2,
            address: address.clone(),
        })
        .await;
        assert_eq!(decoded, Frame::Syn { stream_id: 2, address });
    }

    #[tokio::test]
    async fn test_reject_unknown_type() {
        let raw = [0xFFu8, 0x00, 0x00, 0x00, 0x01];
        let mut cursor: &[u8] = &raw;
        let err = Frame::read_from(&mut cursor).await.unwrap_err();
        assert!(matches!(err, MuxError::UnknownFrameType(0xFF)));
    }

    #[tokio::test]
    async fn test_reject_length_mismatch() {
        // RESULT claiming 3 payload bytes instead of 4
        let raw = [TYPE_RESULT, 0x00, 0x03, 0x00, 0x01, 0xAA, 0xBB, 0xCC];
        let mut cursor: &[u8] = &raw;
        let err = Frame::read_from(&mut cursor).await.unwrap_err();
        assert!(matches!(
            err,
            MuxError::LengthMismatch {
                frame: "RESULT",
                declared: 3
            }
        ));

        // PING with a payload
        let raw = [TYPE_PING, 0x00, 0x01, 0x00, 0x00, 0xAA];
        let mut cursor: &[u8] = &raw;
        let err = Frame::read_from(&mut cursor).await.unwrap_err();
        assert!(matches!(err, MuxError::LengthMismatch { frame: "PING", .. }));

        // SYN whose inner length overruns the declared length
        let raw = [TYPE_SYN, 0x00, 0x04, 0x00, 0x05, 0x00, 0xFF, b'h', b'i'];
        let mut cursor: &[u8] = &raw;
        let err = Frame::read_from(&mut cursor).await.unwrap_err();
        assert!(matches!(err, MuxError::MalformedPayload("SYN")));

        // AUTH with trailing garbage after both strings
        let mut raw = BytesMut::new();
        raw.put_u8(TYPE_AUTH);
        raw.put_u16(7);
        raw.put_u16(0);
        raw.put_u16(1);
        raw.put_u8(b'u');
        raw.put_u16(1);
        raw.put_u8(b'p');
        raw.put_u8(0xEE); // one byte too many
        let mut cursor: &[u8] = &raw;
        let err = Frame::read_from(&mut cursor).await.unwrap_err();
        assert!(matches!(err, MuxError::LengthMismatch { frame: "AUTH", .. }));
    }

    #[tokio::test]
    async fn test_reject_truncated_input() {
        let frame = Frame::Syn {
            stream_id: 1,
            address: "example.com:443".into(),
        };
        let encoded = frame.encode();

        // Cut mid-header and mid-payload
        for cut in [2, FRAME_HEADER_SIZE + 3] {
            let mut cursor: &[u8] = &encoded[..cut];
            let err = Frame::read_from(&mut cursor).await.unwrap_err();
            assert!(matches!(err, MuxError::Io(_)));
        }
    }

    #[tokio::test]
    async fn test_reject_unknown_reply_code() {
        let mut raw = BytesMut::new();
        raw.put_u8(TYPE_RESULT);
        raw.put_u16(4);
        raw.put_u16(0);
        raw.put_u32(999);
        let mut cursor: &[u8] = &raw;
        let err = Frame::read_from(&mut cursor).await.unwrap_err();
        assert!(matches!(err, MuxError::UnknownReplyCode(999)));
    }

    #[tokio::test]
    async fn test_stream_stays_framed_across_frames() {
        let mut wire = BytesMut::new();
        wire.extend_from_slice(&Frame::Ping { stream_id: 0 }.encode());
        wire.extend_from_slice(
            &Frame::Data {
                stream_id: 5,
                payload: Bytes::from_static(b"abc"),
            }
            .encode(),
        );
        wire.extend_from_slice(&Frame::Fin { stream_id: 5 }.encode());

        let mut cursor: &[u8] = &wire;
        assert_eq!(
            Frame::read_from(&mut cursor).await.unwrap(),
            Frame::Ping { stream_id: 0 }
        );
        assert_eq!(
            Frame::read_from(&mut cursor).await.unwrap(),
            Frame::Data {
                stream_id: 5,
                payload: Bytes::from_static(b"abc")
            }
        );
        assert_eq!(
            Frame::read_from(&mut cursor).await.unwrap(),
            Frame::Fin { stream_id: 5 }
        );
        assert!(cursor.is_empty());
    }
}
