//! Multiplexing layer
//!
//! Provides:
//! - Binary frame encoding/decoding
//! - Sessions demultiplexing many virtual streams over one link
//! - Windowed per-stream flow control
//! - Ping-pong liveness detection
//! - A pool of sessions with least-loaded selection

mod conn;
mod dns;
mod frame;
mod ping;
mod pool;
mod session;
mod window;

pub use conn::{Conn, ConnReader, ConnWriter};
pub use frame::{Frame, ReplyCode, FRAME_HEADER_SIZE, MAX_PAYLOAD_SIZE};
pub use pool::{PoolConfig, SessionFactory, SessionPool, SessionStatus, TcpSessionFactory};
pub use session::{
    client_handshake, server_handshake, CredentialStore, Session, SessionConfig, StreamStatus,
};
pub use window::Window;

use std::time::Duration;

use thiserror::Error;

/// Multiplexing layer errors
#[derive(Debug, Error)]
pub enum MuxError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("unknown frame type: 0x{0:02x}")]
    UnknownFrameType(u8),

    #[error("length mismatch in {frame} frame: declared {declared} bytes")]
    LengthMismatch { frame: &'static str, declared: usize },

    #[error("malformed {0} payload")]
    MalformedPayload(&'static str),

    #[error("unknown reply code: {0}")]
    UnknownReplyCode(u32),

    #[error("unexpected {0} frame")]
    UnexpectedFrame(&'static str),

    #[error("authentication failed")]
    AuthFailed,

    #[error("{0} timed out")]
    Timeout(&'static str),

    #[error("stream closed")]
    StreamClosed,

    #[error("session closed")]
    SessionClosed,

    #[error("no free stream id")]
    StreamIdsExhausted,

    #[error("peer refused stream: {0:?}")]
    DialRefused(ReplyCode),

    #[error("name resolution failed for {0}")]
    DnsFailed(String),

    #[error("no session available")]
    NoSession,
}

/// Default per-stream send window (4 MiB)
pub const DEFAULT_WINDOW: u32 = 4 * 1024 * 1024;

/// Write chunk size bounds. Large writes are split into randomized chunks in
/// this range so one busy stream cannot monopolize the link.
pub const CHUNK_MIN: usize = 4 * 1024;
pub const CHUNK_MAX: usize = 8 * 1024;

/// Received bytes accumulated before an ACK is forced out early
pub const ACK_BATCH: u32 = 64 * 1024;

/// Longest a pending ACK may be delayed
pub const ACK_DELAY: Duration = Duration::from_millis(100);

/// Capacity (in chunks) of a stream's inbound queue
pub(crate) const INBOUND_QUEUE_CHUNKS: usize = 1024;

/// Authentication handshake deadline
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Deadline for a SYN/RESULT stream-open round trip and for outbound dials
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(30);

/// Deadline for a DNS query over the link
pub const DNS_TIMEOUT: Duration = Duration::from_secs(10);

/// Base interval between liveness checks
pub const PING_INTERVAL: Duration = Duration::from_secs(10);

/// Random jitter added to or removed from the ping interval
pub const PING_JITTER: Duration = Duration::from_secs(3);

/// Missed liveness checks before the link is forcibly closed
pub const MISSED_CLOSE: u32 = 4;

/// Missed liveness checks before the session is marked game-over
pub const MISSED_GAMEOVER: u32 = 20;

/// Attempts a session factory gets before a creation request fails
pub const CREATE_RETRIES: usize = 3;
