//! # Muxlink
//!
//! A TCP connection multiplexer: many independent logical byte streams are
//! carried over a small number of long-lived sessions to a remote endpoint,
//! avoiding per-connection setup cost and enabling pooling, load spreading
//! and transparent reconnection.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                 Proxy Front Ends                    │
//! │           (SOCKS5, HTTP CONNECT, relay)             │
//! ├─────────────────────────────────────────────────────┤
//! │                   Session Pool                      │
//! │       (least-loaded pick, growth, replacement)      │
//! ├─────────────────────────────────────────────────────┤
//! │                 Multiplexing Layer                  │
//! │  (sessions, virtual streams, windowed flow control) │
//! ├─────────────────────────────────────────────────────┤
//! │                  Frame Protocol                     │
//! │        (binary framing, AUTH/SYN/DATA/ACK/…)        │
//! ├─────────────────────────────────────────────────────┤
//! │                 Transport Layer                     │
//! │     (plain TCP; any byte stream can be layered)     │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod mux;
pub mod proxy;
pub mod transport;

pub use config::Config;

/// Protocol version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Mux error: {0}")]
    Mux(#[from] mux::MuxError),

    #[error("Transport error: {0}")]
    Transport(#[from] transport::TransportError),

    #[error("Proxy error: {0}")]
    Proxy(#[from] proxy::ProxyError),

    #[error("Configuration error: {0}")]
    Config(String),
}
