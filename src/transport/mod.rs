//! Transport layer
//!
//! The multiplexer core is transport-agnostic: sessions are built over any
//! byte stream, so an encrypting wrapper can be layered underneath
//! transparently. This module provides the outbound side: the [`Dialer`]
//! seam the session uses to reach real targets when resolving an inbound
//! SYN, and the session factories use to reach the remote endpoint.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::net::TcpStream;

/// Transport layer errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connect timed out")]
    Timeout,
}

/// Opens byte-stream connections to target addresses
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, address: &str) -> Result<TcpStream, TransportError>;
}

/// Plain TCP dialer with a connect timeout
pub struct TcpDialer {
    pub connect_timeout: Duration,
}

impl Default for TcpDialer {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
        }
    }
}

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self, address: &str) -> Result<TcpStream, TransportError> {
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(address))
            .await
            .map_err(|_| TransportError::Timeout)??;

        // Small control frames must not sit in Nagle's buffer
        stream.set_nodelay(true).ok();
        Ok(stream)
    }
}
