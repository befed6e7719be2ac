//! SOCKS5 proxy front end (RFC 1928)
//!
//! Translates CONNECT requests into dials through the session pool. The
//! reply code mirrors the dial outcome, so a client whose target cannot be
//! reached gets a proper failure instead of a dead tunnel.

use std::future::Future;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info};

use super::{relay, Address, ProxyError};
use crate::mux::{Conn, MuxError};

/// SOCKS5 version
const SOCKS_VERSION: u8 = 0x05;

/// Authentication methods
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AuthMethod {
    NoAuth = 0x00,
    UsernamePassword = 0x02,
    NoAcceptable = 0xFF,
}

/// SOCKS5 commands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    Connect = 0x01,
    Bind = 0x02,
    UdpAssociate = 0x03,
}

impl TryFrom<u8> for Command {
    type Error = ProxyError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Command::Connect),
            0x02 => Ok(Command::Bind),
            0x03 => Ok(Command::UdpAssociate),
            _ => Err(ProxyError::UnsupportedCommand(value)),
        }
    }
}

/// Address types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AddressType {
    Ipv4 = 0x01,
    Domain = 0x03,
    Ipv6 = 0x04,
}

impl TryFrom<u8> for AddressType {
    type Error = ProxyError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(AddressType::Ipv4),
            0x03 => Ok(AddressType::Domain),
            0x04 => Ok(AddressType::Ipv6),
            _ => Err(ProxyError::UnsupportedAddressType(value)),
        }
    }
}

/// Reply codes
#[derive(Debug, Clone, Copy)]
#[repr(u8)]
pub enum Reply {
    Succeeded = 0x00,
    GeneralFailure = 0x01,
    HostUnreachable = 0x04,
    ConnectionRefused = 0x05,
    CommandNotSupported = 0x07,
    AddressTypeNotSupported = 0x08,
}

/// Map a tunnel dial failure to the closest SOCKS5 reply
fn reply_for(err: &MuxError) -> Reply {
    match err {
        MuxError::NoSession | MuxError::SessionClosed => Reply::GeneralFailure,
        MuxError::DialRefused(_) => Reply::ConnectionRefused,
        MuxError::Timeout(_) => Reply::HostUnreachable,
        _ => Reply::HostUnreachable,
    }
}

/// SOCKS5 proxy server
pub struct Socks5Server {
    listener: TcpListener,
    /// Optional username/password authentication for local clients
    auth: Option<(String, String)>,
}

impl Socks5Server {
    /// Create a new SOCKS5 server
    pub async fn bind(addr: &str) -> Result<Self, ProxyError> {
        let listener = TcpListener::bind(addr).await?;
        info!("SOCKS5 server listening on {}", addr);

        Ok(Self {
            listener,
            auth: None,
        })
    }

    /// Enable username/password authentication
    pub fn with_auth(mut self, username: String, password: String) -> Self {
        self.auth = Some((username, password));
        self
    }

    /// Accept connections forever, dialing each CONNECT target through
    /// `dial` and splicing the client to the resulting virtual stream.
    pub async fn run<F, Fut>(&self, dial: F) -> Result<(), ProxyError>
    where
        F: Fn(String) -> Fut + Clone + Send + Sync + 'static,
        Fut: Future<Output = Result<Conn, MuxError>> + Send + 'static,
    {
        let auth = Arc::new(self.auth.clone());
        loop {
            let (stream, peer_addr) = self.listener.accept().await?;
            debug!("New SOCKS5 connection from {}", peer_addr);

            let dial = dial.clone();
            let auth = Arc::clone(&auth);

            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, auth, dial).await {
                    debug!("SOCKS5 connection error: {}", e);
                }
            });
        }
    }
}

async fn handle_connection<F, Fut>(
    mut stream: TcpStream,
    auth: Arc<Option<(String, String)>>,
    dial: F,
) -> Result<(), ProxyError>
where
    F: Fn(String) -> Fut,
    Fut: Future<Output = Result<Conn, MuxError>>,
{
    // Read greeting
    let mut buf = [0u8; 258];
    stream.read_exact(&mut buf[..2]).await?;

    if buf[0] != SOCKS_VERSION {
        return Err(ProxyError::InvalidSocksVersion(buf[0]));
    }

    let nmethods = buf[1] as usize;
    stream.read_exact(&mut buf[..nmethods]).await?;

    // Select authentication method
    let method = if auth.is_some() {
        if buf[..nmethods].contains(&(AuthMethod::UsernamePassword as u8)) {
            AuthMethod::UsernamePassword
        } else {
            AuthMethod::NoAcceptable
        }
    } else if buf[..nmethods].contains(&(AuthMethod::NoAuth as u8)) {
        AuthMethod::NoAuth
    } else {
        AuthMethod::NoAcceptable
    };

    // Send method selection
    stream.write_all(&[SOCKS_VERSION, method as u8]).await?;

    if method == AuthMethod::NoAcceptable {
        return Err(ProxyError::AuthenticationFailed);
    }

    // RFC 1929 username/password subnegotiation
    if method == AuthMethod::UsernamePassword {
        if let Some((expected_user, expected_pass)) = auth.as_ref() {
            stream.read_exact(&mut buf[..2]).await?; // version + ulen
            let ulen = buf[1] as usize;
            stream.read_exact(&mut buf[..ulen]).await?;
            let username = String::from_utf8_lossy(&buf[..ulen]).to_string();

            stream.read_exact(&mut buf[..1]).await?;
            let plen = buf[0] as usize;
            stream.read_exact(&mut buf[..plen]).await?;
            let password = String::from_utf8_lossy(&buf[..plen]).to_string();

            let success = username == *expected_user && password == *expected_pass;
            stream
                .write_all(&[0x01, if success { 0x00 } else { 0x01 }])
                .await?;

            if !success {
                return Err(ProxyError::AuthenticationFailed);
            }
        }
    }

    // Read request
    stream.read_exact(&mut buf[..4]).await?;

    if buf[0] != SOCKS_VERSION {
        return Err(ProxyError::InvalidSocksVersion(buf[0]));
    }

    let command = Command::try_from(buf[1])?;
    // buf[2] is reserved
    let addr_type = AddressType::try_from(buf[3])?;

    // Read address
    let address = match addr_type {
        AddressType::Ipv4 => {
            let mut ip = [0u8; 4];
            stream.read_exact(&mut ip).await?;
            let mut port_buf = [0u8; 2];
            stream.read_exact(&mut port_buf).await?;
            Address::Ipv4(ip, u16::from_be_bytes(port_buf))
        }
        AddressType::Domain => {
            stream.read_exact(&mut buf[..1]).await?;
            let len = buf[0] as usize;
            stream.read_exact(&mut buf[..len]).await?;
            let domain = String::from_utf8_lossy(&buf[..len]).to_string();
            let mut port_buf = [0u8; 2];
            stream.read_exact(&mut port_buf).await?;
            Address::Domain(domain, u16::from_be_bytes(port_buf))
        }
        AddressType::Ipv6 => {
            let mut ip = [0u8; 16];
            stream.read_exact(&mut ip).await?;
            let mut port_buf = [0u8; 2];
            stream.read_exact(&mut port_buf).await?;
            Address::Ipv6(ip, u16::from_be_bytes(port_buf))
        }
    };

    match command {
        Command::Connect => {}
        Command::Bind | Command::UdpAssociate => {
            let reply = make_reply(Reply::CommandNotSupported, &address);
            stream.write_all(&reply).await?;
            return Err(ProxyError::UnsupportedCommand(command as u8));
        }
    }

    debug!("SOCKS5 CONNECT to {} via tunnel", address);

    // Dial first; the reply carries the real outcome
    match dial(address.to_string()).await {
        Ok(conn) => {
            debug!("Tunnel stream {} opened to {}", conn.id(), address);
            let reply = make_reply(Reply::Succeeded, &address);
            stream.write_all(&reply).await?;
            relay::splice(conn, stream).await;
            Ok(())
        }
        Err(e) => {
            error!("Failed to open tunnel stream to {}: {}", address, e);
            let reply = make_reply(reply_for(&e), &address);
            stream.write_all(&reply).await?;
            Err(e.into())
        }
    }
}

fn make_reply(reply: Reply, addr: &Address) -> Vec<u8> {
    let mut buf = vec![SOCKS_VERSION, reply as u8, 0x00];

    match addr {
        Address::Ipv4(ip, port) => {
            buf.push(AddressType::Ipv4 as u8);
            buf.extend_from_slice(ip);
            buf.extend_from_slice(&port.to_be_bytes());
        }
        Address::Ipv6(ip, port) => {
            buf.push(AddressType::Ipv6 as u8);
            buf.extend_from_slice(ip);
            buf.extend_from_slice(&port.to_be_bytes());
        }
        Address::Domain(domain, port) => {
            buf.push(AddressType::Domain as u8);
            buf.push(domain.len() as u8);
            buf.extend_from_slice(domain.as_bytes());
            buf.extend_from_slice(&port.to_be_bytes());
        }
    }

    buf
}
