//! DNS queries carried over the link
//!
//! A client can ask the remote endpoint to resolve a hostname instead of
//! resolving locally (useful when local DNS is unreliable or observed). The
//! exchange rides on DNS frames: the query names a host, the response lists
//! addresses. An empty response means resolution failed.
//!
//! Query payload:    `nlen:u16 | name`
//! Response payload: `count:u8` then per address `family:u8 (4|6) | octets`

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::net::lookup_host;

use super::MuxError;

const FAMILY_V4: u8 = 4;
const FAMILY_V6: u8 = 6;

pub(crate) fn encode_query(name: &str) -> Bytes {
    let mut buf = BytesMut::with_capacity(2 + name.len());
    buf.put_u16(name.len() as u16);
    buf.extend_from_slice(name.as_bytes());
    buf.freeze()
}

pub(crate) fn decode_query(payload: &[u8]) -> Result<String, MuxError> {
    let mut buf = payload;
    if buf.remaining() < 2 {
        return Err(MuxError::MalformedPayload("DNS query"));
    }
    let len = buf.get_u16() as usize;
    if buf.remaining() != len {
        return Err(MuxError::MalformedPayload("DNS query"));
    }
    String::from_utf8(buf.to_vec()).map_err(|_| MuxError::MalformedPayload("DNS query"))
}

pub(crate) fn encode_response(addrs: &[IpAddr]) -> Bytes {
    let mut buf = BytesMut::new();
    let count = addrs.len().min(255);
    buf.put_u8(count as u8);
    for addr in &addrs[..count] {
        match addr {
            IpAddr::V4(v4) => {
                buf.put_u8(FAMILY_V4);
                buf.extend_from_slice(&v4.octets());
            }
            IpAddr::V6(v6) => {
                buf.put_u8(FAMILY_V6);
                buf.extend_from_slice(&v6.octets());
            }
        }
    }
    buf.freeze()
}

pub(crate) fn decode_response(payload: &[u8]) -> Result<Vec<IpAddr>, MuxError> {
    let mut buf = payload;
    if buf.remaining() < 1 {
        return Err(MuxError::MalformedPayload("DNS response"));
    }
    let count = buf.get_u8() as usize;
    let mut addrs = Vec::with_capacity(count);
    for _ in 0..count {
        if buf.remaining() < 1 {
            return Err(MuxError::MalformedPayload("DNS response"));
        }
        match buf.get_u8() {
            FAMILY_V4 => {
                if buf.remaining() < 4 {
                    return Err(MuxError::MalformedPayload("DNS response"));
                }
                let mut octets = [0u8; 4];
                buf.copy_to_slice(&mut octets);
                addrs.push(IpAddr::V4(Ipv4Addr::from(octets)));
            }
            FAMILY_V6 => {
                if buf.remaining() < 16 {
                    return Err(MuxError::MalformedPayload("DNS response"));
                }
                let mut octets = [0u8; 16];
                buf.copy_to_slice(&mut octets);
                addrs.push(IpAddr::V6(Ipv6Addr::from(octets)));
            }
            _ => return Err(MuxError::MalformedPayload("DNS response")),
        }
    }
    if buf.has_remaining() {
        return Err(MuxError::MalformedPayload("DNS response"));
    }
    Ok(addrs)
}

/// Resolve a bare hostname with the system resolver
pub(crate) async fn resolve(name: &str) -> Vec<IpAddr> {
    match lookup_host((name, 0u16)).await {
        Ok(addrs) => addrs.map(|sock| sock.ip()).collect(),
        Err(_) => Vec::new(),
    }
}
