//! Bidirectional byte pump
//!
//! Splices a virtual connection to a real TCP socket, copying each
//! direction in its own task until either side closes. Used on the server
//! to wire an accepted SYN to its freshly dialed target, and on the client
//! to wire a proxy client's socket to its virtual stream.

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::trace;

use crate::mux::Conn;

/// Copy buffer for each pump direction
const PUMP_BUF: usize = 16 * 1024;

/// Pump bytes both ways until both directions finish.
///
/// Returns `(into_conn, out_of_conn)` byte totals. The virtual connection
/// is closed when the socket side ends, and the socket's write half is shut
/// down when the virtual stream ends, so neither peer is left hanging.
pub async fn splice(conn: Conn, stream: TcpStream) -> (u64, u64) {
    let stream_id = conn.id();
    let (mut conn_read, conn_write) = conn.split();
    let (mut tcp_read, mut tcp_write) = stream.into_split();

    let inbound = tokio::spawn(async move {
        let mut buf = vec![0u8; PUMP_BUF];
        let mut total = 0u64;
        loop {
            match tcp_read.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if conn_write.write(&buf[..n]).await.is_err() {
                        break;
                    }
                    total += n as u64;
                }
            }
        }
        conn_write.close().await;
        total
    });

    let outbound = tokio::spawn(async move {
        let mut buf = vec![0u8; PUMP_BUF];
        let mut total = 0u64;
        loop {
            let n = conn_read.read(&mut buf).await;
            if n == 0 {
                break;
            }
            if tcp_write.write_all(&buf[..n]).await.is_err() {
                break;
            }
            total += n as u64;
        }
        let _ = tcp_write.shutdown().await;
        total
    });

    let into_conn = inbound.await.unwrap_or(0);
    let out_of_conn = outbound.await.unwrap_or(0);
    trace!(
        "Relay for stream {} done ({} in / {} out bytes)",
        stream_id,
        into_conn,
        out_of_conn
    );
    (into_conn, out_of_conn)
}
