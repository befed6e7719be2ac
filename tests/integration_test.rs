//! Integration tests for muxlink
//!
//! Drives client and server sessions over in-memory links and real loopback
//! sockets, covering:
//! - the AUTH/RESULT handshake
//! - SYN/RESULT stream opens and data round trips
//! - windowed flow control under a deliberately tiny window
//! - stream-id collisions and at-most-once teardown at the frame level

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use muxlink::mux::{
    client_handshake, server_handshake, CredentialStore, Frame, MuxError, ReplyCode, Session,
    SessionConfig,
};
use muxlink::transport::{Dialer, TcpDialer};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::time::timeout;

/// TCP echo server on an ephemeral loopback port
async fn spawn_echo() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let (mut socket, _) = match listener.accept().await {
                Ok(pair) => pair,
                Err(_) => break,
            };
            tokio::spawn(async move {
                let mut buf = vec![0u8; 16 * 1024];
                loop {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if socket.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });
    addr
}

/// Handshake and spawn a client/server session pair over an in-memory link
async fn connected_pair(
    credentials: CredentialStore,
    username: &str,
    password: &str,
    config: SessionConfig,
) -> Result<(Session, Session), MuxError> {
    let (mut client_io, mut server_io) = tokio::io::duplex(256 * 1024);

    let client_hs = client_handshake(&mut client_io, username, password);
    let server_hs = server_handshake(&mut server_io, &credentials);
    let (client_res, server_res) = tokio::join!(client_hs, server_hs);
    client_res?;
    server_res?;

    let dialer: Arc<dyn Dialer> = Arc::new(TcpDialer::default());
    let (cr, cw) = tokio::io::split(client_io);
    let (sr, sw) = tokio::io::split(server_io);
    let client = Session::spawn(cr, cw, Arc::clone(&dialer), "server".into(), config.clone());
    let server = Session::spawn(sr, sw, dialer, "client".into(), config);
    Ok((client, server))
}

#[tokio::test]
async fn test_dial_and_echo_roundtrip() {
    let echo = spawn_echo().await;
    let (client, _server) = connected_pair(
        CredentialStore::open_access(),
        "alice",
        "sekrit",
        SessionConfig::default(),
    )
    .await
    .unwrap();

    let mut conn = client.dial(&echo.to_string()).await.unwrap();
    // The very first stream gets the first allocated id
    assert_eq!(conn.id(), 1);
    assert_eq!(conn.address(), echo.to_string());
    assert_eq!(client.conn_count(), 1);

    conn.write(b"hello muxlink").await.unwrap();
    let mut buf = [0u8; 64];
    let mut got = 0;
    while got < 13 {
        let n = conn.read(&mut buf[got..]).await;
        assert!(n > 0, "stream ended early");
        got += n;
    }
    assert_eq!(&buf[..13], b"hello muxlink");

    conn.close().await;
    // Teardown frees the id
    timeout(Duration::from_secs(1), async {
        while client.conn_count() != 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("stream never left the port table");
}

#[tokio::test]
async fn test_handshake_rejects_bad_credentials() {
    let mut users = HashMap::new();
    users.insert("alice".to_string(), "sekrit".to_string());

    let result = connected_pair(
        CredentialStore::new(users),
        "alice",
        "wrong",
        SessionConfig::default(),
    )
    .await;
    assert!(matches!(result, Err(MuxError::AuthFailed)));
}

#[tokio::test]
async fn test_unexpected_handshake_frame_is_rejected() {
    let (mut client_io, mut server_io) = tokio::io::duplex(64 * 1024);

    // A SYN where AUTH is required is a protocol violation
    let client = tokio::spawn(async move {
        client_io
            .write_all(
                &Frame::Syn {
                    stream_id: 1,
                    address: "example.com:80".into(),
                }
                .encode(),
            )
            .await
            .unwrap();
        client_io
    });

    let err = server_handshake(&mut server_io, &CredentialStore::open_access())
        .await
        .unwrap_err();
    assert!(matches!(err, MuxError::UnexpectedFrame("SYN")));
    client.await.unwrap();
}

#[tokio::test]
async fn test_flow_control_delivers_large_write_intact() {
    let echo = spawn_echo().await;
    // A window far smaller than the transfer forces several ACK cycles
    let config = SessionConfig {
        window_max: 8 * 1024,
        ..SessionConfig::default()
    };
    let (client, _server) = connected_pair(
        CredentialStore::open_access(),
        "alice",
        "sekrit",
        config,
    )
    .await
    .unwrap();

    let payload: Vec<u8> = (0..20000u32).map(|i| (i % 251) as u8).collect();
    let conn = client.dial(&echo.to_string()).await.unwrap();
    let (mut reader, writer) = conn.split();

    let outbound = payload.clone();
    let writer_task = tokio::spawn(async move {
        let sent = writer.write(&outbound).await.unwrap();
        assert_eq!(sent, outbound.len());
    });

    let mut received = Vec::with_capacity(payload.len());
    let mut buf = vec![0u8; 4096];
    while received.len() < payload.len() {
        let n = timeout(Duration::from_secs(10), reader.read(&mut buf))
            .await
            .expect("transfer stalled");
        assert!(n > 0, "stream ended early at {} bytes", received.len());
        received.extend_from_slice(&buf[..n]);
    }
    writer_task.await.unwrap();

    assert_eq!(received.len(), payload.len());
    assert_eq!(received, payload, "echoed bytes differ");
}

#[tokio::test]
async fn test_dial_to_dead_target_is_refused() {
    let (client, _server) = connected_pair(
        CredentialStore::open_access(),
        "alice",
        "sekrit",
        SessionConfig::default(),
    )
    .await
    .unwrap();

    // Nothing listens on this port; the server side reports CONN_FAILED
    let err = client.dial("127.0.0.1:1").await.unwrap_err();
    assert!(matches!(err, MuxError::DialRefused(ReplyCode::ConnFailed)));
    assert_eq!(client.conn_count(), 0);
}

#[tokio::test]
async fn test_session_teardown_closes_streams() {
    let echo = spawn_echo().await;
    let (client, server) = connected_pair(
        CredentialStore::open_access(),
        "alice",
        "sekrit",
        SessionConfig::default(),
    )
    .await
    .unwrap();

    let mut conn = client.dial(&echo.to_string()).await.unwrap();
    conn.write(b"ping").await.unwrap();

    server.close().await;

    // The client session notices the dead link and closes every stream
    let mut buf = [0u8; 64];
    timeout(Duration::from_secs(2), async {
        loop {
            if conn.read(&mut buf).await == 0 {
                break;
            }
        }
    })
    .await
    .expect("stream never saw end-of-stream");

    timeout(Duration::from_secs(2), client.wait_closed())
        .await
        .expect("client session never closed");
    assert!(matches!(
        conn.write(b"more").await,
        Err(MuxError::StreamClosed)
    ));
}

/// Drive the server at the raw frame level: handshake, then SYN twice with
/// the same stream id. The collision gets RESULT(ID_EXISTS) and the first
/// stream keeps working.
#[tokio::test]
async fn test_syn_collision_reports_id_exists() {
    let echo = spawn_echo().await;
    let (mut raw, mut server_io) = tokio::io::duplex(64 * 1024);

    let creds = CredentialStore::open_access();
    let server = tokio::spawn(async move {
        server_handshake(&mut server_io, &creds).await.unwrap();
        let dialer: Arc<dyn Dialer> = Arc::new(TcpDialer::default());
        let (sr, sw) = tokio::io::split(server_io);
        Session::spawn(sr, sw, dialer, "raw-client".into(), SessionConfig::default())
    });

    // Handshake by hand
    raw.write_all(
        &Frame::Auth {
            stream_id: 0,
            username: "u".into(),
            password: "p".into(),
        }
        .encode(),
    )
    .await
    .unwrap();
    assert_eq!(
        Frame::read_from(&mut raw).await.unwrap(),
        Frame::Result {
            stream_id: 0,
            code: ReplyCode::Ok
        }
    );
    let _server_session = server.await.unwrap();

    // First SYN on stream 7 opens fine
    raw.write_all(
        &Frame::Syn {
            stream_id: 7,
            address: echo.to_string(),
        }
        .encode(),
    )
    .await
    .unwrap();
    assert_eq!(
        Frame::read_from(&mut raw).await.unwrap(),
        Frame::Result {
            stream_id: 7,
            code: ReplyCode::Ok
        }
    );

    // Same id again: rejected, link survives
    raw.write_all(
        &Frame::Syn {
            stream_id: 7,
            address: echo.to_string(),
        }
        .encode(),
    )
    .await
    .unwrap();
    assert_eq!(
        Frame::read_from(&mut raw).await.unwrap(),
        Frame::Result {
            stream_id: 7,
            code: ReplyCode::IdExists
        }
    );

    // The original stream still echoes
    raw.write_all(
        &Frame::Data {
            stream_id: 7,
            payload: Bytes::from_static(b"still alive"),
        }
        .encode(),
    )
    .await
    .unwrap();
    loop {
        match Frame::read_from(&mut raw).await.unwrap() {
            Frame::Data { stream_id, payload } => {
                assert_eq!(stream_id, 7);
                assert_eq!(&payload[..], b"still alive");
                break;
            }
            // Flow-control chatter is fine, anything else is not
            Frame::Ack { stream_id: 7, .. } => continue,
            other => panic!("unexpected frame: {:?}", other),
        }
    }
}

/// A locally dialed stream closed N times concurrently sends exactly one FIN
#[tokio::test]
async fn test_concurrent_close_sends_one_fin() {
    let (client_io, mut raw) = tokio::io::duplex(64 * 1024);

    let dialer: Arc<dyn Dialer> = Arc::new(TcpDialer::default());
    let (cr, cw) = tokio::io::split(client_io);
    let client = Session::spawn(cr, cw, dialer, "raw-server".into(), SessionConfig::default());

    // Answer the SYN by hand
    let answer = tokio::spawn(async move {
        let frame = Frame::read_from(&mut raw).await.unwrap();
        let Frame::Syn { stream_id, .. } = frame else {
            panic!("expected SYN, got {:?}", frame);
        };
        raw.write_all(
            &Frame::Result {
                stream_id,
                code: ReplyCode::Ok,
            }
            .encode(),
        )
        .await
        .unwrap();
        raw
    });

    let conn = Arc::new(client.dial("example.com:80").await.unwrap());
    let mut raw = answer.await.unwrap();

    let mut closers = Vec::new();
    for _ in 0..8 {
        let conn = Arc::clone(&conn);
        closers.push(tokio::spawn(async move { conn.close().await }));
    }
    for closer in closers {
        closer.await.unwrap();
    }

    // Exactly one FIN arrives, then the line goes quiet
    assert_eq!(
        Frame::read_from(&mut raw).await.unwrap(),
        Frame::Fin { stream_id: 1 }
    );
    let quiet = timeout(Duration::from_millis(300), Frame::read_from(&mut raw)).await;
    assert!(quiet.is_err(), "expected silence after the single FIN");

    assert_eq!(client.conn_count(), 0);
}

#[tokio::test]
async fn test_dns_query_over_link() {
    let (client, _server) = connected_pair(
        CredentialStore::open_access(),
        "alice",
        "sekrit",
        SessionConfig::default(),
    )
    .await
    .unwrap();

    // localhost resolves everywhere; the reserved .invalid TLD never does
    let addrs = client.dns_query("localhost").await.unwrap();
    assert!(addrs.iter().any(|a| a.is_loopback()));

    let err = client.dns_query("name.invalid").await.unwrap_err();
    assert!(matches!(
        err,
        MuxError::DnsFailed(_) | MuxError::Timeout("dns")
    ));
}
