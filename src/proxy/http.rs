//! HTTP CONNECT proxy front end

use std::future::Future;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info};

use super::{relay, ProxyError};
use crate::mux::{Conn, MuxError};

/// HTTP CONNECT proxy server
pub struct HttpProxyServer {
    listener: TcpListener,
    /// Optional basic authentication (username:password)
    auth: Option<(String, String)>,
}

impl HttpProxyServer {
    /// Create a new HTTP proxy server
    pub async fn bind(addr: &str) -> Result<Self, ProxyError> {
        let listener = TcpListener::bind(addr).await?;
        info!("HTTP proxy server listening on {}", addr);

        Ok(Self {
            listener,
            auth: None,
        })
    }

    /// Enable basic authentication
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
            debug!("New HTTP proxy connection from {}", peer_addr);

            let dial = dial.clone();
            let auth = Arc::clone(&auth);

            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, auth, dial).await {
                    debug!("HTTP proxy connection error: {}", e);
                }
            });
        }
    }
}

async fn handle_connection<F, Fut>(
    stream: TcpStream,
    auth: Arc<Option<(String, String)>>,
    dial: F,
) -> Result<(), ProxyError>
where
    F: Fn(String) -> Fut,
    Fut: Future<Output = Result<Conn, MuxError>>,
{
    let mut reader = BufReader::new(stream);

    // Read the request line
    let mut request_line = String::new();
    reader.read_line(&mut request_line).await?;

    let parts: Vec<&str> = request_line.trim().split_whitespace().collect();
    if parts.len() < 3 {
        return Err(ProxyError::GeneralFailure("Invalid request line".to_string()));
    }

    let method = parts[0];
    let target = parts[1];

    // Read headers
    let mut headers = std::collections::HashMap::new();
    loop {
        let mut line = String::new();
        reader.read_line(&mut line).await?;
        let line = line.trim();

        if line.is_empty() {
            break;
        }

        if let Some((key, value)) = line.split_once(':') {
            headers.insert(key.trim().to_lowercase(), value.trim().to_string());
        }
    }

    // Check authentication if required
    if let Some((expected_user, expected_pass)) = auth.as_ref() {
        let authenticated = headers
            .get("proxy-authorization")
            .and_then(|value| value.strip_prefix("Basic "))
            .and_then(|encoded| {
                base64::Engine::decode(&base64::engine::general_purpose::STANDARD, encoded).ok()
            })
            .and_then(|decoded| String::from_utf8(decoded).ok())
            .and_then(|credentials| {
                credentials
                    .split_once(':')
                    .map(|(user, pass)| user == expected_user && pass == expected_pass)
            })
            .unwrap_or(false);

        if !authenticated {
            let mut stream = reader.into_inner();
            stream
                .write_all(
                    b"HTTP/1.1 407 Proxy Authentication Required\r\n\
                      Proxy-Authenticate: Basic realm=\"muxlink\"\r\n\r\n",
                )
                .await?;
            return Err(ProxyError::AuthenticationFailed);
        }
    }

    // Only support CONNECT
    if method != "CONNECT" {
        let mut stream = reader.into_inner();
        stream
            .write_all(b"HTTP/1.1 405 Method Not Allowed\r\n\r\n")
            .await?;
        return Err(ProxyError::GeneralFailure(format!(
            "Unsupported method: {}",
            method
        )));
    }

    // Target format is host:port
    if !target.contains(':') {
        let mut stream = reader.into_inner();
        stream.write_all(b"HTTP/1.1 400 Bad Request\r\n\r\n").await?;
        return Err(ProxyError::InvalidAddress(target.to_string()));
    }

    debug!("HTTP CONNECT to {} via tunnel", target);

    let mut stream = reader.into_inner();
    match dial(target.to_string()).await {
        Ok(conn) => {
            debug!("Tunnel stream {} opened to {}", conn.id(), target);
            stream
                .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
                .await?;
            relay::splice(conn, stream).await;
            Ok(())
        }
        Err(e) => {
            error!("Failed to open tunnel stream to {}: {}", target, e);
            stream.write_all(b"HTTP/1.1 502 Bad Gateway\r\n\r\n").await?;
            Err(e.into())
        }
    }
}
