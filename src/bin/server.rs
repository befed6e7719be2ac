//! Muxlink Server
//!
//! Accepts long-lived client sessions, authenticates them, and resolves
//! each multiplexed SYN into a real outbound connection to the requested
//! target.

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use muxlink::{
    config::Config,
    mux::{server_handshake, CredentialStore, Session, SessionConfig},
    transport::{Dialer, TcpDialer},
};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

/// Muxlink Server - multiplexed tunnel endpoint
#[derive(Parser, Debug)]
#[command(name = "muxlink-server")]
#[command(about = "Muxlink server - terminates multiplexed tunnel sessions")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Listen address (overrides config)
    #[arg(short, long)]
    listen: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'v', long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(&args.log_level)
        .init();

    // Load configuration
    let config = Config::load(&args.config).context("Failed to load configuration")?;

    let server_config = config
        .server
        .ok_or_else(|| anyhow!("No [server] section in config file"))?;

    let credentials = if server_config.users.is_empty() {
        warn!("No users configured - accepting any credentials");
        CredentialStore::open_access()
    } else {
        info!("Loaded {} user(s)", server_config.users.len());
        CredentialStore::new(server_config.users)
    };
    let credentials = Arc::new(credentials);

    let listen_addr = args.listen.unwrap_or(server_config.listen);

    info!("Muxlink Server v{}", muxlink::VERSION);
    info!("Listening on {}", listen_addr);

    let listener = TcpListener::bind(&listen_addr)
        .await
        .context("Failed to bind to address")?;

    let dialer: Arc<dyn Dialer> = Arc::new(TcpDialer::default());
    let session_limit = Arc::new(Semaphore::new(server_config.max_sessions));

    loop {
        tokio::select! {
            accept_result = listener.accept() => {
                match accept_result {
                    Ok((stream, peer_addr)) => {
                        debug!("New connection from {}", peer_addr);

                        let credentials = Arc::clone(&credentials);
                        let dialer = Arc::clone(&dialer);
                        let session_limit = Arc::clone(&session_limit);
                        tokio::spawn(async move {
                            let Ok(permit) = session_limit.acquire_owned().await else {
                                return;
                            };
                            if let Err(e) =
                                handle_session(stream, peer_addr.to_string(), credentials, dialer)
                                    .await
                            {
                                debug!("Session from {} ended: {}", peer_addr, e);
                            }
                            drop(permit);
                        });
                    }
                    Err(e) => {
                        error!("Accept error: {}", e);
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down...");
                break;
            }
        }
    }

    Ok(())
}

/// Authenticate one client link, run its session until it dies
async fn handle_session(
    stream: TcpStream,
    peer: String,
    credentials: Arc<CredentialStore>,
    dialer: Arc<dyn Dialer>,
) -> Result<()> {
    stream.set_nodelay(true)?;

    let mut stream = stream;
    let username = server_handshake(&mut stream, &credentials)
        .await
        .context("Handshake failed")?;
    info!("Client {} authenticated as {:?}", peer, username);

    let (reader, writer) = stream.into_split();
    let session = Session::spawn(reader, writer, dialer, peer, SessionConfig::default());
    session.wait_closed().await;

    Ok(())
}
