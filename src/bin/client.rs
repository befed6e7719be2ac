//! Muxlink Client
//!
//! Runs local SOCKS5/HTTP CONNECT proxies and carries every accepted
//! request as a virtual stream over a pool of multiplexed sessions to one
//! or more muxlink servers.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use muxlink::{
    config::Config,
    mux::{PoolConfig, SessionFactory, SessionPool, TcpSessionFactory},
    proxy::{HttpProxyServer, Socks5Server},
    transport::{Dialer, TcpDialer},
};
use tracing::{debug, error, info};

/// Muxlink Client - multiplexed tunnel proxy
#[derive(Parser, Debug)]
#[command(name = "muxlink-client")]
#[command(about = "Muxlink client - local proxy over multiplexed sessions")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Server address (overrides config, single endpoint)
    #[arg(short, long)]
    server: Option<String>,

    /// Local SOCKS5 proxy address
    #[arg(long)]
    socks5: Option<String>,

    /// Local HTTP proxy address
    #[arg(long)]
    http: Option<String>,

    /// Write an example configuration file and exit
    #[arg(long)]
    generate_config: bool,

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

    if args.generate_config {
        let config = muxlink::config::generate_example_config();
        config.save(&args.config)?;
        info!("Wrote example configuration to {}", args.config);
        return Ok(());
    }

    // Load configuration
    let config = Config::load(&args.config).context("Failed to load configuration")?;

    let mut client_config = config
        .client
        .ok_or_else(|| anyhow!("No [client] section in config file"))?;

    if let Some(server) = args.server {
        client_config.servers = vec![muxlink::config::ServerEndpoint {
            address: server,
            username: String::new(),
            password: String::new(),
        }];
    }
    if client_config.servers.is_empty() {
        return Err(anyhow!("No servers configured"));
    }

    info!("Muxlink Client v{}", muxlink::VERSION);
    for endpoint in &client_config.servers {
        info!("Server: {}", endpoint.address);
    }

    // One factory per configured endpoint; the pool spreads sessions
    // round-robin across them
    let dialer: Arc<dyn Dialer> = Arc::new(TcpDialer::default());
    let factories: Vec<Arc<dyn SessionFactory>> = client_config
        .servers
        .iter()
        .map(|endpoint| {
            Arc::new(TcpSessionFactory::new(
                endpoint.address.clone(),
                endpoint.username.clone(),
                endpoint.password.clone(),
                Arc::clone(&dialer),
            )) as Arc<dyn SessionFactory>
        })
        .collect();

    let pool = SessionPool::new(
        factories,
        PoolConfig {
            min_sessions: client_config.min_sessions,
            max_conns_per_session: client_config.max_conns_per_session,
        },
    );

    // Periodic pool status for diagnostics
    {
        let pool = pool.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_secs(30)).await;
                for status in pool.status() {
                    debug!(
                        "Session {}: {} conns, {} B/s in, {} B/s out",
                        status.peer, status.conns, status.read_rate, status.write_rate
                    );
                }
            }
        });
    }

    let socks5_addr = args.socks5.or(client_config.socks5_listen);
    let http_addr = args.http.or(client_config.http_listen);
    if socks5_addr.is_none() && http_addr.is_none() {
        return Err(anyhow!("Neither SOCKS5 nor HTTP listener configured"));
    }

    // Start SOCKS5 proxy if configured
    if let Some(addr) = socks5_addr {
        let server = Socks5Server::bind(&addr)
            .await
            .context("Failed to bind SOCKS5 listener")?;
        let pool = pool.clone();
        tokio::spawn(async move {
            let dial = move |address: String| {
                let pool = pool.clone();
                async move { pool.dial(&address).await }
            };
            if let Err(e) = server.run(dial).await {
                error!("SOCKS5 proxy error: {}", e);
            }
        });
    }

    // Start HTTP proxy if configured
    if let Some(addr) = http_addr {
        let server = HttpProxyServer::bind(&addr)
            .await
            .context("Failed to bind HTTP listener")?;
        let pool = pool.clone();
        tokio::spawn(async move {
            let dial = move |address: String| {
                let pool = pool.clone();
                async move { pool.dial(&address).await }
            };
            if let Err(e) = server.run(dial).await {
                error!("HTTP proxy error: {}", e);
            }
        });
    }

    // Run until interrupted
    tokio::signal::ctrl_c().await?;
    info!("Shutting down, cutting all sessions...");
    pool.cut_all().await;

    Ok(())
}
