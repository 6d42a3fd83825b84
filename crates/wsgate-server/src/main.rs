//! wsgate-server: WebSocket to TCP gateway.
//!
//! Accepts WebSocket upgrades on `/proxy/{destination}`, optionally checks a
//! bearer token, resolves the destination through a static map and pipes
//! binary frames to and from the mapped TCP endpoint.

mod config;
mod drain;
mod server;
mod transport;
mod tunnel;

use clap::Parser;
use config::{CliOverrides, ServerConfig};
use server::AppState;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tunnel::TunnelSettings;
use wsgate_core::{Mapping, TokenVerifier};

/// wsgate-server: WebSocket to TCP gateway
#[derive(Parser, Debug)]
#[command(name = "wsgate-server", version, about = "WebSocket to TCP gateway")]
struct Cli {
    /// Listen address (host:port)
    #[arg(long)]
    listen: Option<String>,

    /// Config file path
    #[arg(long, default_value = "~/.wsgate/config.toml")]
    config: String,

    /// Destination map file (`name,address` per line)
    #[arg(long)]
    map: Option<String>,

    /// RSA public key (PEM) for bearer tokens; authentication is off without it
    #[arg(long)]
    public_key: Option<String>,

    /// Maximum token age in seconds, measured from `iat`
    #[arg(long)]
    freshness: Option<u64>,

    /// Upstream connect timeout in seconds
    #[arg(long)]
    dial_timeout: Option<u64>,

    /// WebSocket handshake timeout in seconds
    #[arg(long)]
    handshake_timeout: Option<u64>,

    /// Timeout for a single write to the client, in seconds
    #[arg(long)]
    write_timeout: Option<u64>,

    /// How long to wait for sessions to finish on shutdown, in seconds
    #[arg(long)]
    shutdown_timeout: Option<u64>,

    /// Traffic capture: 0 off, 1 client to upstream, 2 both directions
    #[arg(long)]
    dump_tcp: Option<u8>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Cli {
    fn overrides(&self) -> CliOverrides {
        CliOverrides {
            listen: self.listen.clone(),
            map: self.map.clone(),
            public_key: self.public_key.clone(),
            freshness: self.freshness,
            dial_timeout: self.dial_timeout,
            handshake_timeout: self.handshake_timeout,
            write_timeout: self.write_timeout,
            shutdown_timeout: self.shutdown_timeout,
            dump_tcp: self.dump_tcp,
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing
    use tracing_subscriber::EnvFilter;
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "starting wsgate-server");

    let config_path = PathBuf::from(&cli.config);
    let config = match ServerConfig::load(Some(&config_path), cli.overrides()) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    let mapping = match Mapping::load(config.map_path.as_deref()) {
        Ok(m) => m,
        Err(e) => {
            error!(error = %e, "failed to load destination map");
            std::process::exit(1);
        }
    };
    if mapping.is_empty() {
        warn!("destination map is empty, every tunnel request will be refused");
    }

    let verifier = match TokenVerifier::load(config.public_key_path.as_deref(), config.freshness) {
        Ok(v) => v,
        Err(e) => {
            error!(error = %e, "failed to load public key");
            std::process::exit(1);
        }
    };
    if !verifier.enabled() {
        info!("no public key configured, token authentication disabled");
    }

    let listener = match TcpListener::bind(config.listen).await {
        Ok(l) => l,
        Err(e) => {
            error!(addr = %config.listen, error = %e, "failed to bind");
            std::process::exit(1);
        }
    };

    let state = Arc::new(AppState::new(mapping, verifier, TunnelSettings::from_config(&config)));
    match server::serve(listener, state, config.shutdown_timeout, shutdown_signal()).await {
        Ok(_) => info!("wsgate-server stopped"),
        Err(e) => {
            error!(error = %e, "server error");
            std::process::exit(1);
        }
    }
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                ctrl_c.await.ok();
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }

    info!("received shutdown signal");
}
