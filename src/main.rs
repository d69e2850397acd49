//! FastCGI gateway binary.
//!
//! # Architecture Overview
//!
//! ```text
//!                    ┌────────────────────────────────────────────────┐
//!                    │                 FCGI GATEWAY                   │
//!   Client Request   │  ┌─────────┐   ┌─────────┐   ┌─────────────┐   │
//!   ─────────────────┼─▶│  http   │──▶│ bridge  │──▶│   session   │   │
//!                    │  │ server  │   │         │   │   handler   │   │
//!                    │  └─────────┘   └────┬────┘   └──────┬──────┘   │
//!                    │                     │               │          │
//!                    │                     ▼               ▼          │
//!                    │              ┌────────────┐  ┌────────────┐    │
//!                    │              │   client   │  │  fastcgi   │    │
//!                    │              │  factory   │  │   codec    │    │
//!                    │              └─────┬──────┘  └────────────┘    │
//!   Client Response  │                    │                           │
//!   ◀────────────────┼── CGI response ◀── connection ◀───────────────┼──── FastCGI
//!                    │                                                │     Application
//!                    └────────────────────────────────────────────────┘
//! ```

use std::path::PathBuf;

use clap::Parser;
use tokio::net::TcpListener;

use fcgi_gateway::config::{load_config, validate_config, ConfigError, GatewayConfig};
use fcgi_gateway::http::GatewayServer;
use fcgi_gateway::lifecycle::{signals, startup, Shutdown};
use fcgi_gateway::observability::{logging, metrics};

/// HTTP to FastCGI gateway.
#[derive(Debug, Parser)]
#[command(name = "fcgi-gateway", version, about)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Backend address, overriding the configuration
    /// ("host:port", "tcp://host:port" or "unix:/path").
    #[arg(short, long)]
    backend: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => load_config(path)?,
        None => GatewayConfig::default(),
    };
    if let Some(backend) = cli.backend {
        config.backend.address = backend;
        validate_config(&config).map_err(ConfigError::Validation)?;
    }

    logging::init(&config.observability.log_level);

    tracing::info!("fcgi-gateway v{} starting", env!("CARGO_PKG_VERSION"));
    tracing::info!(
        bind_address = %config.listener.bind_address,
        backend = %config.backend.address,
        max_connections = config.listener.max_connections,
        request_timeout_secs = config.timeouts.request_secs,
        "Configuration loaded"
    );

    if config.observability.metrics_enabled {
        if let Ok(addr) = config.observability.metrics_address.parse() {
            metrics::init_metrics(addr);
        } else {
            tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            );
        }
    }

    let bridge = GatewayServer::default_bridge(&config)?;

    if config.startup.wait_for_backend {
        startup::wait_for_backend(bridge.factory(), &config.startup).await?;
    }

    let listener = TcpListener::bind(&config.listener.bind_address).await?;
    tracing::info!(address = %listener.local_addr()?, "Listening for connections");

    let shutdown = Shutdown::new();
    signals::spawn_signal_listener(shutdown.clone());

    let server = GatewayServer::new(config, bridge);
    server.run(listener, shutdown.wait()).await?;

    tracing::info!("Shutdown complete");
    Ok(())
}
