#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # leasegw
//!
//! Provider gateway for leased workloads.
//!
//! Tenants reach their leases over mutual TLS. Both sides present
//! self-issued certificates whose CommonName is an account address; trust
//! comes from the certificate registry instead of a CA. Once connected, a
//! tenant can check lease status, submit manifests, open a shell in a
//! service replica and stream logs or events, the last three over WebSocket.
//!
//! ## Subcommands
//!
//! - `leasegw serve` (default): run the gateway
//!
//! ## Architecture
//!
//! ```text
//! main.rs         : entry point, clap subcommands, wiring, graceful shutdown
//! config.rs       : TOML + env-var configuration
//! registry.rs     : certificate registry (trait + TOML-file registry)
//! tls/            : trust verifier, rustls configs, accept loop
//! middleware.rs   : provider injection, owner check, lease/deployment lookup
//! routes/         : HTTP handlers and the router
//! ws/             : shell multiplexer and log/event streamer
//! protocol/       : frames, close codes, JSON payloads
//! cluster/        : backend traits; local/ runs leases on this host
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use leasegw::cluster::local::LocalCluster;
use leasegw::config::Config;
use leasegw::registry::MemoryRegistry;
use leasegw::tls::{server_config, TlsIdentity, TrustVerifier};
use leasegw::{routes, AppState, Gateway};

/// Provider gateway for leased workloads.
#[derive(Parser)]
#[command(name = "leasegw", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the gateway (default when no subcommand given).
    Serve {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let config_path = match cli.command {
        Some(Commands::Serve { config }) => config,
        None => None,
    };

    let config = match Config::load(config_path.as_deref()) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("leasegw: {e}");
            std::process::exit(1);
        }
    };

    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();

    if let Err(e) = run(config).await {
        error!("{e}");
        std::process::exit(1);
    }
}

async fn run(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    info!("leasegw v{} starting", env!("CARGO_PKG_VERSION"));
    let provider = config.provider_address()?;
    info!(%provider, listen = %config.server.listen, "provider identity");

    let registry = Arc::new(MemoryRegistry::load(&config.registry.path)?);
    let trust = Arc::new(TrustVerifier::new(
        registry,
        config.server.address_prefix.clone(),
    ));
    let identity = TlsIdentity::load(&config.tls.cert, &config.tls.key)?;
    let tls = server_config(
        identity,
        Arc::clone(&trust),
        config.tls.require_client_cert,
    )?;
    if !config.tls.require_client_cert {
        info!("client certificates optional: anonymous callers limited to public routes");
    }

    let backend = Arc::new(LocalCluster::from_config(
        provider.clone(),
        &config.local,
        &config.server.address_prefix,
    )?);
    info!(leases = config.local.leases.len(), "local backend ready");

    let shutdown = CancellationToken::new();
    let max_connections = config.server.max_connections;
    let handshake_timeout = Duration::from_secs(config.server.handshake_timeout_secs);
    let listen = config.server.listen.clone();
    let state = AppState::with_backend(Arc::new(config), provider, backend, shutdown.clone());
    let router = routes::router(state);

    let listener = TcpListener::bind(&listen).await?;
    let gateway = Gateway::new(tls, trust, router, max_connections, handshake_timeout);

    let signals = shutdown.clone();
    tokio::spawn(async move {
        wait_for_signal().await;
        signals.cancel();
    });

    gateway.serve(listener, shutdown).await?;
    info!("Goodbye");
    Ok(())
}

async fn wait_for_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => info!("Received SIGINT"),
                    _ = sigterm.recv() => info!("Received SIGTERM"),
                }
            }
            Err(e) => {
                error!(error = %e, "failed to register SIGTERM handler");
                ctrl_c.await.ok();
                info!("Received SIGINT");
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("Received SIGINT");
    }
}
