#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # natfwd
//!
//! NAT traversal forwarder. A server behind NAT keeps one outbound TCP
//! connection to the forwarder; clients connect to the forwarder naming that
//! server and get a byte stream multiplexed over the server's connection.
//!
//! ## Subcommands
//!
//! - `natfwd serve` (default) — run the forwarder
//! - `natfwd supervise` — run the forwarder under a restart-on-crash loop
//! - `natfwd probe` — ask a forwarder for this host's external address
//!
//! ## Architecture
//!
//! ```text
//! main.rs          — entry point, clap subcommands, graceful shutdown
//! supervisor.rs    — restart loop with backoff and signal forwarding
//! config.rs        — TOML + env-var configuration
//! error.rs         — error enums
//! frame.rs         — wire frames, read_frame / write_frame
//! rpc.rs           — control-plane request / response messages
//! flow.rs          — credit counter with Notify wakeup
//! forwarder/
//!   mod.rs         — Forwarder: accept loop, admission, drop_client / drop_server
//!   session.rs     — ServerSession, ClientSession
//!   tasks.rs       — read/write loops for server and client connections
//!   control.rs     — control-plane requests served by the forwarder
//!   stats.rs       — atomic counters and snapshots
//! natlayer/
//!   mod.rs         — NatLayer: waitforconn / openconn / stopcomm / behind_nat
//!   link.rs        — server link and virtual streams
//!   discovery.rs   — Discovery trait, StaticDiscovery
//! ```

use std::net::SocketAddr;
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use natfwd::config::Config;
use natfwd::{supervisor, Forwarder, NatLayer};

/// NAT traversal forwarder.
#[derive(Parser)]
#[command(name = "natfwd", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the forwarder (default when no subcommand given).
    Serve {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
    },
    /// Run as supervisor: starts the forwarder and restarts it on crash.
    Supervise {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
    },
    /// Report this host's external address as seen by a forwarder.
    Probe {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
        /// Forwarder to ask (default: first reachable configured forwarder).
        #[arg(long)]
        forwarder: Option<SocketAddr>,
        /// Also check whether clients could reach this server identity.
        #[arg(long)]
        server: Option<String>,
        /// Port to check together with `--server`.
        #[arg(long, default_value_t = 0)]
        port: u16,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match cli.command {
        None => run_server(None).await,
        Some(Commands::Serve { config }) => run_server(config.as_deref()).await,
        Some(Commands::Supervise { config }) => run_supervisor_mode(config.as_deref()).await,
        Some(Commands::Probe {
            config,
            forwarder,
            server,
            port,
        }) => run_probe(config.as_deref(), forwarder, server, port).await,
    }
}

/// Load config and install the tracing subscriber. `RUST_LOG` wins over the file.
fn init(config_path: Option<&str>) -> Option<Config> {
    let config = match Config::load(config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("natfwd: {e}");
            return None;
        }
    };
    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();
    Some(config)
}

async fn run_supervisor_mode(config_path: Option<&str>) -> ExitCode {
    let Some(config) = init(config_path) else {
        return ExitCode::from(2);
    };
    info!("natfwd supervisor starting");
    match supervisor::run_supervisor(config_path, &config.supervisor).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("Supervisor failed: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run_server(config_path: Option<&str>) -> ExitCode {
    let Some(config) = init(config_path) else {
        return ExitCode::from(2);
    };
    info!("natfwd v{} starting", env!("CARGO_PKG_VERSION"));
    info!("Forwarder identity: {}", config.forwarder.identity);

    let listener = match TcpListener::bind(&config.forwarder.listen).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind {}: {e}", config.forwarder.listen);
            return ExitCode::FAILURE;
        }
    };
    info!("Listening on {}", config.forwarder.listen);

    let forwarder = Forwarder::new(config.forwarder.clone());
    let shutdown = CancellationToken::new();

    // Periodic statistics line
    let stats_task = (config.forwarder.stats_interval_secs > 0).then(|| {
        let fwd = forwarder.clone();
        let period = Duration::from_secs(config.forwarder.stats_interval_secs);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                interval.tick().await;
                let s = fwd.snapshot().await;
                info!(
                    servers = s.servers,
                    clients = s.clients,
                    servers_admitted = s.servers_admitted,
                    clients_admitted = s.clients_admitted,
                    rejected = s.rejected,
                    bytes_to_server = s.bytes_to_server,
                    bytes_to_client = s.bytes_to_client,
                    "Forwarder stats"
                );
            }
        })
    });

    let serve_task = tokio::spawn({
        let fwd = forwarder.clone();
        let token = shutdown.clone();
        async move { fwd.serve(listener, token).await }
    });

    wait_for_shutdown_signal().await;

    info!("Shutting down...");
    shutdown.cancel();
    if let Err(e) = serve_task.await {
        warn!("Forwarder task ended abnormally: {e}");
    }
    if let Some(task) = stats_task {
        task.abort();
    }
    info!("Goodbye");
    ExitCode::SUCCESS
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => info!("Received SIGINT"),
                    _ = sigterm.recv() => info!("Received SIGTERM"),
                }
            }
            Err(e) => {
                warn!("Cannot register SIGTERM handler: {e}");
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

async fn run_probe(
    config_path: Option<&str>,
    forwarder: Option<SocketAddr>,
    server: Option<String>,
    port: u16,
) -> ExitCode {
    let Some(config) = init(config_path) else {
        return ExitCode::from(2);
    };
    let layer = NatLayer::with_static_discovery(config.natlayer);

    match layer.external_addr(forwarder).await {
        Ok(addr) => println!("external address: {}:{}", addr.ip, addr.port),
        Err(e) => {
            error!("External address query failed: {e}");
            return ExitCode::FAILURE;
        }
    }
    match layer.behind_nat(forwarder).await {
        Ok(behind) => println!("behind NAT: {behind}"),
        Err(e) => {
            error!("NAT check failed: {e}");
            return ExitCode::FAILURE;
        }
    }
    if let Some(server) = server {
        match layer.probe_server(&server, port, forwarder).await {
            Ok(status) => println!("{server}:{port}: {status}"),
            Err(e) => {
                error!("Server probe failed: {e}");
                return ExitCode::FAILURE;
            }
        }
    }
    ExitCode::SUCCESS
}
