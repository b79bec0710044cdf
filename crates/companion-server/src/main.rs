//! Companion connection server: headless entry point.
//!
//! Loads the configuration, binds the socket transport, and drives
//! [`CompanionServer::tick`] on a fixed cadence until Ctrl-C.  Mic profiles
//! are written back to the config file on shutdown.
//!
//! # Usage
//!
//! ```text
//! companion-server [OPTIONS]
//!
//! Options:
//!   --port      <PORT>   Port for TCP connections and UDP discovery [config: 34567]
//!   --config    <PATH>   Config file [default: platform config dir]
//!   --log-level <LEVEL>  error | warn | info | debug | trace [config: info]
//! ```
//!
//! Each option can also be set through `COMPANION_PORT`, `COMPANION_CONFIG`,
//! and `COMPANION_LOG_LEVEL`.  `RUST_LOG` overrides the log level entirely.

use std::path::PathBuf;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use companion_server::application::collaborators::{
    Collaborators, ConfiguredPermissions, InMemoryMicProfileStore, StaticModifierCatalog,
};
use companion_server::application::event_bus::ConnectionEvent;
use companion_server::infrastructure::network::socket::SocketTransport;
use companion_server::infrastructure::server::CompanionServer;
use companion_server::infrastructure::storage::config::{self, AppConfig};

// ── CLI argument definitions ──────────────────────────────────────────────────

/// Companion connection server.
///
/// Answers LAN discovery probes and accepts companion apps on one port.
#[derive(Debug, Parser)]
#[command(
    name = "companion-server",
    about = "Discovery, handshake, and session registry for companion apps",
    version
)]
struct Cli {
    /// Port for TCP connections and UDP discovery.  Overrides the config file.
    #[arg(long, env = "COMPANION_PORT")]
    port: Option<u16>,

    /// Path to the TOML config file.
    #[arg(long, env = "COMPANION_CONFIG")]
    config: Option<PathBuf>,

    /// Log level used when `RUST_LOG` is not set.  Overrides the config file.
    #[arg(long, env = "COMPANION_LOG_LEVEL")]
    log_level: Option<String>,
}

impl Cli {
    fn config_path(&self) -> anyhow::Result<PathBuf> {
        match &self.config {
            Some(path) => Ok(path.clone()),
            None => config::config_file_path().context("no --config given"),
        }
    }
}

fn collaborators_from(cfg: &AppConfig) -> Collaborators {
    Collaborators {
        permissions: Box::new(ConfiguredPermissions::new(
            cfg.permissions.granted.iter().copied(),
        )),
        modifiers: Box::new(StaticModifierCatalog::new(cfg.modifiers.clone())),
        mic_profiles: Box::new(InMemoryMicProfileStore::new(cfg.mic_profiles.clone())),
        ..Collaborators::default()
    }
}

fn log_connection_event(event: &ConnectionEvent) {
    match event {
        ConnectionEvent::ConnectionChanged {
            session,
            is_connected: true,
        } => info!(
            "companion connected: {} ({}) from {}",
            session.client_name, session.client_id, session.remote_address
        ),
        ConnectionEvent::ConnectionChanged {
            session,
            is_connected: false,
        } => info!(
            "companion disconnected: {} ({})",
            session.client_name, session.client_id
        ),
        ConnectionEvent::MicProfileChanged { profile } => {
            info!("mic profile renamed to {:?}", profile.name)
        }
    }
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config_path = cli.config_path()?;
    let mut cfg = config::load_config_from(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    let log_level = cli
        .log_level
        .clone()
        .unwrap_or_else(|| cfg.server.log_level.clone());
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&log_level)),
        )
        .init();

    info!("companion server starting (config {})", config_path.display());

    let bind_ip = cfg
        .server
        .bind_ip()
        .with_context(|| format!("invalid bind_address {:?}", cfg.server.bind_address))?;
    let port = cli.port.unwrap_or(cfg.server.port);

    let mut server = CompanionServer::new(
        Box::new(SocketTransport::new(bind_ip)),
        collaborators_from(&cfg),
    );
    server.subscribe(log_connection_event);
    let bound = server
        .start(port)
        .with_context(|| format!("failed to start companion server on port {port}"))?;

    // ── Ctrl-C handler ────────────────────────────────────────────────────────
    let running = Arc::new(AtomicBool::new(true));
    let running_clone = Arc::clone(&running);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("shutdown signal received");
                running_clone.store(false, Ordering::Relaxed);
            }
            Err(e) => error!("failed to listen for Ctrl-C signal: {e}"),
        }
    });

    info!("companion server ready on port {bound}.  Press Ctrl-C to exit.");

    // ── Poll loop ─────────────────────────────────────────────────────────────
    let mut ticker = tokio::time::interval(Duration::from_millis(
        cfg.server.tick_interval_ms.max(1),
    ));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    while running.load(Ordering::Relaxed) {
        ticker.tick().await;
        server.tick();
    }

    server.stop();

    cfg.mic_profiles = server.mic_profiles();
    if let Err(e) = config::save_config_to(&cfg, &config_path) {
        warn!("failed to persist mic profiles: {e}");
    }

    info!("companion server stopped");
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────
