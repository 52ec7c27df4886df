//! mifictl — control-plane daemon for 5G MiFi appliances.
//!
//! Exposes the device's radio, SIM, data-bearer, SMS, USB-gadget,
//! IPv6-forwarding and reverse-tunnel subsystems through one local HTTP API
//! and keeps them healthy with background supervisors.
//!
//! ```text
//! main.rs         — entry point, clap, router setup, graceful shutdown
//! config.rs       — TOML + env-var configuration
//! state.rs        — AppState wiring
//! store.rs        — SQLite pool and schema
//! bus.rs          — system message bus adapter
//! modem.rs        — AT bridge, mode/slot/signal, cell-table parser
//! apn.rs          — APN templates and context apply
//! bearer.rs       — data watchdog + signal-driven monitor
//! sms/            — intake, outbox, webhook forwarder, maintenance
//! ipv6fwd/        — rule workers, relay engine, firewall, reporter
//! rathole.rs      — tunnel client supervision and config generation
//! usbmode.rs      — configfs gadget composition
//! auth.rs         — token auth; security.rs — recovery questions
//! routes/         — one module per endpoint family
//! ```

use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tracing::{info, warn};

use mifictl::{routes, AppState, Config};

/// Control-plane daemon for 5G MiFi appliances.
#[derive(Parser)]
#[command(name = "mifictl", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP server (default when no subcommand given).
    Serve {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let config_path = match cli.command {
        Some(Commands::Serve { config }) => config,
        None => None,
    };
    run_server(config_path.as_deref()).await;
}

async fn run_server(config_path: Option<&str>) {
    let config = Config::load(config_path);

    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();

    info!("mifictl v{} starting", env!("CARGO_PKG_VERSION"));
    info!("Device serial: {}", config.device.serial);
    info!("Listening on {}", config.server.listen);

    let state = AppState::build(config)
        .await
        .expect("Failed to open database");

    // The cellular daemon is usually up before us; a failure here is only
    // logged — every bus path reconnects on demand.
    if let Err(e) = state.bus.connection().await {
        warn!(error = %e, "system bus not reachable yet");
    }

    let mut background = Vec::new();

    // SMS: intake + maintenance + daemon watch, and the boot-time CNMI fix.
    state.sms.apply_fix_if_enabled().await;
    background.push(state.sms.spawn_intake());
    background.push(state.sms.spawn_maintenance());
    background.push(state.sms.spawn_name_watch());

    // Bearer: monitor + watchdog.
    state.bearer.start_monitor().await;
    background.push(
        state
            .bearer
            .spawn_watchdog(state.config.bearer.watchdog_interval_secs),
    );

    // IPv6 forwarder: boot autostart and the periodic reporter.
    match state.ipv6.config().await {
        Ok(ipv6_config) if ipv6_config.enabled && ipv6_config.auto_start => {
            match state.ipv6.start().await {
                Ok(count) => info!(count, "IPv6 forwarder autostarted"),
                Err(e) => warn!(error = %e, "IPv6 forwarder autostart failed"),
            }
        }
        Ok(_) => {}
        Err(e) => warn!(error = %e, "IPv6 forwarder config unreadable"),
    }
    state.ipv6.start_reporter().await;

    // Rathole: boot autostart.
    match state.rathole.config().await {
        Ok(tunnel_config) if tunnel_config.enabled && tunnel_config.auto_start => {
            match state.rathole.start().await {
                Ok(pid) => info!(pid, "tunnel client autostarted"),
                Err(e) => warn!(error = %e, "tunnel client autostart failed"),
            }
        }
        Ok(_) => {}
        Err(e) => warn!(error = %e, "tunnel config unreadable"),
    }

    let app = routes::build_router(state.clone());

    let listener = TcpListener::bind(&state.config.server.listen)
        .await
        .expect("Failed to bind");

    info!("Server ready");

    let shutdown = async {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("Failed to register SIGTERM");
            tokio::select! {
                _ = ctrl_c => info!("Received SIGINT"),
                _ = sigterm.recv() => info!("Received SIGTERM"),
            }
        }
        #[cfg(not(unix))]
        {
            ctrl_c.await.ok();
            info!("Received SIGINT");
        }
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .expect("Server error");

    info!("Shutting down...");
    for task in background {
        task.abort();
    }
    state.bearer.stop_monitor().await;
    if let Err(e) = state.ipv6.stop().await {
        warn!(error = %e, "IPv6 forwarder stop failed");
    }
    info!("Goodbye");
}
