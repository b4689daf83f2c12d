//! Serial Bridge daemon
//!
//! Exposes local serial ports to browser-based tools. Clients connect over
//! WebSocket on the first free port of `[8990, 9000)`, plain and TLS, and
//! exchange commands and device data with the bridge.

use std::net::TcpListener as StdTcpListener;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::Router;
use axum_server::tls_rustls::RustlsConfig;
use axum_server::Handle;
use clap::Parser;
use semver::Version;
use serialbridge_core::api::ListenerPorts;
use serialbridge_core::{resolve_config_path, MemoryMode};
use serialbridge_hardware::{MockBackend, PortFilter, SerialBackend, TokioSerialBackend};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info, warn};

use serialbridged::binder::{bind_in_range, BindOutcome, ListenerKind, PortRange, TcpBinder};
use serialbridged::config::{ConfigOverrides, RuntimeConfig};
use serialbridged::discovery::{Announcement, DiscoveryLoop};
use serialbridged::hub::{Broadcaster, ClientHub, ReclaimPolicy, SerialHub, SerialHubSettings};
use serialbridged::logging::{init_tracing, log_channel, LOG_QUEUE};
use serialbridged::update::{HttpUpdateSource, UpdateState, Updater};
use serialbridged::{api, shutdown, AppState};

/// Serial Bridge
#[derive(Parser, Debug)]
#[command(name = "serialbridged")]
#[command(version, about = "Serial port bridge for browser-based tools", long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listener bind address
    #[arg(short, long)]
    bind: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Regular expression selecting serial ports to report
    #[arg(long)]
    regex: Option<String>,

    /// Buffer reclamation mode (default, aggressive, disabled)
    #[arg(long)]
    gc: Option<MemoryMode>,

    /// Hostname reported to clients instead of the OS hostname
    #[arg(long)]
    hostname: Option<String>,

    /// Base URL for self-update checks
    #[arg(long)]
    update_url: Option<String>,

    /// Application name used in update URLs
    #[arg(long)]
    app_name: Option<String>,

    /// Extra allowed origins, comma separated
    #[arg(long)]
    origins: Option<String>,

    /// Use in-memory loopback ports instead of hardware
    #[arg(long)]
    mock: bool,
}

impl Args {
    fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            bind: self.bind.clone(),
            regex: self.regex.clone(),
            memory: self.gc,
            hostname: self.hostname.clone(),
            update_url: self.update_url.clone(),
            app_name: self.app_name.clone(),
            origins: self.origins.clone(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Log lines reach clients through this channel once the hub is up
    let (log_sender, log_rx) = log_channel(LOG_QUEUE);
    init_tracing(args.verbose, log_sender.clone());

    info!("Serial Bridge {} starting...", env!("CARGO_PKG_VERSION"));

    // Determine config path: CLI flag > env var > default
    let config_path = resolve_config_path(args.config.clone());

    // Step 1: Load configuration
    let mut runtime_config = RuntimeConfig::load(&config_path).await?;
    runtime_config.apply(args.overrides());
    runtime_config.ensure_dirs().await?;
    let runtime_config = Arc::new(runtime_config);
    let static_config = runtime_config.static_config();

    info!("Configuration loaded successfully");
    info!("  Static config: {}", config_path.display());
    info!("  Data directory: {}", static_config.data_dir.display());
    info!("  Hostname: {}", runtime_config.hostname());

    // Step 2: Serial side
    let filter = PortFilter::new(&static_config.serial.filter)?;
    info!("Serial port filter: {}", filter.pattern());

    let backend: Arc<dyn SerialBackend> = if args.mock {
        info!("Mock mode: serving loopback ports");
        let mock = MockBackend::new();
        mock.add_loopback("/dev/ttyACM-mock0");
        mock.add_loopback("/dev/ttyUSB-mock1");
        Arc::new(mock)
    } else {
        Arc::new(TokioSerialBackend::default())
    };

    let policy = Arc::new(ReclaimPolicy::new(static_config.memory));
    policy.describe();

    let broadcaster = Arc::new(Broadcaster::new());
    let serial = Arc::new(SerialHub::new(
        backend,
        filter,
        broadcaster.clone(),
        policy,
        SerialHubSettings::from(&static_config.serial),
    ));
    log_serial_ports(&serial).await;

    let hub = Arc::new(ClientHub::new(broadcaster, serial, log_sender));
    tokio::spawn(hub.clone().run_log_forwarder(log_rx));

    let (stop_tx, stop_rx) = watch::channel(false);

    // Step 3: Updates
    let current = Version::parse(env!("CARGO_PKG_VERSION"))
        .context("crate version is not valid semver")?;
    let update_state = Arc::new(UpdateState::new(current));
    if runtime_config.updates_enabled() {
        let update = &static_config.update;
        match HttpUpdateSource::new(&update.url, &update.app_name) {
            Ok(source) => {
                let updater = Arc::new(Updater::new(
                    Arc::new(source),
                    update_state.clone(),
                    static_config.staging_dir(),
                    &update.app_name,
                ));
                let interval = Duration::from_secs(update.interval_secs);
                tokio::spawn(updater.run_scheduler(interval, stop_rx.clone()));
            }
            Err(e) => warn!("Self-update disabled: {}", e),
        }
    } else {
        info!("Self-update disabled (no update URL configured)");
    }

    // Step 4: Listeners
    let range = PortRange::from_config(&static_config.server)?;
    let binder = TcpBinder::from_config(&static_config.server)?;
    let tls_config = load_tls_config(&runtime_config).await;

    let plain = bind_in_range(&binder, range, ListenerKind::Plain);
    let tls = async {
        match tls_config {
            Some(cfg) => Some((bind_in_range(&binder, range, ListenerKind::Tls).await, cfg)),
            None => None,
        }
    };
    let (plain, tls) = tokio::join!(plain, tls);

    let ports = ListenerPorts {
        http: plain.port(),
        https: tls.as_ref().and_then(|(outcome, _)| outcome.port()),
    };
    if !ports.any() {
        error!(
            "No listener could bind in {}; clients cannot connect. Background tasks keep running.",
            range
        );
    }

    // Step 5: Discovery
    let discovery = DiscoveryLoop::new(
        static_config.discovery.clone(),
        Announcement {
            hostname: runtime_config.hostname(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            ports,
        },
    );
    let peers = static_config
        .discovery
        .enabled
        .then(|| discovery.peers());
    tokio::spawn(discovery.run(stop_rx.clone()));

    // Step 6: Serve
    let app_state = AppState::new(
        hub.clone(),
        runtime_config.clone(),
        update_state,
        peers,
        ports,
    );
    let app = api::create_router(app_state);
    let tls_handle = Handle::new();

    let mut servers = Vec::new();
    if let BindOutcome::Bound { listener, .. } = plain {
        servers.push(tokio::spawn(serve_plain(listener, app.clone(), stop_rx.clone())));
    }
    if let Some((BindOutcome::Bound { listener, .. }, cfg)) = tls {
        let listener = listener.into_std()?;
        servers.push(tokio::spawn(serve_tls(
            listener,
            cfg,
            app.clone(),
            tls_handle.clone(),
        )));
    }
    info!("Server ready!");

    shutdown::shutdown_signal().await;

    let _ = stop_tx.send(true);
    tls_handle.graceful_shutdown(Some(Duration::from_secs(5)));
    shutdown::drain(&hub).await;
    for server in servers {
        let _ = server.await;
    }

    info!("Server shutdown complete");
    Ok(())
}

async fn log_serial_ports(serial: &SerialHub) {
    let ports = match serial.enumerate().await {
        Ok(ports) => ports,
        Err(e) => {
            warn!("Could not enumerate serial ports: {}", e);
            return;
        }
    };
    if ports.is_empty() {
        info!("There are no serial ports to list");
        return;
    }
    for port in ports {
        info!(
            "  Serial port {}{}",
            port.name,
            if port.matches_filter { "" } else { " (filtered)" }
        );
    }
}

/// Find cert.pem/key.pem next to the executable, then in the data directory
async fn load_tls_config(config: &RuntimeConfig) -> Option<RustlsConfig> {
    let server = &config.static_config().server;
    let exe_dir = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf));

    let candidates = exe_dir
        .iter()
        .map(|dir| server.tls_paths(dir))
        .chain(std::iter::once(
            server.tls_paths(&config.static_config().data_dir),
        ));

    for (cert, key) in candidates {
        if !(cert.exists() && key.exists()) {
            continue;
        }
        return match RustlsConfig::from_pem_file(&cert, &key).await {
            Ok(cfg) => {
                info!("TLS certificate: {}", cert.display());
                Some(cfg)
            }
            Err(e) => {
                warn!("TLS disabled, failed to load {}: {}", cert.display(), e);
                None
            }
        };
    }

    info!("TLS disabled (no cert.pem/key.pem found)");
    None
}

async fn serve_plain(listener: TcpListener, app: Router, mut stop: watch::Receiver<bool>) {
    let result = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = stop.changed().await;
        })
        .await;
    if let Err(e) = result {
        error!("HTTP server failed: {}", e);
    }
}

async fn serve_tls(listener: StdTcpListener, config: RustlsConfig, app: Router, handle: Handle) {
    let result = axum_server::from_tcp_rustls(listener, config)
        .handle(handle)
        .serve(app.into_make_service())
        .await;
    if let Err(e) = result {
        error!("HTTPS server failed: {}", e);
    }
}
