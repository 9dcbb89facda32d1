use devgate::apps::AppPool;
use devgate::config::Config;
use devgate::server::{HttpServer, CONTROL_HOST};
use devgate::transport::Transport;
use devgate::{PKG_NAME, VERSION};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("devgate=debug".parse()?),
        )
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("devgate.toml"));

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    info!(path = %config_path.display(), "Configuration loaded");
    print_startup_banner(&config);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let pool = AppPool::with_apps(config.pool.clone(), &config.apps);
    let transport = Arc::new(Transport::new(config.transport.clone())?);

    let bind_addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port)
        .parse()
        .map_err(|e| {
            error!(bind = %config.server.bind, port = config.server.port, error = %e, "Invalid bind address");
            anyhow::anyhow!("Invalid bind address: {}", e)
        })?;

    let server = HttpServer::new(
        bind_addr,
        Arc::clone(&pool),
        transport,
        config.server.debug,
        shutdown_rx,
    );

    let server_handle = tokio::spawn(async move {
        if let Err(e) = server.run().await {
            error!(error = %e, "HTTP server error");
        }
    });

    // Wait for shutdown signal (Ctrl+C or SIGTERM) or app reload (SIGHUP)
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sighup = signal(SignalKind::hangup())?;

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Received SIGINT (Ctrl+C), shutting down...");
                    break;
                }
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, shutting down...");
                    break;
                }
                _ = sighup.recv() => {
                    info!(path = %config_path.display(), "Received SIGHUP, reloading apps...");
                    reload_apps(&pool, &config_path);
                }
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C, shutting down...");
    }

    let _ = shutdown_tx.send(true);

    for name in pool.names() {
        pool.close(&name);
    }

    let _ = tokio::time::timeout(Duration::from_secs(5), server_handle).await;

    info!("Shutdown complete");
    Ok(())
}

/// Re-read the config file and apply its `[apps]` table to the pool.
/// Listener and transport settings only take effect on restart.
fn reload_apps(pool: &AppPool, config_path: &Path) {
    match Config::load(config_path) {
        Ok(config) => {
            let result = pool.apply_config(&config.apps);
            info!(
                added = result.added.len(),
                removed = result.removed.len(),
                updated = result.updated.len(),
                "Apps reloaded successfully"
            );
            if !result.added.is_empty() {
                info!(apps = ?result.added, "New apps available");
            }
            if !result.removed.is_empty() {
                info!(apps = ?result.removed, "Apps removed");
            }
        }
        Err(e) => {
            error!(error = %e, "Failed to reload configuration");
        }
    }
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting development router");
    info!(
        bind = %config.server.bind,
        port = config.server.port,
        debug = config.server.debug,
        control_host = CONTROL_HOST,
        "Server configuration"
    );
    info!(
        connect_timeout_ms = config.transport.connect_timeout_ms,
        tls_handshake_timeout_ms = config.transport.tls_handshake_timeout_ms,
        flush_interval_ms = config.transport.flush_interval_ms,
        max_idle_per_host = config.transport.max_idle_per_host,
        idle_timeout_secs = config.transport.idle_timeout_secs,
        "Transport settings"
    );
    info!(
        boot_timeout_secs = config.pool.boot_timeout_secs,
        probe_interval_ms = config.pool.probe_interval_ms,
        "Pool settings"
    );

    let mut names: Vec<_> = config.apps.keys().collect();
    names.sort();
    for name in names {
        let app = &config.apps[name];
        info!(app = %name, scheme = %app.scheme, address = %app.address, "App configured");
    }
}
