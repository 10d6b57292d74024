use fcgi_gateway::config::Config;
use fcgi_gateway::gateway::{Gateway, GatewayServer};
use fcgi_gateway::{PKG_NAME, VERSION};
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("fcgi_gateway=debug".parse().expect("valid log directive")),
        )
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("fcgi-gateway.toml"));

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    info!(path = %config_path.display(), "Configuration loaded");
    print_startup_banner(&config);

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let listen = config.server.listen.clone();
    let gateway = Gateway::new(config);
    let background = gateway.start_background(shutdown_rx.clone());

    let server = GatewayServer::bind(&listen, gateway.clone(), shutdown_rx.clone()).await?;
    let server_handle = tokio::spawn(async move {
        if let Err(e) = server.run().await {
            error!(error = %e, "Gateway server error");
        }
    });

    // Wait for shutdown signal (Ctrl+C or SIGTERM)
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C, shutting down...");
    }

    // Signal shutdown
    let _ = shutdown_tx.send(true);

    // Stop all workers
    info!("Stopping all workers...");
    let stopped = gateway.shutdown().await;
    info!(stopped, "Workers stopped");

    // Wait for the listener and background tasks (with timeout)
    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        background.stop().await;
        let _ = server_handle.await;
    })
    .await;

    info!("Shutdown complete");
    Ok(())
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting FastCGI gateway");
    info!(
        listen = %config.server.listen,
        static_root = ?config.server.static_root,
        "Server configuration"
    );
    info!(
        root = %config.workers.root.display(),
        suffix = %config.workers.suffix,
        mode = if config.workers.socket_mode() { "socket" } else { "stdin" },
        socket_dir = ?config.workers.socket_dir,
        "Worker settings"
    );
    info!(
        idle_timeout_secs = config.workers.idle_timeout_secs,
        reap_interval_secs = config.workers.reap_interval_secs,
        shutdown_grace_period_ms = config.workers.shutdown_grace_period_ms,
        readiness_attempts = config.workers.readiness_attempts,
        readiness_interval_ms = config.workers.readiness_interval_ms,
        "Lifecycle settings"
    );
}
