use activator::admin::{AdminServer, PKG_NAME, VERSION};
use activator::config::Config;
use activator::dispatch::Dispatcher;
use activator::proxy::GatewayServer;
use activator::registry::ActivationRegistry;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

const DEFAULT_CONFIG_PATH: &str = "activator.toml";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("activator=debug".parse()?),
        )
        .init();

    let explicit_path = std::env::args().nth(1).map(PathBuf::from);
    let config_path = explicit_path
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));

    let config = load_config(&config_path, explicit_path.is_some())?;

    print_startup_banner(&config);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let registry = Arc::new(ActivationRegistry::new());
    let dispatcher = Arc::new(Dispatcher::from_config(&config, registry)?);

    let gateway_addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port)
        .parse()
        .map_err(|e| {
            error!(bind = %config.server.bind, port = config.server.port, error = %e, "Invalid bind address");
            anyhow::anyhow!("Invalid bind address: {}", e)
        })?;

    let gateway = GatewayServer::new(gateway_addr, Arc::clone(&dispatcher), shutdown_rx.clone());
    let gateway_handle = tokio::spawn(async move {
        if let Err(e) = gateway.run().await {
            error!(error = %e, "Gateway server error");
        }
    });

    let admin_handle = if config.server.admin_port > 0 {
        let admin_addr: SocketAddr = format!("127.0.0.1:{}", config.server.admin_port)
            .parse()
            .map_err(|e| {
                error!(admin_port = config.server.admin_port, error = %e, "Invalid admin bind address");
                anyhow::anyhow!("Invalid admin bind address: {}", e)
            })?;

        let admin_token = config.server.admin_token.clone().unwrap_or_else(|| {
            let token = uuid::Uuid::new_v4().to_string();
            info!(token = %token, "Generated admin API token (configure admin_token to set a fixed value)");
            token
        });

        let admin_server = AdminServer::new(admin_addr, Arc::clone(&dispatcher), shutdown_rx.clone(), admin_token);
        Some(tokio::spawn(async move {
            if let Err(e) = admin_server.run().await {
                error!(error = %e, "Admin server error");
            }
        }))
    } else {
        info!("Admin API disabled");
        None
    };

    wait_for_shutdown(&config_path, &dispatcher).await?;

    let _ = shutdown_tx.send(true);

    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        let _ = gateway_handle.await;
        if let Some(handle) = admin_handle {
            let _ = handle.await;
        }
    })
    .await;

    info!("Shutdown complete");
    Ok(())
}

/// Load configuration; a missing default file means built-in defaults
fn load_config(path: &Path, explicit: bool) -> anyhow::Result<Config> {
    if !explicit && !path.exists() {
        warn!(path = %path.display(), "No configuration file found, using defaults");
        let config = Config::default();
        config.validate()?;
        return Ok(config);
    }

    let config = Config::load(path).map_err(|e| {
        error!(path = %path.display(), error = %e, "Failed to load configuration");
        e
    })?;
    info!(path = %path.display(), "Configuration loaded");
    Ok(config)
}

/// Block until SIGINT or SIGTERM; SIGHUP reloads the upstream overrides
#[cfg(unix)]
async fn wait_for_shutdown(config_path: &Path, dispatcher: &Dispatcher) -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())
        .map_err(|e| anyhow::anyhow!("Failed to install SIGTERM handler: {}", e))?;
    let mut sighup = signal(SignalKind::hangup())
        .map_err(|e| anyhow::anyhow!("Failed to install SIGHUP handler: {}", e))?;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT (Ctrl+C), shutting down...");
                return Ok(());
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
                return Ok(());
            }
            _ = sighup.recv() => {
                info!(path = %config_path.display(), "Received SIGHUP, reloading upstreams...");
                match reload_upstreams(config_path, dispatcher) {
                    Ok(count) => info!(upstreams = count, "Upstreams reloaded"),
                    Err(e) => error!(error = %e, "Failed to reload upstreams, keeping the current set"),
                }
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown(_config_path: &Path, _dispatcher: &Dispatcher) -> anyhow::Result<()> {
    tokio::signal::ctrl_c()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to listen for Ctrl+C: {}", e))?;
    info!("Received Ctrl+C, shutting down...");
    Ok(())
}

#[cfg(unix)]
fn reload_upstreams(config_path: &Path, dispatcher: &Dispatcher) -> anyhow::Result<usize> {
    let config = Config::load(config_path)?;
    let upstreams = config.upstream_addrs()?;
    let count = upstreams.len();
    dispatcher.pool().replace_upstreams(upstreams);
    Ok(count)
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting activation gateway");
    info!(
        bind = %config.server.bind,
        port = config.server.port,
        admin_port = if config.server.admin_port > 0 { Some(config.server.admin_port) } else { None },
        request_timeout_secs = config.server.request_timeout_secs,
        "Server configuration"
    );
    info!(
        pool_max_idle = config.server.pool_max_idle_per_host,
        pool_idle_timeout_secs = config.server.pool_idle_timeout_secs,
        "Connection pool settings"
    );
    info!(
        loading = %format!("{}:{}", config.naming.loading_host, config.naming.loading_port),
        frontend = %format!("{}:{}", config.naming.frontend_host, config.naming.frontend_port),
        backend = %format!("{}:{}", config.naming.backend_host, config.naming.backend_port),
        "Service naming"
    );
    info!(
        orchestration_url = %config.orchestration.url,
        orchestration_timeout_secs = config.orchestration.timeout_secs,
        probe_path = %config.activation.probe_path,
        probe_timeout_secs = config.activation.probe_timeout_secs,
        intent_marker = %config.activation.intent_marker,
        tenant_gate = ?config.activation.tenant_gate,
        "Activation settings"
    );
    if !config.upstreams.is_empty() {
        info!(
            count = config.upstreams.len(),
            hosts = ?config.upstreams.keys().collect::<Vec<_>>(),
            "Static upstream overrides"
        );
    }
}
