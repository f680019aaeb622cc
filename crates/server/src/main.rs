use anyhow::Result;
use server::{create_app, init_logging, AppState};
use sluice_core::{
    config::AppConfig,
    metrics::MetricsCollector,
    sources::build_sources,
    store::{RecordStore, SqliteStore},
    sync::SyncEngine,
    GatewayBuilder,
};
use std::{path::Path, sync::Arc, time::Duration};
use tokio::{signal, sync::broadcast, task::JoinHandle};
use tracing::{debug, error, info, warn};

/// Graceful shutdown timeout in seconds.
/// After this timeout, the server will be forcefully terminated.
const GRACEFUL_SHUTDOWN_TIMEOUT_SECS: u64 = 30;

#[tokio::main]
async fn main() -> Result<()> {
    let config =
        AppConfig::load().map_err(|e| anyhow::anyhow!("Configuration loading failed: {e}"))?;
    config.validate().map_err(|e| anyhow::anyhow!("Configuration validation failed: {e}"))?;

    init_logging(&config);
    info!(environment = %config.environment, "Starting sluice gateway");
    debug!(
        providers_count = config.providers.len(),
        sources_count = config.sources.len(),
        bind_port = config.server.bind_port,
        "Configuration loaded"
    );

    let metrics = config.metrics.enabled.then(MetricsCollector::new);

    ensure_database_dir(&config.store.database_url)?;
    let store: Arc<dyn RecordStore> = Arc::new(
        SqliteStore::connect_and_migrate(&config.store.database_url)
            .await
            .map_err(|e| anyhow::anyhow!("Store initialization failed: {e}"))?,
    );

    let gateway = GatewayBuilder::from_app_config(&config)
        .build()
        .map_err(|e| anyhow::anyhow!("Gateway initialization failed: {e}"))?;

    let mut engine = SyncEngine::new(
        gateway.clone(),
        Arc::clone(&store),
        Duration::from_secs(config.store.failure_retry_seconds),
    );
    for (source, policy) in
        build_sources(&config).map_err(|e| anyhow::anyhow!("Source setup failed: {e}"))?
    {
        debug!(provider = %source.provider(), kind = %source.kind(), ?policy, "source registered");
        engine = engine.with_source(source, policy);
    }
    info!(
        providers = gateway.providers().len(),
        sources = engine.sources().len(),
        "Gateway initialized"
    );

    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let tasks = vec![
        spawn_cache_purge(
            gateway.clone(),
            Duration::from_secs(config.gateway.purge_interval_seconds.max(1)),
            shutdown_tx.subscribe(),
        ),
        spawn_refresh_log_prune(
            Arc::clone(&store),
            config.store.refresh_log_retention_days,
            Duration::from_secs(config.store.prune_interval_seconds.max(1)),
            shutdown_tx.subscribe(),
        ),
    ];

    let app = create_app(AppState::new(engine, store, metrics));
    let addr = config.socket_addr().map_err(|e| anyhow::anyhow!(e))?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(address = %addr, "HTTP server listening");

    if let Err(e) = axum::serve(listener, app).with_graceful_shutdown(shutdown_signal()).await {
        error!(error = %e, "Server error occurred");
    }

    let _ = shutdown_tx.send(());
    for task in tasks {
        if tokio::time::timeout(Duration::from_secs(GRACEFUL_SHUTDOWN_TIMEOUT_SECS), task)
            .await
            .is_err()
        {
            warn!("background task did not stop within the shutdown timeout");
        }
    }
    info!("Server shutdown complete");

    Ok(())
}

/// Creates the parent directory of a file-backed `SQLite` URL.
fn ensure_database_dir(database_url: &str) -> Result<()> {
    let Some(path) = database_url.strip_prefix("sqlite://") else {
        return Ok(());
    };
    let path = path.split('?').next().unwrap_or(path);
    if path.contains(":memory:") {
        return Ok(());
    }
    if let Some(parent) = Path::new(path).parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    Ok(())
}

fn spawn_cache_purge(
    gateway: sluice_core::Gateway,
    interval: Duration,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    debug!("cache purge task stopping");
                    break;
                }
                _ = ticker.tick() => {
                    let removed = gateway.purge_expired();
                    if removed > 0 {
                        debug!(removed, "expired cache entries purged");
                    }
                }
            }
        }
    })
}

fn spawn_refresh_log_prune(
    store: Arc<dyn RecordStore>,
    retention_days: u32,
    interval: Duration,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    debug!("refresh-log prune task stopping");
                    break;
                }
                _ = ticker.tick() => {
                    let cutoff = chrono::Utc::now() - chrono::Duration::days(i64::from(retention_days));
                    match store.prune_refresh_log(cutoff).await {
                        Ok(0) => {}
                        Ok(removed) => info!(removed, "refresh log pruned"),
                        Err(e) => error!(error = %e, "refresh log prune failed"),
                    }
                }
            }
        }
    })
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install signal handler");
                () = std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!(
        "Shutdown signal received, starting graceful shutdown (timeout: {}s)",
        GRACEFUL_SHUTDOWN_TIMEOUT_SECS
    );
}
