//! Standalone log cursor daemon.
//!
//! Usage: `log-cursor [config.json]`
//!
//! Without real replication handlers wired in, every event type listed in
//! `log_only_event_types` gets a log-only handler: useful for observing a
//! deployment before enabling side effects. Embedders should use the
//! library API instead.

use log_cursor::{
    CursorConfig, Daemon, EventStore, ExitReason, HandlerRegistry, InMemoryLease, LeaseService,
    NoOpHandler, RedisLease,
};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info, warn, Instrument};

fn hostname() -> String {
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("HOST"))
        .unwrap_or_else(|_| "unknown".to_string())
}

fn load_config() -> Result<CursorConfig, String> {
    match std::env::args().nth(1) {
        Some(path) => {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| format!("Failed to read config {}: {}", path, e))?;
            serde_json::from_str(&text)
                .map_err(|e| format!("Failed to parse config {}: {}", path, e))
        }
        None => {
            warn!("No config file given, using defaults");
            Ok(CursorConfig::default())
        }
    }
}

async fn build_lease(config: &CursorConfig) -> Result<Arc<dyn LeaseService>, String> {
    let ttl = config.lease.ttl_duration();
    match &config.lease.redis_url {
        Some(url) => {
            let lease = RedisLease::connect(url, config.lease.key.clone(), ttl)
                .await
                .map_err(|e| format!("Failed to connect lease service: {}", e))?;
            Ok(Arc::new(lease))
        }
        None => {
            warn!("No redis_url configured, using in-process lease; do NOT run multiple cursor processes like this");
            Ok(Arc::new(InMemoryLease::new(ttl)))
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .json()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = match load_config() {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "Invalid configuration");
            return ExitCode::from(2);
        }
    };

    let store = match EventStore::open(&config.store).await {
        Ok(s) => Arc::new(s),
        Err(e) => {
            error!(error = %e, "Failed to open event store");
            return ExitCode::from(2);
        }
    };

    let lease = match build_lease(&config).await {
        Ok(l) => l,
        Err(e) => {
            error!(error = %e, "Failed to set up lease service");
            return ExitCode::from(2);
        }
    };

    let mut registry = HandlerRegistry::new();
    for event_type in &config.log_only_event_types {
        registry.register(event_type.clone(), Arc::new(NoOpHandler));
    }
    if config.log_only_event_types.is_empty() {
        warn!("No event types configured; any event in the log will be treated as unknown");
    }

    let node_id = config.node.node_id.clone();
    let mut daemon = Daemon::new(config, Arc::clone(&store), lease, registry);
    let shutdown = daemon.shutdown_handle();

    tokio::spawn(async move {
        wait_for_signal().await;
        info!("Shutdown signal received");
        let _ = shutdown.send(true);
    });

    // pid and host on the root span so every log line carries them.
    let span = tracing::info_span!(
        "log_cursor",
        pid = std::process::id(),
        host = %hostname(),
        node_id = %node_id,
    );
    let exit = daemon.run().instrument(span).await;
    store.close().await;

    match exit {
        ExitReason::ShutdownRequested => ExitCode::SUCCESS,
        ExitReason::FatalError(e) => {
            error!(error = %e, "Daemon exited with a fatal error");
            ExitCode::FAILURE
        }
    }
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "Failed to install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = sigterm.recv() => {}
        _ = tokio::signal::ctrl_c() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
