//! Courier delivery pipeline daemon.
//!
//! Opens the durable queue, starts the delivery workers and the
//! scheduler, and keeps them running until a shutdown signal arrives.
//! Sources and targets are registered by the embedding host; run
//! standalone, the daemon drains whatever the queue already holds.

use std::sync::Arc;

use anyhow::{Context, Result};
use courier_core::{Clock, CredentialError, CredentialStore, RealClock, Storage};
use courier_delivery::{
    DeliveryEngine, Scheduler, SourceDirectory, TargetDirectory, TargetHealthTracker,
};
use courier_service::{Config, PipelineService};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load().context("failed to load configuration")?;
    init_tracing(&config.log);

    info!("starting courier delivery pipeline");

    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("failed to create data directory {}", config.data_dir.display()))?;

    let clock: Arc<dyn Clock> = Arc::new(RealClock);
    let storage = Arc::new(
        Storage::open(&config.database_path(), clock.clone())
            .await
            .context("failed to open delivery queue storage")?,
    );
    info!(path = %config.database_path().display(), "storage opened");

    let health = Arc::new(TargetHealthTracker::new(config.to_health_config(), clock.clone()));
    let targets = Arc::new(TargetDirectory::new());
    let sources = Arc::new(SourceDirectory::new());
    let credentials: Arc<dyn CredentialStore> = Arc::new(EnvCredentials);

    let mut engine = DeliveryEngine::new(
        storage.clone(),
        config.to_delivery_config(),
        health.clone(),
        targets.clone(),
        credentials.clone(),
        clock.clone(),
    )
    .context("failed to build delivery engine")?;
    engine.start().await.context("failed to start delivery engine")?;
    info!(workers = config.worker_pool_size, "delivery engine started");

    let scheduler_token = CancellationToken::new();
    let scheduler = Arc::new(Scheduler::new(
        storage.clone(),
        sources.clone(),
        targets.clone(),
        config.to_scheduler_config(),
        clock,
        scheduler_token.clone(),
    ));
    let scheduler_handle = tokio::spawn({
        let scheduler = scheduler.clone();
        async move { scheduler.run().await }
    });

    let service = PipelineService::new(
        storage.clone(),
        health,
        targets,
        sources,
        credentials,
        scheduler,
    );
    let status = service.delivery_status().await?;
    info!(
        pending = status.pending_count,
        failed = status.failed_count,
        "queue state at startup"
    );

    shutdown_signal().await;
    info!("shutdown signal received, starting graceful shutdown");

    scheduler_token.cancel();
    if let Err(e) = engine.shutdown().await {
        error!(error = %e, "delivery engine did not shut down cleanly");
    }
    if let Err(e) = scheduler_handle.await {
        error!(error = %e, "scheduler task panicked");
    }

    storage.close().await;
    info!("courier shutdown complete");
    Ok(())
}

/// Initializes tracing. `RUST_LOG` wins over the configured level.
fn init_tracing(default_filter: &str) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_filter))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let fmt_layer = fmt::layer().with_target(true);

    tracing_subscriber::registry().with(filter).with(fmt_layer).init();
}

/// Waits for CTRL+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            },
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("received CTRL+C");
        },
        _ = terminate => {
            info!("received SIGTERM");
        },
    }
}

/// Read-only credential store backed by environment variables.
///
/// A key like `binding:stats:e1` resolves from
/// `COURIER_CREDENTIAL_BINDING_STATS_E1`. Embedding hosts supply their
/// own store (OS keychain, encrypted file) through the
/// `CredentialStore` trait.
struct EnvCredentials;

impl EnvCredentials {
    fn var_name(key: &str) -> String {
        let sanitized: String = key
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
            .collect();
        format!("COURIER_CREDENTIAL_{sanitized}")
    }
}

impl CredentialStore for EnvCredentials {
    fn store(&self, key: &str, _secret: &str) -> std::result::Result<(), CredentialError> {
        Err(CredentialError::Storage(format!(
            "environment credential store is read-only; set {}",
            Self::var_name(key)
        )))
    }

    fn retrieve(&self, key: &str) -> std::result::Result<String, CredentialError> {
        std::env::var(Self::var_name(key)).map_err(|_| CredentialError::NotFound(key.to_string()))
    }

    fn delete(&self, key: &str) -> std::result::Result<(), CredentialError> {
        Err(CredentialError::Storage(format!(
            "environment credential store is read-only; unset {}",
            Self::var_name(key)
        )))
    }

    fn exists(&self, key: &str) -> bool {
        std::env::var(Self::var_name(key)).is_ok()
    }
}
