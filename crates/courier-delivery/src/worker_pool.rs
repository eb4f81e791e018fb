//! Worker pool lifecycle management.
//!
//! Spawns the configured number of delivery workers as supervised tasks and
//! owns their shutdown: cancellation is signalled through a shared token and
//! joins are bounded by a timeout so shutdown can never hang on a stuck
//! worker.

use std::{sync::Arc, time::Duration};

use courier_core::{Clock, CredentialStore, Storage};
use tokio::{sync::RwLock, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{
    client::DeliveryClient,
    directory::TargetDirectory,
    error::{DeliveryError, Result},
    health::TargetHealthTracker,
    retry::RetryPolicy,
    worker::{DeliveryConfig, DeliveryWorker, EngineStats},
};

/// Supervises the set of delivery worker tasks.
pub(crate) struct WorkerPool {
    storage: Arc<Storage>,
    config: DeliveryConfig,
    client: Arc<DeliveryClient>,
    health: Arc<TargetHealthTracker>,
    targets: Arc<TargetDirectory>,
    credentials: Arc<dyn CredentialStore>,
    retry_policy: RetryPolicy,
    stats: Arc<RwLock<EngineStats>>,
    cancellation_token: CancellationToken,
    worker_handles: Vec<JoinHandle<Result<()>>>,
    clock: Arc<dyn Clock>,
}

impl WorkerPool {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        storage: Arc<Storage>,
        config: DeliveryConfig,
        client: Arc<DeliveryClient>,
        health: Arc<TargetHealthTracker>,
        targets: Arc<TargetDirectory>,
        credentials: Arc<dyn CredentialStore>,
        stats: Arc<RwLock<EngineStats>>,
        cancellation_token: CancellationToken,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let retry_policy = config.retry_policy.clone();
        Self {
            storage,
            config,
            client,
            health,
            targets,
            credentials,
            retry_policy,
            stats,
            cancellation_token,
            worker_handles: Vec::new(),
            clock,
        }
    }

    /// Spawns all configured workers. Returns once they are running; they
    /// keep processing until cancellation is signalled.
    pub(crate) async fn spawn_workers(&mut self) -> Result<()> {
        info!(worker_count = self.config.worker_count, "spawning delivery workers");

        {
            let mut stats = self.stats.write().await;
            stats.active_workers = self.config.worker_count;
        }

        for worker_id in 0..self.config.worker_count {
            let worker = DeliveryWorker::new(
                worker_id,
                self.storage.clone(),
                self.config.clone(),
                self.client.clone(),
                self.health.clone(),
                self.targets.clone(),
                self.credentials.clone(),
                self.retry_policy.clone(),
                self.stats.clone(),
                self.cancellation_token.clone(),
                self.clock.clone(),
            );

            let handle = tokio::spawn(async move {
                let result = worker.run().await;
                if let Err(ref error) = result {
                    error!(worker_id, error = %error, "delivery worker terminated with error");
                }
                result
            });

            self.worker_handles.push(handle);
        }

        Ok(())
    }

    /// Signals cancellation and waits for every worker to finish its
    /// in-flight item, bounded by `timeout`.
    pub(crate) async fn shutdown_graceful(mut self, timeout: Duration) -> Result<()> {
        info!(
            worker_count = self.worker_handles.len(),
            timeout_seconds = timeout.as_secs(),
            "initiating graceful worker shutdown"
        );

        self.cancellation_token.cancel();

        let join_all = async {
            let mut errors = 0;
            for (worker_id, handle) in
                std::mem::take(&mut self.worker_handles).into_iter().enumerate()
            {
                match handle.await {
                    Ok(Ok(())) => {},
                    Ok(Err(error)) => {
                        warn!(worker_id, error = %error, "worker completed with error during shutdown");
                        errors += 1;
                    },
                    Err(join_error) => {
                        error!(worker_id, error = %join_error, "worker task panicked");
                        errors += 1;
                    },
                }
            }

            let mut stats = self.stats.write().await;
            stats.active_workers = 0;
            drop(stats);

            errors
        };

        match tokio::time::timeout(timeout, join_all).await {
            Ok(errors) => {
                if errors > 0 {
                    warn!(errors, "some workers completed with errors during shutdown");
                }
                info!("worker pool shutdown completed");
                Ok(())
            },
            Err(_) => {
                error!(
                    timeout_seconds = timeout.as_secs(),
                    "worker shutdown timed out, some workers may still be running"
                );
                Err(DeliveryError::ShutdownTimeout { timeout })
            },
        }
    }

    /// True while any worker task is still running.
    pub(crate) fn has_active_workers(&self) -> bool {
        self.worker_handles.iter().any(|h| !h.is_finished())
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        if self.has_active_workers() && !self.cancellation_token.is_cancelled() {
            warn!("worker pool dropped without graceful shutdown, cancelling workers");
            self.cancellation_token.cancel();
        }
    }
}
