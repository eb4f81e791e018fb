//! Delivery engine and worker loop.
//!
//! Workers claim batches of ready items from the durable queue and walk each
//! one through the delivery lifecycle: resolve the binding, short-circuit if
//! the target is degraded, materialize auth, post the payload, and record
//! the outcome. Claiming is transactional, so multiple workers never process
//! the same item; everything else an attempt needs is read fresh per item so
//! binding edits take effect immediately.

use std::{sync::Arc, time::Duration};

use courier_core::{
    Binding, Clock, CredentialError, CredentialStore, DeliveryItem, DeliveryStatus, Storage,
};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    client::{ClientConfig, DeliveryClient, DeliveryRequest},
    directory::TargetDirectory,
    error::{DeliveryError, Result},
    health::{FailureClass, TargetHealthTracker},
    retry::RetryPolicy,
    worker_pool::WorkerPool,
};

/// Configuration for the delivery engine.
#[derive(Debug, Clone)]
pub struct DeliveryConfig {
    /// Number of concurrent delivery workers.
    pub worker_count: usize,

    /// Maximum items to claim per worker batch.
    pub batch_size: usize,

    /// How often idle workers poll the queue.
    pub poll_interval: Duration,

    /// HTTP client configuration.
    pub client_config: ClientConfig,

    /// Backoff policy applied to failed attempts.
    pub retry_policy: RetryPolicy,

    /// Maximum time to wait for workers during graceful shutdown.
    pub shutdown_timeout: Duration,

    /// Age after which a claimed item is considered orphaned by a crash
    /// and recovered at startup.
    pub orphan_max_age: Duration,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            worker_count: crate::DEFAULT_WORKER_COUNT,
            batch_size: crate::DEFAULT_BATCH_SIZE,
            poll_interval: Duration::from_secs(crate::DEFAULT_POLL_INTERVAL_SECONDS),
            client_config: ClientConfig::default(),
            retry_policy: RetryPolicy::default(),
            shutdown_timeout: Duration::from_secs(30),
            orphan_max_age: Duration::from_secs(300),
        }
    }
}

/// Counters for engine monitoring.
#[derive(Debug, Clone, Default)]
pub struct EngineStats {
    /// Number of running delivery workers.
    pub active_workers: usize,
    /// Items processed since startup.
    pub items_processed: u64,
    /// Successful deliveries.
    pub successful_deliveries: u64,
    /// Failed attempts that will retry.
    pub failed_deliveries: u64,
    /// Items moved to the dead letter queue.
    pub dead_lettered: u64,
    /// Items parked behind a degraded target.
    pub parked: u64,
    /// Items currently being delivered.
    pub in_flight: u64,
}

/// Coordinates delivery workers over the durable queue.
pub struct DeliveryEngine {
    storage: Arc<Storage>,
    config: DeliveryConfig,
    client: Arc<DeliveryClient>,
    health: Arc<TargetHealthTracker>,
    targets: Arc<TargetDirectory>,
    credentials: Arc<dyn CredentialStore>,
    stats: Arc<RwLock<EngineStats>>,
    cancellation_token: CancellationToken,
    worker_pool: Option<WorkerPool>,
    clock: Arc<dyn Clock>,
}

impl DeliveryEngine {
    /// Creates a new engine.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(
        storage: Arc<Storage>,
        config: DeliveryConfig,
        health: Arc<TargetHealthTracker>,
        targets: Arc<TargetDirectory>,
        credentials: Arc<dyn CredentialStore>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let client = Arc::new(DeliveryClient::new(config.client_config.clone())?);

        Ok(Self {
            storage,
            config,
            client,
            health,
            targets,
            credentials,
            stats: Arc::new(RwLock::new(EngineStats::default())),
            cancellation_token: CancellationToken::new(),
            worker_pool: None,
            clock,
        })
    }

    /// Recovers orphaned items and spawns the worker pool.
    ///
    /// Returns once workers are running; use [`DeliveryEngine::shutdown`]
    /// to stop them.
    ///
    /// # Errors
    ///
    /// Returns an error if orphan recovery or worker spawning fails.
    pub async fn start(&mut self) -> Result<()> {
        info!(
            worker_count = self.config.worker_count,
            batch_size = self.config.batch_size,
            "starting delivery engine"
        );

        let recovered = self.storage.queue.recover_orphans(self.config.orphan_max_age).await?;
        if recovered > 0 {
            warn!(recovered, "recovered orphaned in-flight items from previous run");
        }

        let mut worker_pool = WorkerPool::new(
            self.storage.clone(),
            self.config.clone(),
            self.client.clone(),
            self.health.clone(),
            self.targets.clone(),
            self.credentials.clone(),
            self.stats.clone(),
            self.cancellation_token.clone(),
            self.clock.clone(),
        );

        worker_pool.spawn_workers().await?;
        self.worker_pool = Some(worker_pool);

        info!("delivery engine started");
        Ok(())
    }

    /// Gracefully shuts down, waiting for in-flight deliveries to finish.
    ///
    /// # Errors
    ///
    /// Returns an error if the shutdown timeout is exceeded.
    pub async fn shutdown(mut self) -> Result<()> {
        info!("shutting down delivery engine");

        if let Some(worker_pool) = self.worker_pool.take() {
            worker_pool.shutdown_graceful(self.config.shutdown_timeout).await?;
        }
        Ok(())
    }

    /// Current engine counters.
    pub async fn stats(&self) -> EngineStats {
        self.stats.read().await.clone()
    }

    /// Claims and processes exactly one batch synchronously.
    ///
    /// Used for tests and controlled draining; does not spawn workers.
    ///
    /// # Errors
    ///
    /// Returns an error if claiming fails. Per-item failures are recorded
    /// in the queue, not returned.
    pub async fn process_batch(&self) -> Result<usize> {
        let worker = DeliveryWorker::new(
            0,
            self.storage.clone(),
            self.config.clone(),
            self.client.clone(),
            self.health.clone(),
            self.targets.clone(),
            self.credentials.clone(),
            self.config.retry_policy.clone(),
            self.stats.clone(),
            self.cancellation_token.clone(),
            self.clock.clone(),
        );

        worker.process_batch().await
    }
}

/// A single delivery worker.
pub(crate) struct DeliveryWorker {
    id: usize,
    storage: Arc<Storage>,
    config: DeliveryConfig,
    client: Arc<DeliveryClient>,
    health: Arc<TargetHealthTracker>,
    targets: Arc<TargetDirectory>,
    credentials: Arc<dyn CredentialStore>,
    retry_policy: RetryPolicy,
    stats: Arc<RwLock<EngineStats>>,
    cancellation_token: CancellationToken,
    clock: Arc<dyn Clock>,
}

impl DeliveryWorker {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: usize,
        storage: Arc<Storage>,
        config: DeliveryConfig,
        client: Arc<DeliveryClient>,
        health: Arc<TargetHealthTracker>,
        targets: Arc<TargetDirectory>,
        credentials: Arc<dyn CredentialStore>,
        retry_policy: RetryPolicy,
        stats: Arc<RwLock<EngineStats>>,
        cancellation_token: CancellationToken,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            id,
            storage,
            config,
            client,
            health,
            targets,
            credentials,
            retry_policy,
            stats,
            cancellation_token,
            clock,
        }
    }

    /// Main loop: claim and process batches until cancelled.
    pub(crate) async fn run(&self) -> Result<()> {
        info!(worker_id = self.id, "delivery worker starting");

        loop {
            if self.cancellation_token.is_cancelled() {
                break;
            }

            match self.process_batch().await {
                Ok(0) => {
                    tokio::select! {
                        () = self.clock.sleep(self.config.poll_interval) => {},
                        () = self.cancellation_token.cancelled() => break,
                    }
                },
                Ok(_) => {},
                Err(error) => {
                    error!(worker_id = self.id, error = %error, "batch processing failed");
                    // Back off so a storage outage does not spin the loop
                    tokio::select! {
                        () = self.clock.sleep(Duration::from_secs(5)) => {},
                        () = self.cancellation_token.cancelled() => break,
                    }
                },
            }
        }

        info!(worker_id = self.id, "delivery worker stopped");
        Ok(())
    }

    /// Claims one batch and processes every item in it.
    pub(crate) async fn process_batch(&self) -> Result<usize> {
        let items = self.storage.queue.claim_batch(self.config.batch_size).await?;
        let batch_size = items.len();

        if batch_size > 0 {
            debug!(worker_id = self.id, batch_size, "processing claimed batch");
        }

        for item in items {
            if self.cancellation_token.is_cancelled() {
                // Unprocessed claims are returned so the next run sees them
                // without waiting out orphan recovery
                self.storage.queue.release(item.item_id, Duration::ZERO).await?;
                continue;
            }

            if let Err(error) = self.process_item(item).await {
                error!(worker_id = self.id, error = %error, "item processing failed");
            }
        }

        Ok(batch_size)
    }

    async fn process_item(&self, item: DeliveryItem) -> Result<()> {
        {
            let mut stats = self.stats.write().await;
            stats.in_flight += 1;
        }

        let result = self.attempt(&item).await;

        {
            let mut stats = self.stats.write().await;
            stats.in_flight -= 1;
            stats.items_processed += 1;
        }

        result
    }

    async fn attempt(&self, item: &DeliveryItem) -> Result<()> {
        let Some(binding) = self.resolve_binding(item).await? else {
            warn!(
                worker_id = self.id,
                item_id = %item.item_id,
                source_id = %item.source_id,
                "no active binding for item, releasing for later"
            );
            self.storage.queue.release(item.item_id, self.config.poll_interval).await?;
            return Ok(());
        };

        if let Some(degradation) = self.health.is_degraded(&binding.target_id) {
            debug!(
                worker_id = self.id,
                item_id = %item.item_id,
                target_id = %binding.target_id,
                "target degraded, parking item"
            );
            let reason =
                format!("target {} is degraded: {}", degradation.target_id, degradation.reason);
            self.storage.queue.mark_target_paused(item.item_id, &reason).await?;
            let mut stats = self.stats.write().await;
            stats.parked += 1;
            return Ok(());
        }

        let headers = match self.build_headers(&binding) {
            Ok(headers) => headers,
            Err(error) => {
                // Misconfiguration: the attempt cannot even start. Fail it
                // through the normal path so the retry log tells the story.
                return self.record_failure(item, &binding, error).await;
            },
        };

        let request = DeliveryRequest {
            url: binding.endpoint_url.clone(),
            source_id: item.source_id.clone(),
            event_type: item.event_type.clone(),
            headers,
            payload: item.payload.clone(),
        };

        match self.client.deliver(&request).await {
            Ok(response) => {
                let delivered_to = match self.targets.get(&binding.target_id) {
                    Some(target) => binding.delivered_to(target.target_type(), target.base_url()),
                    None => binding.delivered_to("webhook", &binding.endpoint_url),
                };
                self.storage.queue.mark_delivered(item.item_id, &delivered_to).await?;
                self.health.report_success(&binding.target_id);

                {
                    let mut stats = self.stats.write().await;
                    stats.successful_deliveries += 1;
                }

                info!(
                    worker_id = self.id,
                    item_id = %item.item_id,
                    endpoint = %binding.endpoint_name,
                    status = response.status,
                    "item delivered"
                );
                Ok(())
            },
            Err(error) => self.record_failure(item, &binding, error).await,
        }
    }

    /// Resolves the binding an item should be delivered through.
    ///
    /// Fanned-out items carry their endpoint; legacy untargeted items fall
    /// back to the source's first active binding.
    async fn resolve_binding(&self, item: &DeliveryItem) -> Result<Option<Binding>> {
        let binding = match &item.target_endpoint_id {
            Some(endpoint_id) => {
                self.storage.bindings.find(&item.source_id, endpoint_id).await?
            },
            None => {
                self.storage.bindings.active_for_source(&item.source_id).await?.into_iter().next()
            },
        };

        Ok(binding.filter(|b| b.active))
    }

    /// Materializes request headers from the binding, resolving the auth
    /// credential by key. Secret values never touch storage.
    fn build_headers(&self, binding: &Binding) -> Result<Vec<(String, String)>> {
        let mut headers: Vec<(String, String)> =
            binding.custom_headers.iter().map(|(k, v)| (k.clone(), v.clone())).collect();

        if let Some(header_name) = &binding.auth_header_name {
            let key = binding.auth_credential_key.as_ref().ok_or_else(|| {
                DeliveryError::configuration(format!(
                    "no credential stored for binding {}",
                    binding.binding_id()
                ))
            })?;

            let secret = self.credentials.retrieve(key).map_err(|error| match error {
                CredentialError::NotFound(_) => DeliveryError::configuration(format!(
                    "no credential stored for binding {}",
                    binding.binding_id()
                )),
                other => DeliveryError::configuration(other.to_string()),
            })?;

            headers.push((header_name.clone(), secret));
        }

        Ok(headers)
    }

    async fn record_failure(
        &self,
        item: &DeliveryItem,
        binding: &Binding,
        error: DeliveryError,
    ) -> Result<()> {
        let backoff = match error.retry_after_seconds() {
            Some(seconds) => Duration::from_secs(seconds),
            None => self.retry_policy.delay_for_attempt(item.retry_count + 1),
        };

        let message = error.to_string();

        let class = if error.is_auth_failure() {
            FailureClass::Auth
        } else if error.counts_against_target() {
            FailureClass::Transient
        } else {
            FailureClass::Benign
        };

        // Park the backlog before recording the failure: the triggering item
        // is still in_flight here, so the sweep leaves it alone and it keeps
        // its failed status and consumed retry.
        if self.health.report_failure(&binding.target_id, class, &message) {
            self.pause_target_backlog(&binding.target_id, &message).await?;
        }

        let new_status = self.storage.queue.mark_failed(item.item_id, &message, backoff).await?;

        {
            let mut stats = self.stats.write().await;
            match new_status {
                DeliveryStatus::Dlq => stats.dead_lettered += 1,
                _ => stats.failed_deliveries += 1,
            }
        }

        warn!(
            worker_id = self.id,
            item_id = %item.item_id,
            endpoint = %binding.endpoint_name,
            status = ?new_status,
            error = %message,
            "delivery attempt failed"
        );
        Ok(())
    }

    /// Parks the ready backlog of every endpoint on a newly degraded target.
    async fn pause_target_backlog(&self, target_id: &str, reason: &str) -> Result<()> {
        let mut paused = 0;
        for binding in self.storage.bindings.list_all().await? {
            if binding.target_id == target_id {
                paused += self
                    .storage
                    .queue
                    .pause_ready_for_endpoint(&binding.endpoint_id, reason)
                    .await?;
            }
        }

        info!(target_id, paused, "paused backlog for degraded target");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::HashMap, sync::Mutex};

    use courier_core::{NewBinding, TestClock, TriggerType};
    use wiremock::{
        matchers::{header, method},
        Mock, MockServer, ResponseTemplate,
    };

    use super::*;
    use crate::health::HealthConfig;

    struct MemoryCredentials {
        secrets: Mutex<HashMap<String, String>>,
    }

    impl MemoryCredentials {
        fn new() -> Self {
            Self { secrets: Mutex::new(HashMap::new()) }
        }
    }

    impl CredentialStore for MemoryCredentials {
        fn store(&self, key: &str, secret: &str) -> std::result::Result<(), CredentialError> {
            self.secrets.lock().unwrap().insert(key.to_string(), secret.to_string());
            Ok(())
        }

        fn retrieve(&self, key: &str) -> std::result::Result<String, CredentialError> {
            self.secrets
                .lock()
                .unwrap()
                .get(key)
                .cloned()
                .ok_or_else(|| CredentialError::NotFound(key.to_string()))
        }

        fn delete(&self, key: &str) -> std::result::Result<(), CredentialError> {
            self.secrets.lock().unwrap().remove(key);
            Ok(())
        }

        fn exists(&self, key: &str) -> bool {
            self.secrets.lock().unwrap().contains_key(key)
        }
    }

    struct Harness {
        storage: Arc<Storage>,
        clock: Arc<TestClock>,
        health: Arc<TargetHealthTracker>,
        credentials: Arc<MemoryCredentials>,
        engine: DeliveryEngine,
    }

    async fn harness(degrade_threshold: u32) -> Harness {
        let config = DeliveryConfig {
            retry_policy: RetryPolicy { jitter_factor: 0.0, ..Default::default() },
            ..Default::default()
        };
        harness_with(config, degrade_threshold).await
    }

    async fn harness_with(config: DeliveryConfig, degrade_threshold: u32) -> Harness {
        let clock = Arc::new(TestClock::new());
        let storage =
            Arc::new(Storage::open_in_memory(clock.clone() as Arc<dyn Clock>).await.unwrap());
        let health = Arc::new(TargetHealthTracker::new(
            HealthConfig { degrade_threshold },
            clock.clone() as Arc<dyn Clock>,
        ));
        let credentials = Arc::new(MemoryCredentials::new());
        let engine = DeliveryEngine::new(
            storage.clone(),
            config,
            health.clone(),
            Arc::new(TargetDirectory::new()),
            credentials.clone(),
            clock.clone() as Arc<dyn Clock>,
        )
        .unwrap();

        Harness { storage, clock, health, credentials, engine }
    }

    fn binding_to(server_url: &str) -> NewBinding {
        NewBinding {
            source_id: "stats".to_string(),
            target_id: "t1".to_string(),
            endpoint_id: "e1".to_string(),
            endpoint_url: format!("{server_url}/hook"),
            endpoint_name: "alerts".to_string(),
            ..Default::default()
        }
    }

    async fn enqueue(h: &Harness) -> courier_core::ItemId {
        h.storage
            .queue
            .enqueue_targeted(
                "stats",
                "stats.updated",
                &serde_json::json!({"sessions": 3}),
                TriggerType::FileChange,
                "e1",
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn successful_delivery_records_destination() {
        let h = harness(3).await;
        let server = MockServer::start().await;
        Mock::given(method("POST")).respond_with(ResponseTemplate::new(200)).mount(&server).await;

        h.storage.bindings.upsert(binding_to(&server.uri())).await.unwrap();
        let item_id = enqueue(&h).await;

        assert_eq!(h.engine.process_batch().await.unwrap(), 1);

        let item = h.storage.queue.find(item_id).await.unwrap().unwrap();
        assert_eq!(item.status, DeliveryStatus::Delivered);
        assert!(item.delivered_at.is_some());
        let delivered_to = item.delivered_to.unwrap();
        assert_eq!(delivered_to.endpoint_id, "e1");
        assert_eq!(delivered_to.target_id, "t1");

        let stats = h.engine.stats().await;
        assert_eq!(stats.successful_deliveries, 1);
    }

    #[tokio::test]
    async fn auth_header_is_materialized_from_credential_store() {
        let h = harness(3).await;
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(header("authorization", "Bearer tok-1"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        h.credentials.store("binding:stats:e1", "Bearer tok-1").unwrap();
        let mut binding = binding_to(&server.uri());
        binding.auth_header_name = Some("Authorization".to_string());
        binding.auth_credential_key = Some("binding:stats:e1".to_string());
        h.storage.bindings.upsert(binding).await.unwrap();

        let item_id = enqueue(&h).await;
        h.engine.process_batch().await.unwrap();

        let item = h.storage.queue.find(item_id).await.unwrap().unwrap();
        assert_eq!(item.status, DeliveryStatus::Delivered);
    }

    #[tokio::test]
    async fn repeated_failures_walk_backoff_then_dead_letter() {
        // Threshold high enough that health never interferes with the
        // retry walk
        let h = harness(100).await;
        let server = MockServer::start().await;
        Mock::given(method("POST")).respond_with(ResponseTemplate::new(500)).mount(&server).await;

        h.storage.bindings.upsert(binding_to(&server.uri())).await.unwrap();
        let item_id = enqueue(&h).await;

        for attempt in 1..=5u32 {
            assert_eq!(h.engine.process_batch().await.unwrap(), 1, "attempt {attempt}");
            h.clock.advance(Duration::from_secs(7200));
        }

        let item = h.storage.queue.find(item_id).await.unwrap().unwrap();
        assert_eq!(item.status, DeliveryStatus::Dlq);
        assert_eq!(item.retry_count, 5);

        let history = h.storage.queue.retry_history(item_id).await.unwrap();
        assert_eq!(history.len(), 5);
        assert!(history[0].error.contains("500"));

        // Nothing left to claim
        assert_eq!(h.engine.process_batch().await.unwrap(), 0);
        let stats = h.engine.stats().await;
        assert_eq!(stats.failed_deliveries, 4);
        assert_eq!(stats.dead_lettered, 1);
    }

    #[tokio::test]
    async fn backoff_gates_the_next_attempt() {
        let h = harness(100).await;
        let server = MockServer::start().await;
        Mock::given(method("POST")).respond_with(ResponseTemplate::new(500)).mount(&server).await;

        h.storage.bindings.upsert(binding_to(&server.uri())).await.unwrap();
        let item_id = enqueue(&h).await;

        h.engine.process_batch().await.unwrap();

        // First backoff is 2s; the item must not be claimable before then
        assert_eq!(h.engine.process_batch().await.unwrap(), 0);
        h.clock.advance(Duration::from_secs(3));
        assert_eq!(h.engine.process_batch().await.unwrap(), 1);

        let item = h.storage.queue.find(item_id).await.unwrap().unwrap();
        assert_eq!(item.retry_count, 2);
    }

    #[tokio::test]
    async fn degraded_target_parks_items_without_consuming_retries() {
        let h = harness(3).await;
        let server = MockServer::start().await;
        // Endpoint would accept, but the attempt must never be made
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        h.storage.bindings.upsert(binding_to(&server.uri())).await.unwrap();
        h.health.report_failure("t1", FailureClass::Auth, "HTTP 401");

        let item_id = enqueue(&h).await;
        h.engine.process_batch().await.unwrap();

        let item = h.storage.queue.find(item_id).await.unwrap().unwrap();
        assert_eq!(item.status, DeliveryStatus::TargetPaused);
        assert_eq!(item.retry_count, 0);
        assert!(item.last_error.unwrap().contains("degraded"));
    }

    #[tokio::test]
    async fn auth_rejection_degrades_target_and_parks_backlog() {
        let h = harness(3).await;
        let server = MockServer::start().await;
        Mock::given(method("POST")).respond_with(ResponseTemplate::new(401)).mount(&server).await;

        h.storage.bindings.upsert(binding_to(&server.uri())).await.unwrap();
        let first = enqueue(&h).await;
        let second = enqueue(&h).await;

        h.engine.process_batch().await.unwrap();

        // First attempt hit the 401 and consumed a retry; the second item
        // was parked by the claim-time degraded check
        let first = h.storage.queue.find(first).await.unwrap().unwrap();
        assert_eq!(first.status, DeliveryStatus::Failed);
        assert_eq!(first.retry_count, 1);

        let second = h.storage.queue.find(second).await.unwrap().unwrap();
        assert_eq!(second.status, DeliveryStatus::TargetPaused);
        assert_eq!(second.retry_count, 0);

        assert!(h.health.is_degraded("t1").is_some());
    }

    #[tokio::test]
    async fn degrading_failure_parks_pending_backlog_but_not_itself() {
        let config = DeliveryConfig {
            batch_size: 1,
            retry_policy: RetryPolicy { jitter_factor: 0.0, ..Default::default() },
            ..Default::default()
        };
        let h = harness_with(config, 3).await;
        let server = MockServer::start().await;
        Mock::given(method("POST")).respond_with(ResponseTemplate::new(401)).mount(&server).await;

        h.storage.bindings.upsert(binding_to(&server.uri())).await.unwrap();
        let trigger = enqueue(&h).await;
        let backlog = enqueue(&h).await;

        // One-item batch: only the trigger is claimed. The 401 degrades the
        // target and the sweep parks the still-pending backlog item.
        h.engine.process_batch().await.unwrap();

        let trigger = h.storage.queue.find(trigger).await.unwrap().unwrap();
        assert_eq!(trigger.status, DeliveryStatus::Failed);
        assert_eq!(trigger.retry_count, 1);

        let backlog = h.storage.queue.find(backlog).await.unwrap().unwrap();
        assert_eq!(backlog.status, DeliveryStatus::TargetPaused);
        assert_eq!(backlog.retry_count, 0);
    }

    #[tokio::test]
    async fn missing_credential_fails_fast_without_degrading_target() {
        let h = harness(3).await;
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let mut binding = binding_to(&server.uri());
        binding.auth_header_name = Some("Authorization".to_string());
        h.storage.bindings.upsert(binding).await.unwrap();

        let item_id = enqueue(&h).await;
        h.engine.process_batch().await.unwrap();

        let item = h.storage.queue.find(item_id).await.unwrap().unwrap();
        assert_eq!(item.status, DeliveryStatus::Failed);
        assert!(item.last_error.unwrap().contains("no credential"));
        assert!(h.health.is_degraded("t1").is_none());
    }

    #[tokio::test]
    async fn item_without_binding_is_released_not_failed() {
        let h = harness(3).await;
        let item_id = enqueue(&h).await;

        h.engine.process_batch().await.unwrap();

        let item = h.storage.queue.find(item_id).await.unwrap().unwrap();
        assert_eq!(item.status, DeliveryStatus::Pending);
        assert_eq!(item.retry_count, 0);
    }

    #[tokio::test]
    async fn rate_limit_retry_after_overrides_backoff() {
        let h = harness(100).await;
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "600"))
            .mount(&server)
            .await;

        h.storage.bindings.upsert(binding_to(&server.uri())).await.unwrap();
        let item_id = enqueue(&h).await;

        h.engine.process_batch().await.unwrap();

        // Policy backoff for attempt 1 would be 2s; Retry-After says 600s
        h.clock.advance(Duration::from_secs(60));
        assert_eq!(h.engine.process_batch().await.unwrap(), 0);
        h.clock.advance(Duration::from_secs(600));
        assert_eq!(h.engine.process_batch().await.unwrap(), 1);

        let item = h.storage.queue.find(item_id).await.unwrap().unwrap();
        assert_eq!(item.retry_count, 2);
    }

    #[tokio::test]
    async fn engine_start_recovers_orphans_and_shuts_down() {
        let mut h = harness(3).await;
        let item_id = enqueue(&h).await;

        // Simulate a crash: item claimed long ago, never resolved
        h.storage.queue.claim_batch(10).await.unwrap();
        h.clock.advance(Duration::from_secs(600));

        h.engine.start().await.unwrap();
        h.engine.shutdown().await.unwrap();

        // Workers may have re-claimed and released the item (it has no
        // binding), so only the recovery marker is stable to assert on
        let item = h.storage.queue.find(item_id).await.unwrap().unwrap();
        assert!(item.last_error.unwrap().contains("recovered after restart"));
        assert_ne!(item.status, DeliveryStatus::InFlight);
    }
}
