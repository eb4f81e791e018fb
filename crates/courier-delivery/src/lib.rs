//! Delivery engine for the Courier pipeline.
//!
//! Implements the background half of the guaranteed-delivery contract:
//! workers claim ready items from the durable queue, resolve the binding,
//! materialize auth from the credential store, attempt HTTP delivery with a
//! bounded timeout, and apply the retry/backoff/DLQ state machine. A
//! per-target health tracker short-circuits attempts against degraded
//! targets, and the scheduler drives daily/weekly bindings and computes
//! timeline gaps.
//!
//! # Delivery lifecycle
//!
//! 1. **Claim** - a worker atomically claims a batch of ready items
//! 2. **Health check** - items for a degraded target are parked, not sent
//! 3. **HTTP attempt** - payload posted with binding headers and auth
//! 4. **Record** - delivered, or failed with backoff, or dead-lettered

pub mod client;
pub mod diagnose;
pub mod directory;
pub mod error;
pub mod health;
pub mod retry;
pub mod scheduler;
mod worker;
mod worker_pool;

pub use client::{ClientConfig, DeliveryClient, DeliveryRequest, DeliveryResponse};
pub use diagnose::{ErrorCategory, ErrorDiagnosis};
pub use directory::{SourceDirectory, TargetDirectory};
pub use error::{DeliveryError, Result};
pub use health::{DegradationInfo, FailureClass, HealthConfig, TargetHealthTracker};
pub use retry::{BackoffStrategy, RetryPolicy};
pub use scheduler::{Scheduler, SchedulerConfig};
pub use worker::{DeliveryConfig, DeliveryEngine, EngineStats};

/// Default number of concurrent delivery workers.
pub const DEFAULT_WORKER_COUNT: usize = 2;

/// Default batch size for claiming items from the queue.
pub const DEFAULT_BATCH_SIZE: usize = 10;

/// Default worker poll interval in seconds. The product promise is a first
/// attempt within five seconds of enqueue.
pub const DEFAULT_POLL_INTERVAL_SECONDS: u64 = 5;
