//! Error types for delivery operations.
//!
//! Classifies every way an attempt can fail. Note that per the state
//! machine, 4xx responses still walk the retry/backoff path: the engine
//! cannot reliably tell a permanent rejection from a transient one by status
//! code alone, so the richer classification lives in [`crate::diagnose`]
//! and only the attempt bound ends the retries.

use std::time::Duration;

use thiserror::Error;

/// Result type alias using `DeliveryError`.
pub type Result<T> = std::result::Result<T, DeliveryError>;

/// Errors that can occur during delivery processing.
#[derive(Debug, Error)]
pub enum DeliveryError {
    /// Network-level failure (DNS, connect, TLS, reset).
    #[error("network error: {message}")]
    Network {
        /// Description of the network failure.
        message: String,
    },

    /// The attempt exceeded its bounded timeout.
    #[error("delivery timeout after {seconds}s")]
    Timeout {
        /// Timeout that was exceeded, in seconds.
        seconds: u64,
    },

    /// HTTP 4xx response from the endpoint.
    #[error("endpoint rejected delivery: HTTP {status}: {message}")]
    EndpointRejected {
        /// HTTP status code.
        status: u16,
        /// Response body snippet or status text.
        message: String,
    },

    /// HTTP 5xx response from the endpoint.
    #[error("endpoint failed: HTTP {status}")]
    EndpointFailed {
        /// HTTP status code.
        status: u16,
    },

    /// HTTP 429 with optional Retry-After.
    #[error("rate limited by endpoint")]
    RateLimited {
        /// Seconds to wait, when the endpoint said so.
        retry_after_seconds: Option<u64>,
    },

    /// The item's target is degraded; the attempt was never made.
    #[error("target {target_id} is degraded: {reason}")]
    TargetDegraded {
        /// Target that is degraded.
        target_id: String,
        /// Why it was degraded.
        reason: String,
    },

    /// The binding or credential configuration made the attempt impossible.
    #[error("configuration error: {message}")]
    Configuration {
        /// What is misconfigured.
        message: String,
    },

    /// Storage failure. Always propagated; silent loss would break the
    /// guaranteed-delivery contract.
    #[error("storage error: {0}")]
    Storage(#[from] courier_core::CoreError),

    /// Worker shutdown was requested mid-batch.
    #[error("shutdown requested")]
    ShutdownRequested,

    /// A worker task panicked.
    #[error("worker {worker_id} panicked: {message}")]
    WorkerPanic {
        /// Worker that panicked.
        worker_id: usize,
        /// Panic description.
        message: String,
    },

    /// Graceful shutdown exceeded its deadline.
    #[error("shutdown timed out after {timeout:?}")]
    ShutdownTimeout {
        /// The deadline that was exceeded.
        timeout: Duration,
    },
}

impl DeliveryError {
    /// Creates a network error.
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network { message: message.into() }
    }

    /// Creates a timeout error.
    pub fn timeout(seconds: u64) -> Self {
        Self::Timeout { seconds }
    }

    /// Creates a 4xx rejection error.
    pub fn endpoint_rejected(status: u16, message: impl Into<String>) -> Self {
        Self::EndpointRejected { status, message: message.into() }
    }

    /// Creates a 5xx failure error.
    pub fn endpoint_failed(status: u16) -> Self {
        Self::EndpointFailed { status }
    }

    /// Creates a rate-limited error.
    pub fn rate_limited(retry_after_seconds: Option<u64>) -> Self {
        Self::RateLimited { retry_after_seconds }
    }

    /// Creates a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration { message: message.into() }
    }

    /// HTTP status code of the failure, when one was received.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::EndpointRejected { status, .. } | Self::EndpointFailed { status } => {
                Some(*status)
            },
            Self::RateLimited { .. } => Some(429),
            _ => None,
        }
    }

    /// Retry-After hint in seconds, for rate-limited failures.
    pub fn retry_after_seconds(&self) -> Option<u64> {
        match self {
            Self::RateLimited { retry_after_seconds } => *retry_after_seconds,
            _ => None,
        }
    }

    /// True for auth-class rejections (401/403), which degrade a target
    /// immediately.
    pub fn is_auth_failure(&self) -> bool {
        matches!(self.status_code(), Some(401 | 403))
    }

    /// True for failures that count toward a target's consecutive-failure
    /// degradation threshold.
    ///
    /// Configuration and storage problems are ours, not the target's, so
    /// they never degrade target health.
    pub fn counts_against_target(&self) -> bool {
        matches!(
            self,
            Self::Network { .. }
                | Self::Timeout { .. }
                | Self::EndpointRejected { .. }
                | Self::EndpointFailed { .. }
                | Self::RateLimited { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_are_extracted() {
        assert_eq!(DeliveryError::endpoint_rejected(404, "gone").status_code(), Some(404));
        assert_eq!(DeliveryError::endpoint_failed(503).status_code(), Some(503));
        assert_eq!(DeliveryError::rate_limited(Some(60)).status_code(), Some(429));
        assert_eq!(DeliveryError::timeout(30).status_code(), None);
    }

    #[test]
    fn auth_failures_are_classified() {
        assert!(DeliveryError::endpoint_rejected(401, "unauthorized").is_auth_failure());
        assert!(DeliveryError::endpoint_rejected(403, "forbidden").is_auth_failure());
        assert!(!DeliveryError::endpoint_rejected(404, "not found").is_auth_failure());
        assert!(!DeliveryError::endpoint_failed(500).is_auth_failure());
    }

    #[test]
    fn configuration_errors_spare_target_health() {
        assert!(!DeliveryError::configuration("no credential").counts_against_target());
        assert!(DeliveryError::network("refused").counts_against_target());
        assert!(DeliveryError::timeout(10).counts_against_target());
    }

    #[test]
    fn retry_after_only_on_rate_limits() {
        assert_eq!(DeliveryError::rate_limited(Some(120)).retry_after_seconds(), Some(120));
        assert_eq!(DeliveryError::rate_limited(None).retry_after_seconds(), None);
        assert_eq!(DeliveryError::endpoint_failed(500).retry_after_seconds(), None);
    }
}
