//! Collaborator traits at the engine boundary.
//!
//! Sources produce payload snapshots, targets receive them, and the
//! credential store holds secrets the engine only ever references by key.
//! The engine depends on these traits alone; concrete watchers, target
//! adapters, and secret stores live with the host application.

use async_trait::async_trait;
use thiserror::Error;

/// Error produced by a target adapter.
#[derive(Debug, Clone, Error)]
pub enum TargetError {
    /// Could not reach the target at all.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// The stored token was rejected as expired.
    #[error("token expired")]
    TokenExpired,

    /// Authentication was rejected for another reason.
    #[error("authentication failed: {0}")]
    AuthFailed(String),

    /// The target accepted the connection but the delivery failed.
    #[error("delivery failed: {0}")]
    DeliveryFailed(String),

    /// The target configuration is unusable.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The target was never connected.
    #[error("target not connected")]
    NotConnected,
}

impl TargetError {
    /// True for auth-class failures that degrade a target immediately and
    /// mean a reconnect will need re-authentication.
    pub fn is_auth(&self) -> bool {
        matches!(self, Self::TokenExpired | Self::AuthFailed(_))
    }

    /// True for failures that count toward the consecutive-failure
    /// degradation threshold.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::ConnectionFailed(_) | Self::DeliveryFailed(_))
    }
}

/// Descriptive metadata about a connected target.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct TargetInfo {
    /// Stable target identifier.
    pub id: String,
    /// Human-readable name.
    pub name: String,
    /// Target kind (webhook, automation platform, notification service).
    pub target_type: String,
    /// Base URL of the target.
    pub base_url: String,
}

/// One addressable endpoint within a target.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct TargetEndpoint {
    /// Endpoint identifier, unique within the target.
    pub id: String,
    /// Human-readable name.
    pub name: String,
    /// URL deliveries for this endpoint are sent to.
    pub url: String,
}

/// A connected remote system capable of receiving deliveries.
#[async_trait]
pub trait Target: Send + Sync {
    /// Stable target identifier.
    fn id(&self) -> &str;

    /// Human-readable name.
    fn name(&self) -> &str;

    /// Target kind.
    fn target_type(&self) -> &str;

    /// Base URL of the target.
    fn base_url(&self) -> &str;

    /// Lightweight connectivity probe, used by reconnect.
    async fn test_connection(&self) -> Result<(), TargetError>;

    /// Endpoints this target exposes.
    async fn list_endpoints(&self) -> Result<Vec<TargetEndpoint>, TargetError>;
}

/// Error produced by a source when a payload snapshot cannot be built.
#[derive(Debug, Clone, Error)]
pub enum SourceError {
    /// The backing data could not be read.
    #[error("source read failed: {0}")]
    Read(String),

    /// The backing data could not be parsed into a payload.
    #[error("source parse failed: {0}")]
    Parse(String),
}

/// A local data source the pipeline watches and pushes from.
pub trait Source: Send + Sync {
    /// Stable source identifier.
    fn id(&self) -> &str;

    /// Human-readable name.
    fn name(&self) -> &str;

    /// Semantic tag for payloads produced by this source.
    fn event_type(&self) -> &str;

    /// Builds a fresh payload snapshot from the current source state.
    fn snapshot(&self) -> Result<serde_json::Value, SourceError>;
}

/// Error produced by the credential store.
#[derive(Debug, Clone, Error)]
pub enum CredentialError {
    /// No secret stored under the requested key.
    #[error("credential not found: {0}")]
    NotFound(String),

    /// The platform secret store denied access.
    #[error("credential store access denied: {0}")]
    AccessDenied(String),

    /// Any other storage failure.
    #[error("credential store error: {0}")]
    Storage(String),
}

/// Opaque key-to-secret store. The engine resolves credentials once per
/// delivery attempt and never persists secret values itself.
pub trait CredentialStore: Send + Sync {
    /// Stores a secret under a key, replacing any previous value.
    fn store(&self, key: &str, secret: &str) -> Result<(), CredentialError>;

    /// Retrieves the secret stored under a key.
    fn retrieve(&self, key: &str) -> Result<String, CredentialError>;

    /// Deletes the secret stored under a key.
    fn delete(&self, key: &str) -> Result<(), CredentialError>;

    /// True when a secret exists under the key.
    fn exists(&self, key: &str) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_errors_are_classified() {
        assert!(TargetError::TokenExpired.is_auth());
        assert!(TargetError::AuthFailed("revoked".into()).is_auth());
        assert!(!TargetError::ConnectionFailed("refused".into()).is_auth());
        assert!(!TargetError::NotConnected.is_auth());
    }

    #[test]
    fn transient_errors_are_classified() {
        assert!(TargetError::ConnectionFailed("refused".into()).is_transient());
        assert!(TargetError::DeliveryFailed("500".into()).is_transient());
        assert!(!TargetError::InvalidConfig("bad url".into()).is_transient());
        assert!(!TargetError::TokenExpired.is_transient());
    }
}
