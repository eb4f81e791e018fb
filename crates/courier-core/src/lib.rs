//! Core domain models and storage for the Courier delivery pipeline.
//!
//! Provides strongly-typed domain primitives (delivery items, bindings,
//! status enums), the clock abstraction used for deterministic testing,
//! collaborator traits (sources, targets, credential store), and the
//! SQLite-backed storage layer that makes delivery crash-safe.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod models;
pub mod storage;
pub mod time;
pub mod traits;

pub use error::{CoreError, Result};
pub use models::{
    Binding, DeliveredTo, DeliveryItem, DeliveryMode, DeliveryStatus, ItemId, NewBinding,
    QueueStats, RetryLogEntry, TimelineGap, TriggerType,
};
pub use storage::Storage;
pub use time::{Clock, RealClock, TestClock};
pub use traits::{
    CredentialError, CredentialStore, Source, SourceError, Target, TargetEndpoint, TargetError,
    TargetInfo,
};
