//! Service facade and configuration for the Courier delivery pipeline.
//!
//! Hosts embed the pipeline through two types: [`Config`], loaded from
//! defaults, `courier.toml`, and `COURIER_`-prefixed environment
//! variables, and [`PipelineService`], the command/query surface over
//! storage, target health, and the scheduler.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod service;

pub use config::Config;
pub use service::{
    DeliveryStatusSummary, OverallStatus, PipelineService, PushReceipt, ReconnectOutcome,
    ServiceError, TargetHealthReport,
};
