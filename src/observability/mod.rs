//! Logging and metrics.
//!
//! Provides:
//! - Structured tracing via tracing-subscriber
//! - OpenTelemetry counters for commits, notifications and yield points

pub mod metrics;
pub mod tracing;
