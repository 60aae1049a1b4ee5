//! # Flowmem Telemetry
//!
//! Log subscriber setup and Prometheus usage metrics for the allocators.

pub mod logging;
pub mod metrics;

pub use logging::EventLogger;
pub use metrics::{Component, MetricsRecorder};
