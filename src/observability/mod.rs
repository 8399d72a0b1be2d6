//! Observability — dispatch metrics

pub mod metrics;

pub use metrics::{DispatchMetrics, MetricsSnapshot, QueueWaitHistogram};
