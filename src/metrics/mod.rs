//! Metrics aggregation

pub mod aggregator;

pub use aggregator::{MetricsAggregator, MetricsSnapshot};
