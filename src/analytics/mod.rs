//! Analytics sidecar: aggregation of tapped traffic and delivery to
//! the collector.

pub mod api;
pub mod client;
pub mod convert;
pub mod fingerprint;
pub mod forwarder;

pub use client::{AnalyticsClient, AnalyticsClientConfig, MetricsSink};
pub use forwarder::{AnalyticsForwarder, ForwarderSettings};
