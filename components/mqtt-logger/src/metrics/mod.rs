//! Prometheus metrics.

/// `/metrics` HTTP endpoint.
pub mod http;
/// Metric definitions.
pub mod metrics;
