//! Internal diagnostics.

pub mod tracing;
