//! Process lifecycle.

/// Startup and ordered teardown.
pub mod runtime;
