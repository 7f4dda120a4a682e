//! Process plumbing.

/// Configuration file and settings resolution.
pub mod load_config;
/// Process-wide stop flag.
pub mod shutdown;
/// SIGINT/SIGTERM listener.
pub mod signals;
