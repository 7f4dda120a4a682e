//! Where log lines end up.

/// Syslog facility names.
pub mod facility;
/// Syslog and console sinks.
pub mod logger;
