//! MQTT side: session, lifecycle callbacks, message dispatch.

/// Broker address parsing.
pub mod address;
/// Lifecycle callbacks and result listeners.
pub mod callbacks;
/// Delivered message to pool task.
pub mod dispatcher;
/// Broker errors.
pub mod error;
/// MQTT client session and event routing.
pub mod session;
