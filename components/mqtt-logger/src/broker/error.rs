// External crates
use std::time::Duration;
use thiserror::Error;

/// Failures of the MQTT session.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// The broker address could not be parsed.
    #[error("invalid broker address '{address}': {reason}")]
    InvalidAddress {
        /// The address as given.
        address: String,
        /// What is wrong with it.
        reason: &'static str,
    },

    /// The broker did not acknowledge the initial connect in time.
    #[error("timed out connecting to broker after {0:?}")]
    ConnectTimeout(Duration),

    /// The initial connect failed (refused, unreachable, protocol error).
    #[error("error connecting to broker: {0}")]
    Connect(#[from] rumqttc::ConnectionError),

    /// A request could not be handed to the MQTT event loop.
    #[error("MQTT client request failed: {0}")]
    Request(#[from] rumqttc::ClientError),

    /// A subscribe request was refused before reaching the broker.
    #[error("subscribe request for '{topic}' rejected: {reason}")]
    SubscribeRejected {
        /// Topic filter of the refused request.
        topic: String,
        /// Why it was refused.
        reason: String,
    },
}
