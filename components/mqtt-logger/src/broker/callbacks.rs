// Local crates
use crate::broker::dispatcher::Dispatcher;
use crate::broker::error::BrokerError;
use crate::logger::logger::{LogSink, Severity};
use crate::metrics::metrics::CONNECTION_LOST_TOTAL;

// External crates
use rumqttc::{Publish, QoS};
use std::sync::Arc;

/// Outcome of a broker operation as seen by a result listener.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Token {
    /// Packet identifier of the operation, 0 when there is none.
    pub message_id: u16,
    /// Topics the operation was about, possibly empty.
    pub topics: Vec<String>,
}

impl Token {
    /// Token for packet `message_id` concerning `topics`.
    pub fn new(message_id: u16, topics: Vec<String>) -> Self {
        Self { message_id, topics }
    }
}

/// Result listener that only logs. Performs no retry.
pub struct ActionLogger {
    name: String,
    sink: Arc<dyn LogSink>,
}

impl std::fmt::Debug for ActionLogger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionLogger")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl ActionLogger {
    /// A listener reporting as `name`, e.g. `Subscribe`.
    pub fn new(name: impl Into<String>, sink: Arc<dyn LogSink>) -> Self {
        Self {
            name: name.into(),
            sink,
        }
    }

    /// Log a successful operation: the token id when present, then the first
    /// acknowledged topic when present.
    pub fn on_success(&self, token: &Token) {
        if token.message_id != 0 {
            self.sink.log(
                Severity::Info,
                &format!("{} success for token: [{}]", self.name, token.message_id),
            );
        }
        if let Some(topic) = token.topics.first() {
            self.sink.log(
                Severity::Info,
                &format!("{} success for topic: [{}]", self.name, topic),
            );
        }
    }

    /// Log a failed operation, naming the token id when there is one.
    pub fn on_failure(&self, token: &Token) {
        let line = if token.message_id != 0 {
            format!("{} failure for token: [{}]", self.name, token.message_id)
        } else {
            format!("{} failure", self.name)
        };
        self.sink.log(Severity::Error, &line);
    }
}

/// The one request the lifecycle handler makes of the MQTT client.
///
/// Implementations must not wait for the broker: they are called from the
/// session task that drives the network connection.
pub trait SubscribeClient: Send + Sync {
    /// Queue a subscribe request for `topic` at `qos`.
    fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), BrokerError>;
}

/// Reacts to lifecycle events of the MQTT session and routes delivered
/// messages to the [`Dispatcher`].
///
/// Keeps no state across events beyond its configuration.
pub struct Callbacks {
    client: Arc<dyn SubscribeClient>,
    topic: String,
    qos: QoS,
    sink: Arc<dyn LogSink>,
    dispatcher: Dispatcher,
    subscribe_logger: ActionLogger,
}

impl std::fmt::Debug for Callbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Callbacks")
            .field("topic", &self.topic)
            .field("qos", &self.qos)
            .field("dispatcher", &self.dispatcher)
            .finish_non_exhaustive()
    }
}

impl Callbacks {
    /// Build the handler subscribing to `topic` at `qos` after every connect.
    pub fn new(
        client: Arc<dyn SubscribeClient>,
        topic: impl Into<String>,
        qos: QoS,
        sink: Arc<dyn LogSink>,
        dispatcher: Dispatcher,
    ) -> Self {
        let subscribe_logger = ActionLogger::new("Subscribe", Arc::clone(&sink));
        Self {
            client,
            topic: topic.into(),
            qos,
            sink,
            dispatcher,
            subscribe_logger,
        }
    }

    /// Topic filter subscribed after each connect.
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// The listener receiving subscribe acknowledgements.
    #[must_use]
    pub fn subscribe_logger(&self) -> &ActionLogger {
        &self.subscribe_logger
    }

    /// The connection was (re-)established: log it and subscribe again.
    pub fn connected(&self, cause: &str) {
        self.sink
            .log(Severity::Info, &format!("Connected to MQTT broker '{cause}'"));
        self.sink.log(
            Severity::Info,
            &format!("Subscribing to topic '{}'", self.topic),
        );
        if let Err(e) = self.client.subscribe(&self.topic, self.qos) {
            self.sink
                .log(Severity::Error, &format!("MQTT subscribe failed: {e}"));
        }
    }

    /// The connection dropped. Reconnecting is the session's business.
    pub fn connection_lost(&self, cause: &str) {
        CONNECTION_LOST_TOTAL.inc();
        self.sink
            .log(Severity::Error, &format!("MQTT connection lost: {cause}"));
    }

    /// The initial connect attempt failed.
    pub fn on_connect_failure(&self, reason: &str) {
        self.sink.log(
            Severity::Error,
            &format!("MQTT connection attempt failed: {reason}"),
        );
    }

    /// A message was delivered.
    pub fn message_arrived(&self, message: Option<&Publish>) {
        self.dispatcher.message_arrived(message);
    }
}
