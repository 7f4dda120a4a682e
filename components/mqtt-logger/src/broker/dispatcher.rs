// Local crates
use crate::logger::logger::{LogSink, Severity};
use crate::metrics::metrics::MESSAGES_RECEIVED_TOTAL;
use crate::pool::worker_pool::WorkerPool;

// External crates
use bytes::Bytes;
use rumqttc::Publish;
use std::sync::Arc;

/// Immutable snapshot of one delivered message, waiting to be logged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageTask {
    /// Topic the message was published on.
    pub topic: String,
    /// Delivery QoS level, 0, 1 or 2.
    pub qos: u8,
    /// Whether the broker flagged the message as retained.
    pub retained: bool,
    /// Raw payload, assumed to be text.
    pub payload: Bytes,
}

impl MessageTask {
    /// Copy the loggable parts out of a delivered publish packet.
    ///
    /// The payload is reference counted, no bytes are copied.
    #[must_use]
    pub fn snapshot(message: &Publish) -> Self {
        Self {
            topic: message.topic.clone(),
            qos: message.qos as u8,
            retained: message.retain,
            payload: message.payload.clone(),
        }
    }

    /// The single log line for this message. Non UTF-8 payload bytes are
    /// replaced, never rejected.
    #[must_use]
    pub fn render(&self) -> String {
        format!(
            "topic='{}', qos='{}', retained='{}', msg='{}'",
            self.topic,
            self.qos,
            self.retained,
            String::from_utf8_lossy(&self.payload)
        )
    }

    /// Task body: render and hand the line to `sink`.
    pub fn run(&self, sink: &dyn LogSink) {
        sink.log(Severity::Info, &self.render());
    }
}

/// Message-arrived handler, invoked on the MQTT session task for every
/// delivered message.
///
/// Does no formatting or I/O itself: it snapshots the message and queues the
/// work on the [`WorkerPool`].
#[derive(Clone)]
pub struct Dispatcher {
    pool: Arc<WorkerPool>,
    sink: Arc<dyn LogSink>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("pool", &self.pool)
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    /// Dispatch delivered messages onto `pool`, logging them to `sink`.
    pub fn new(pool: Arc<WorkerPool>, sink: Arc<dyn LogSink>) -> Self {
        Self { pool, sink }
    }

    /// Queue one delivered message for logging. `None` is ignored.
    pub fn message_arrived(&self, message: Option<&Publish>) {
        let Some(message) = message else {
            return;
        };
        MESSAGES_RECEIVED_TOTAL.inc();

        let task = MessageTask::snapshot(message);
        let sink = Arc::clone(&self.sink);
        if let Err(e) = self.pool.enqueue(move || task.run(sink.as_ref())) {
            tracing::warn!(
                topic = %message.topic,
                error = %e,
                "Delivered message not queued for logging"
            );
        }
    }
}
