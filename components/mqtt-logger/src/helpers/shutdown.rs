// External crates
use std::sync::Arc;
use tokio::sync::watch;
use tracing::instrument;

/// Process-wide stop request, passed explicitly to every component that sets
/// or observes it.
///
/// - `trigger()` is the only writer. It flips the flag once and wakes all
///   waiters; later calls change nothing.
/// - `wait()` checks the current value before sleeping, so a stop requested
///   before anyone waited is never missed.
///
/// Built on a `watch` channel holding the flag, so receivers created after
/// the trigger still observe it.
#[derive(Debug, Clone)]
pub struct Shutdown {
    tx: Arc<watch::Sender<bool>>,
}

impl Shutdown {
    /// Creates a new, untriggered shutdown context.
    #[instrument(
        name = "mqtt_logger_shutdown_channel",
        target = "helpers::shutdown",
        level = "trace"
    )]
    pub fn new() -> Self {
        tracing::trace!("Creating shutdown context");
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Request a stop. Returns `true` only for the call that performed the
    /// transition, every other call (repeated signals, other threads) gets
    /// `false`.
    pub fn trigger(&self) -> bool {
        let mut transitioned = false;
        self.tx.send_if_modified(|stopped| {
            if *stopped {
                false
            } else {
                *stopped = true;
                transitioned = true;
                true
            }
        });
        transitioned
    }

    /// Whether a stop has been requested.
    #[must_use]
    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolve once a stop has been requested.
    #[instrument(
        name = "mqtt_logger_shutdown_waiter",
        target = "helpers::shutdown",
        level = "trace",
        skip(self)
    )]
    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives in `self`, so this only returns once the flag is set.
        let _ = rx.wait_for(|stopped| *stopped).await;
        tracing::trace!("Stop request observed");
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}
