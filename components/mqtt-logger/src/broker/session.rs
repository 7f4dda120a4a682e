// Local crates
use crate::broker::{
    address::BrokerAddress,
    callbacks::{Callbacks, SubscribeClient, Token},
    error::BrokerError,
};

// External crates
use rumqttc::{
    AsyncClient, ConnectionError, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS,
    SubscribeReasonCode,
};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

/// Delay between reconnect attempts: starts at `min`, doubles per failure up
/// to `max`, and resets after a successful connect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// First delay after a lost connection.
    pub min: Duration,
    /// Upper bound of the delay.
    pub max: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            min: Duration::from_secs(1),
            max: Duration::from_secs(2),
        }
    }
}

impl ReconnectPolicy {
    /// Delay to use after `current` did not lead to a connection.
    #[must_use]
    pub fn next(&self, current: Duration) -> Duration {
        current.saturating_mul(2).clamp(self.min, self.max.max(self.min))
    }
}

/// Everything needed to open the MQTT session.
#[derive(Clone)]
pub struct SessionOptions {
    /// Where the broker listens.
    pub address: BrokerAddress,
    /// MQTT client identifier.
    pub client_id: String,
    /// Optional user name.
    pub username: Option<String>,
    /// Optional password.
    pub password: Option<String>,
    /// Keep-alive interval announced to the broker.
    pub keep_alive: Duration,
    /// Ask the broker to discard any previous session state.
    pub clean_session: bool,
    /// Bound on the initial connect.
    pub connect_timeout: Duration,
    /// Bound on the disconnect during shutdown.
    pub disconnect_timeout: Duration,
    /// Back-off between reconnect attempts.
    pub reconnect: ReconnectPolicy,
    /// Capacity of the client-to-event-loop request channel.
    pub request_capacity: usize,
}

impl std::fmt::Debug for SessionOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionOptions")
            .field("address", &self.address)
            .field("client_id", &self.client_id)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("keep_alive", &self.keep_alive)
            .field("clean_session", &self.clean_session)
            .field("connect_timeout", &self.connect_timeout)
            .field("disconnect_timeout", &self.disconnect_timeout)
            .field("reconnect", &self.reconnect)
            .field("request_capacity", &self.request_capacity)
            .finish()
    }
}

impl SessionOptions {
    fn mqtt_options(&self) -> MqttOptions {
        let mut options = MqttOptions::new(
            self.client_id.clone(),
            self.address.host.clone(),
            self.address.port,
        );
        options
            .set_keep_alive(self.keep_alive)
            .set_clean_session(self.clean_session);

        if self.username.is_some() || self.password.is_some() {
            options.set_credentials(
                self.username.clone().unwrap_or_default(),
                self.password.clone().unwrap_or_default(),
            );
        }
        options
    }
}

#[derive(Debug, Default)]
struct LedgerState {
    requested: VecDeque<String>,
    in_flight: HashMap<u16, String>,
}

/// Matches subscribe acknowledgements back to the topic that was requested.
///
/// The client hands out packet ids only once the request reaches the event
/// loop, so topics are queued at request time and bound to their id when the
/// outgoing subscribe is observed. Requests are processed in order.
#[derive(Debug, Default)]
pub struct SubscriptionLedger {
    state: Mutex<LedgerState>,
}

impl SubscriptionLedger {
    fn lock(&self) -> MutexGuard<'_, LedgerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// A subscribe request for `topic` was queued.
    pub fn requested(&self, topic: &str) {
        self.lock().requested.push_back(topic.to_string());
    }

    /// The most recent request never reached the event loop.
    pub fn withdraw_last(&self) {
        self.lock().requested.pop_back();
    }

    /// The oldest queued request went out as packet `pkid`.
    pub fn sent(&self, pkid: u16) {
        let mut state = self.lock();
        if let Some(topic) = state.requested.pop_front() {
            state.in_flight.insert(pkid, topic);
        }
    }

    /// Packet `pkid` was acknowledged; returns the topic it concerned.
    pub fn acknowledged(&self, pkid: u16) -> Option<String> {
        self.lock().in_flight.remove(&pkid)
    }

    /// Forget everything; in-flight requests die with the connection.
    pub fn clear(&self) {
        let mut state = self.lock();
        state.requested.clear();
        state.in_flight.clear();
    }
}

/// [`SubscribeClient`] backed by the `rumqttc` client.
#[derive(Debug, Clone)]
pub struct MqttSubscriber {
    client: AsyncClient,
    ledger: Arc<SubscriptionLedger>,
}

impl MqttSubscriber {
    /// Subscribe through `client`, recording requests in `ledger`.
    pub fn new(client: AsyncClient, ledger: Arc<SubscriptionLedger>) -> Self {
        Self { client, ledger }
    }
}

impl SubscribeClient for MqttSubscriber {
    fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), BrokerError> {
        self.ledger.requested(topic);
        // try_subscribe never waits, the caller is the task polling the event loop.
        self.client.try_subscribe(topic, qos).map_err(|e| {
            self.ledger.withdraw_last();
            BrokerError::Request(e)
        })
    }
}

/// What the session loop should do after an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Keep polling.
    Continue,
    /// The connection was acknowledged by the broker.
    Connected,
    /// Our disconnect went out, stop polling.
    Disconnected,
}

/// Translates client events into lifecycle callbacks.
#[derive(Debug)]
pub struct EventRouter {
    callbacks: Callbacks,
    ledger: Arc<SubscriptionLedger>,
    connects: u64,
    online: bool,
}

impl EventRouter {
    /// Route events to `callbacks`, matching subscribe results via `ledger`.
    pub fn new(callbacks: Callbacks, ledger: Arc<SubscriptionLedger>) -> Self {
        Self {
            callbacks,
            ledger,
            connects: 0,
            online: false,
        }
    }

    /// The lifecycle handler events are routed to.
    #[must_use]
    pub fn callbacks(&self) -> &Callbacks {
        &self.callbacks
    }

    /// Handle one event produced by the event loop.
    pub fn handle(&mut self, event: Event) -> Flow {
        match event {
            Event::Incoming(Packet::Publish(message)) => {
                self.callbacks.message_arrived(Some(&message));
                Flow::Continue
            }
            Event::Incoming(Packet::ConnAck(_)) => {
                let cause = if self.connects == 0 {
                    "initial connect"
                } else {
                    "automatic reconnect"
                };
                self.connects += 1;
                self.online = true;
                self.callbacks.connected(cause);
                Flow::Connected
            }
            Event::Incoming(Packet::SubAck(ack)) => {
                let topics = self.ledger.acknowledged(ack.pkid).into_iter().collect();
                let token = Token::new(ack.pkid, topics);
                let granted = !ack.return_codes.is_empty()
                    && ack
                        .return_codes
                        .iter()
                        .all(|code| matches!(code, SubscribeReasonCode::Success(_)));
                if granted {
                    self.callbacks.subscribe_logger().on_success(&token);
                } else {
                    self.callbacks.subscribe_logger().on_failure(&token);
                }
                Flow::Continue
            }
            Event::Outgoing(Outgoing::Subscribe(pkid)) => {
                self.ledger.sent(pkid);
                Flow::Continue
            }
            Event::Outgoing(Outgoing::Disconnect) => Flow::Disconnected,
            other => {
                tracing::trace!(event = ?other, "Unhandled MQTT event");
                Flow::Continue
            }
        }
    }

    /// The event loop reported an error after the session was established.
    ///
    /// Only the first error after a connect is reported as a lost connection;
    /// failed reconnect attempts are traced. Returns whether it was reported.
    pub fn connection_lost(&mut self, error: &ConnectionError) -> bool {
        self.ledger.clear();
        if !self.online {
            tracing::debug!(error = %error, "Reconnect attempt failed");
            return false;
        }
        self.online = false;
        self.callbacks.connection_lost(&error.to_string());
        true
    }

    /// The initial connect failed or timed out.
    pub fn connect_failed(&self, error: &BrokerError) {
        self.callbacks.on_connect_failure(&error.to_string());
    }
}

/// Owns the MQTT event loop, the only place network I/O happens.
pub struct Session {
    client: AsyncClient,
    eventloop: EventLoop,
    options: SessionOptions,
    ledger: Arc<SubscriptionLedger>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("address", &self.options.address)
            .field("client_id", &self.options.client_id)
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Create the client and its event loop. Nothing touches the network
    /// until [`Session::connect`].
    pub fn new(options: SessionOptions) -> Self {
        let (client, eventloop) =
            AsyncClient::new(options.mqtt_options(), options.request_capacity.max(1));
        Self {
            client,
            eventloop,
            options,
            ledger: Arc::new(SubscriptionLedger::default()),
        }
    }

    /// A [`SubscribeClient`] feeding this session.
    #[must_use]
    pub fn subscriber(&self) -> MqttSubscriber {
        MqttSubscriber::new(self.client.clone(), Arc::clone(&self.ledger))
    }

    /// The ledger shared with [`Session::subscriber`].
    #[must_use]
    pub fn ledger(&self) -> Arc<SubscriptionLedger> {
        Arc::clone(&self.ledger)
    }

    /// Handle used to request the disconnect at shutdown.
    #[must_use]
    pub fn client(&self) -> AsyncClient {
        self.client.clone()
    }

    /// Drive the event loop until the broker acknowledges the connection,
    /// bounded by the connect timeout. Failure is reported to the router and
    /// returned; there is no retry.
    #[instrument(
        name = "mqtt_session::connect",
        target = "broker::session",
        level = "debug",
        skip_all,
        fields(broker = %self.options.address)
    )]
    pub async fn connect(&mut self, router: &mut EventRouter) -> Result<(), BrokerError> {
        let timeout = self.options.connect_timeout;
        let eventloop = &mut self.eventloop;

        let outcome = tokio::time::timeout(timeout, async {
            loop {
                let event = eventloop.poll().await.map_err(BrokerError::Connect)?;
                if router.handle(event) == Flow::Connected {
                    return Ok::<(), BrokerError>(());
                }
            }
        })
        .await
        .unwrap_or(Err(BrokerError::ConnectTimeout(timeout)));

        if let Err(e) = &outcome {
            tracing::error!(error = %e, "Initial connect to MQTT broker failed");
            router.connect_failed(e);
        }
        outcome
    }

    /// Keep polling after the initial connect: route events, report lost
    /// connections and back off before the client reconnects on the next
    /// poll. Ends once our disconnect went out or `cancel` fires.
    #[instrument(
        name = "mqtt_session::run",
        target = "broker::session",
        level = "debug",
        skip_all,
        fields(broker = %self.options.address)
    )]
    pub async fn run(mut self, mut router: EventRouter, cancel: CancellationToken) {
        let policy = self.options.reconnect;
        let mut delay = policy.min;

        loop {
            let polled = tokio::select! {
                _ = cancel.cancelled() => break,
                polled = self.eventloop.poll() => polled,
            };

            match polled {
                Ok(event) => match router.handle(event) {
                    Flow::Disconnected => {
                        tracing::debug!("Disconnect sent, MQTT session ending");
                        break;
                    }
                    Flow::Connected => delay = policy.min,
                    Flow::Continue => {}
                },
                Err(e) => {
                    router.connection_lost(&e);
                    tracing::debug!(retry_in = ?delay, "Waiting before reconnecting");
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                    delay = policy.next(delay);
                }
            }
        }
    }
}
