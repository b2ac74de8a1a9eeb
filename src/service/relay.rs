//! Message relay: frame handling, subscription bookkeeping and fan-out.
//!
//! [`Relay`] owns every session and the destination table behind one
//! relay-wide lock. Mutations (connect, subscribe, unsubscribe, disconnect)
//! are serialized by that lock. A SEND snapshots the subscriber list and
//! their outboxes while holding it, releases it, and then writes to all
//! recipients concurrently, each write bounded by the configured timeout.
//! A subscriber added after the snapshot does not see that message.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use chrono::Utc;
use futures_util::future::join_all;
use tokio::sync::{Notify, RwLock};

use crate::config::RelaySettings;
use crate::domain::frame::DESTINATION_HEADER;
use crate::domain::{
    CloseReason, Command, Connection, ConnectionId, ConnectionState, DestinationSummary,
    DestinationTable, Frame, Outbound, Outbox,
};
use crate::error::{DeliveryError, ProtocolError};
use crate::telemetry::{EventKind, Recorder, TelemetryEvent};

/// Protocol version reported on CONNECTED frames.
const PROTOCOL_VERSION: &str = "1.2";

/// Timestamp layout of the `timestamp` header on MESSAGE frames.
const MESSAGE_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, Default)]
struct RelayState {
    connections: HashMap<ConnectionId, Connection>,
    destinations: DestinationTable,
}

/// Publish/subscribe relay over the text frame protocol.
///
/// Transport-agnostic: sessions are identified by [`ConnectionId`] and
/// written to through their [`Outbox`]. Create one per process with
/// [`Relay::new`] and call [`Relay::shutdown`] before exiting.
#[derive(Debug)]
pub struct Relay {
    state: RwLock<RelayState>,
    recorder: Arc<dyn Recorder>,
    settings: RelaySettings,
    accepting: AtomicBool,
    in_flight: AtomicUsize,
    drained: Notify,
}

/// One SEND's snapshot of its recipients.
struct FanOut<'a> {
    _guard: InFlightGuard<'a>,
    destination: String,
    frame: Arc<str>,
    recipients: Vec<(ConnectionId, Option<Outbox>)>,
}

/// Counts a fan-out as in flight until dropped.
struct InFlightGuard<'a>(&'a Relay);

impl<'a> InFlightGuard<'a> {
    fn new(relay: &'a Relay) -> Self {
        relay.in_flight.fetch_add(1, Ordering::AcqRel);
        Self(relay)
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        if self.0.in_flight.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.0.drained.notify_waiters();
        }
    }
}

impl Relay {
    /// Creates a relay with no sessions.
    #[must_use]
    pub fn new(settings: RelaySettings, recorder: Arc<dyn Recorder>) -> Self {
        Self {
            state: RwLock::new(RelayState::default()),
            recorder,
            settings,
            accepting: AtomicBool::new(true),
            in_flight: AtomicUsize::new(0),
            drained: Notify::new(),
        }
    }

    /// Returns the settings the relay was built with.
    #[must_use]
    pub const fn settings(&self) -> &RelaySettings {
        &self.settings
    }

    /// Returns `false` once [`Relay::shutdown`] has started.
    #[must_use]
    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::Acquire)
    }

    /// Registers a new session writing to `outbox` and returns its id.
    ///
    /// The session starts in [`ConnectionState::Connecting`]. When the relay
    /// is already shutting down, the session is registered and immediately
    /// asked to close.
    pub async fn handle_connect(&self, outbox: Outbox) -> ConnectionId {
        let id = ConnectionId::new();
        let mut connection = Connection::new(id, outbox);
        let mut state = self.state.write().await;
        // Checked under the lock so a racing shutdown either refuses this
        // session or finds it.
        let accepting = self.is_accepting();
        if !accepting {
            connection.set_state(ConnectionState::Closing);
            self.queue_close(&connection, CloseReason::Shutdown);
        }
        state.connections.insert(id, connection);
        drop(state);

        self.recorder
            .record(TelemetryEvent::new(EventKind::ConnectionOpen, id));
        tracing::debug!(connection_id = %id, accepting, "connection registered");
        id
    }

    /// Parses and applies one inbound frame from `id`.
    ///
    /// # Errors
    ///
    /// Returns a [`ProtocolError`] when the frame is malformed, arrives
    /// before CONNECT, carries a server-only command, or `id` is not a live
    /// session. Except for [`ProtocolError::UnknownConnection`], the session
    /// is sent an ERROR frame and asked to close; no other session and no
    /// destination is affected.
    pub async fn handle_frame(&self, id: ConnectionId, raw: &[u8]) -> Result<(), ProtocolError> {
        let frame = match Frame::parse(raw) {
            Ok(frame) => frame,
            Err(err) => return Err(self.reject(id, None, err).await),
        };

        match self.apply(id, &frame).await {
            Ok(Some(fan_out)) => {
                self.fan_out(id, fan_out).await;
                Ok(())
            }
            Ok(None) => Ok(()),
            Err(err) => Err(self.reject(id, Some(frame.command()), err).await),
        }
    }

    /// Removes `id` from every destination and from the relay.
    ///
    /// Emits `connection.close` with the session duration. Calling it for
    /// an unknown or already removed session does nothing.
    pub async fn handle_disconnect(&self, id: ConnectionId) {
        let removed = {
            let mut guard = self.state.write().await;
            let state = &mut *guard;
            state.connections.remove(&id).map(|mut connection| {
                let subscriptions = connection.take_subscriptions();
                state
                    .destinations
                    .remove_connection(subscriptions.iter().map(String::as_str), id);
                connection.set_state(ConnectionState::Closed);
                (connection, subscriptions.len())
            })
        };

        let Some((connection, dropped)) = removed else {
            return;
        };
        let duration = connection.elapsed();
        self.recorder.record(
            TelemetryEvent::new(EventKind::ConnectionClose, id).with_duration(duration),
        );
        tracing::debug!(
            connection_id = %id,
            subscriptions = dropped,
            duration_ms = duration.as_millis() as u64,
            "connection removed"
        );
    }

    /// Stops accepting sessions, waits for in-flight fan-outs (bounded by
    /// the shutdown grace period) and asks every remaining session to
    /// close.
    ///
    /// Returns the number of sessions asked to close. Sessions are removed
    /// as their transports call [`Relay::handle_disconnect`].
    pub async fn shutdown(&self) -> usize {
        self.accepting.store(false, Ordering::Release);

        let drained = tokio::time::timeout(self.settings.shutdown_grace, self.wait_drained())
            .await
            .is_ok();
        if !drained {
            tracing::warn!(
                in_flight = self.in_flight.load(Ordering::Acquire),
                "shutdown grace period elapsed with deliveries in flight"
            );
        }

        let mut state = self.state.write().await;
        let mut closed = 0;
        for connection in state.connections.values_mut() {
            if is_live(connection.state()) {
                connection.set_state(ConnectionState::Closing);
                self.queue_close(connection, CloseReason::Shutdown);
                closed += 1;
            }
        }
        tracing::info!(connections = closed, "relay shut down");
        closed
    }

    /// Returns the number of registered sessions.
    pub async fn connection_count(&self) -> usize {
        self.state.read().await.connections.len()
    }

    /// Returns the state of a session, if it is registered.
    pub async fn connection_state(&self, id: ConnectionId) -> Option<ConnectionState> {
        self.state
            .read()
            .await
            .connections
            .get(&id)
            .map(Connection::state)
    }

    /// Returns the destinations a session is subscribed to, sorted.
    pub async fn subscriptions(&self, id: ConnectionId) -> Option<Vec<String>> {
        self.state
            .read()
            .await
            .connections
            .get(&id)
            .map(|c| c.subscriptions().iter().cloned().collect())
    }

    /// Returns summaries of all destinations, sorted by name.
    pub async fn destinations(&self) -> Vec<DestinationSummary> {
        self.state.read().await.destinations.summaries()
    }

    /// Returns the subscribers of a destination in fan-out order.
    pub async fn subscribers(&self, destination: &str) -> Option<Vec<ConnectionId>> {
        self.state
            .read()
            .await
            .destinations
            .subscribers(destination)
            .map(<[ConnectionId]>::to_vec)
    }

    /// Applies a parsed frame to relay state. Returns the fan-out to run for
    /// SEND frames.
    async fn apply(
        &self,
        id: ConnectionId,
        frame: &Frame,
    ) -> Result<Option<FanOut<'_>>, ProtocolError> {
        let mut guard = self.state.write().await;
        let state = &mut *guard;
        let Some(connection) = state
            .connections
            .get_mut(&id)
            .filter(|c| is_live(c.state()))
        else {
            return Err(ProtocolError::UnknownConnection(id));
        };

        let mut received =
            TelemetryEvent::new(EventKind::FrameReceived, id).with_command(frame.command());
        if let Some(destination) = frame.destination() {
            received = received.with_destination(destination);
        }
        self.recorder.record(received);

        match (frame.command(), connection.state()) {
            (Command::Connect, current) => {
                if current == ConnectionState::Connecting {
                    connection.set_state(ConnectionState::Open);
                    tracing::debug!(connection_id = %id, "session opened");
                }
                let connected = Frame::new(Command::Connected)
                    .with_header("version", PROTOCOL_VERSION)
                    .with_header("session", id.to_string())
                    .with_header("server", self.settings.server_name.as_str());
                self.reply(connection, &connected);
                Ok(None)
            }
            (command, _) if !command.is_client_command() => {
                Err(ProtocolError::UnexpectedCommand(command))
            }
            (_, ConnectionState::Connecting) => Err(ProtocolError::NotConnected),
            (Command::Subscribe, _) => {
                let destination = required_destination(frame)?;
                connection.add_subscription(destination);
                if state.destinations.subscribe(destination, id) {
                    tracing::debug!(connection_id = %id, destination, "subscribed");
                }
                Ok(None)
            }
            (Command::Unsubscribe, _) => {
                let destination = required_destination(frame)?;
                connection.remove_subscription(destination);
                if state.destinations.unsubscribe(destination, id) {
                    tracing::debug!(connection_id = %id, destination, "unsubscribed");
                }
                Ok(None)
            }
            (Command::Disconnect, _) => {
                connection.set_state(ConnectionState::Closing);
                self.queue_close(connection, CloseReason::Disconnect);
                Ok(None)
            }
            (Command::Send, _) => {
                let requested = required_destination(frame)?;
                let destination = self.settings.routes.resolve(requested).to_string();
                let message = self.message_frame(id, &destination, frame);
                let recipients = state
                    .destinations
                    .subscribers(&destination)
                    .unwrap_or_default()
                    .iter()
                    .filter(|subscriber| **subscriber != id || self.settings.echo_to_sender)
                    .map(|subscriber| {
                        let outbox = state
                            .connections
                            .get(subscriber)
                            .filter(|c| c.state() == ConnectionState::Open)
                            .map(|c| c.outbox().clone());
                        (*subscriber, outbox)
                    })
                    .collect();
                Ok(Some(FanOut {
                    _guard: InFlightGuard::new(self),
                    destination,
                    frame: Arc::from(message.encode()),
                    recipients,
                }))
            }
            // Server-only commands are rejected above.
            (Command::Connected | Command::Message | Command::Error, _) => {
                Err(ProtocolError::UnexpectedCommand(frame.command()))
            }
        }
    }

    /// Writes one SEND to its recipients. Failures are recorded per
    /// recipient and never stop the others.
    async fn fan_out(&self, sender: ConnectionId, fan_out: FanOut<'_>) {
        let timeout = self.settings.write_timeout;
        let deliveries = fan_out.recipients.iter().map(|(recipient, outbox)| {
            let frame = Arc::clone(&fan_out.frame);
            async move {
                let result = match outbox {
                    Some(outbox) => outbox.deliver(*recipient, frame, timeout).await,
                    None => Err(DeliveryError::Closing(*recipient)),
                };
                (*recipient, result)
            }
        });
        let results = join_all(deliveries).await;

        let mut failed = 0usize;
        for (recipient, result) in results {
            if result.is_err() {
                failed += 1;
            }
            self.record_delivery(
                recipient,
                Command::Message,
                Some(fan_out.destination.as_str()),
                result,
            );
        }
        tracing::debug!(
            connection_id = %sender,
            destination = %fan_out.destination,
            recipients = fan_out.recipients.len(),
            failed,
            "fan-out complete"
        );
    }

    /// Records a protocol failure and, when fatal, sends ERROR and queues
    /// the close. Returns the error for the caller to propagate.
    async fn reject(
        &self,
        id: ConnectionId,
        command: Option<Command>,
        err: ProtocolError,
    ) -> ProtocolError {
        let mut event =
            TelemetryEvent::new(EventKind::FrameRejected, id).with_detail(err.to_string());
        if let Some(command) = command {
            event = event.with_command(command);
        }
        self.recorder.record(event);
        tracing::warn!(connection_id = %id, error = %err, "frame rejected");

        if err.is_connection_fatal() {
            let mut state = self.state.write().await;
            if let Some(connection) = state.connections.get_mut(&id)
                && is_live(connection.state())
            {
                connection.set_state(ConnectionState::Closing);
                self.reply(connection, &Frame::error(err.to_string()));
                self.queue_close(connection, CloseReason::ProtocolViolation);
            }
        }
        err
    }

    fn message_frame(&self, sender: ConnectionId, destination: &str, send: &Frame) -> Frame {
        let mut message = Frame::new(Command::Message)
            .with_header(DESTINATION_HEADER, destination)
            .with_header("message-id", uuid::Uuid::new_v4().to_string())
            .with_header("subscription", destination)
            .with_header("timestamp", Utc::now().format(MESSAGE_TIME_FORMAT).to_string())
            .with_header("sender", sender.to_string());
        if let Some(content_type) = send.header("content-type") {
            message = message.with_header("content-type", content_type);
        }
        if let Some(body) = send.body() {
            message = message.with_body(body);
        }
        message
    }

    /// Queues a reply to the connection's own frame without waiting.
    fn reply(&self, connection: &Connection, frame: &Frame) {
        let result = connection
            .outbox()
            .push(connection.id(), Outbound::Frame(Arc::from(frame.encode())));
        self.record_delivery(connection.id(), frame.command(), None, result);
    }

    fn queue_close(&self, connection: &Connection, reason: CloseReason) {
        if !connection.outbox().close(reason) {
            tracing::debug!(
                connection_id = %connection.id(),
                ?reason,
                "outbox full, close signalled out of band"
            );
        }
    }

    fn record_delivery(
        &self,
        id: ConnectionId,
        command: Command,
        destination: Option<&str>,
        result: Result<(), DeliveryError>,
    ) {
        let mut event = match &result {
            Ok(()) => TelemetryEvent::new(EventKind::FrameDelivered, id),
            Err(err) => {
                tracing::debug!(connection_id = %id, error = %err, "delivery failed");
                TelemetryEvent::new(EventKind::FrameDeliveryFailed, id).with_detail(err.to_string())
            }
        };
        event = event.with_command(command);
        if let Some(destination) = destination {
            event = event.with_destination(destination);
        }
        self.recorder.record(event);
    }

    async fn wait_drained(&self) {
        loop {
            let notified = self.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.in_flight.load(Ordering::Acquire) == 0 {
                return;
            }
            notified.await;
        }
    }
}

const fn is_live(state: ConnectionState) -> bool {
    matches!(state, ConnectionState::Connecting | ConnectionState::Open)
}

fn required_destination(frame: &Frame) -> Result<&str, ProtocolError> {
    frame
        .destination()
        .filter(|d| !d.is_empty())
        .ok_or_else(|| {
            ProtocolError::Malformed(format!(
                "{} frame requires a destination header",
                frame.command()
            ))
        })
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use std::time::Duration;

    use tokio::sync::mpsc::error::TryRecvError;

    use super::*;
    use crate::domain::{DestinationRoutes, OutboxReceiver};
    use crate::telemetry::MemoryRecorder;

    fn settings() -> RelaySettings {
        RelaySettings {
            write_timeout: Duration::from_millis(50),
            shutdown_grace: Duration::from_millis(200),
            ..RelaySettings::default()
        }
    }

    fn relay_with(settings: RelaySettings) -> (Arc<Relay>, Arc<MemoryRecorder>) {
        let recorder = Arc::new(MemoryRecorder::new());
        let relay = Relay::new(settings, Arc::clone(&recorder) as Arc<dyn Recorder>);
        (Arc::new(relay), recorder)
    }

    /// Registers a session, sends CONNECT and consumes the CONNECTED reply.
    async fn open_with_capacity(
        relay: &Relay,
        capacity: usize,
    ) -> (ConnectionId, OutboxReceiver) {
        let (outbox, mut rx) = Outbox::channel(capacity);
        let id = relay.handle_connect(outbox).await;
        if let Err(e) = relay.handle_frame(id, b"CONNECT").await {
            panic!("CONNECT failed: {e}");
        }
        let connected = next_frame(&mut rx);
        assert_eq!(connected.command(), Command::Connected);
        (id, rx)
    }

    async fn open(relay: &Relay) -> (ConnectionId, OutboxReceiver) {
        open_with_capacity(relay, 16).await
    }

    async fn send_ok(relay: &Relay, id: ConnectionId, raw: &str) {
        if let Err(e) = relay.handle_frame(id, raw.as_bytes()).await {
            panic!("frame {raw:?} failed: {e}");
        }
    }

    fn next_frame(rx: &mut OutboxReceiver) -> Frame {
        match rx.try_recv() {
            Ok(Outbound::Frame(text)) => match Frame::parse(text.as_bytes()) {
                Ok(frame) => frame,
                Err(e) => panic!("relay wrote an unparseable frame: {e}"),
            },
            other => panic!("expected a frame, got {other:?}"),
        }
    }

    fn assert_idle(rx: &mut OutboxReceiver) {
        if let Ok(item) = rx.try_recv() {
            panic!("expected nothing queued, got {item:?}");
        }
    }

    #[tokio::test]
    async fn connect_registers_session_and_replies_connected() {
        let (relay, recorder) = relay_with(settings());
        let (outbox, mut rx) = Outbox::channel(4);
        let id = relay.handle_connect(outbox).await;

        assert_eq!(relay.connection_state(id).await, Some(ConnectionState::Connecting));
        assert_eq!(recorder.count(EventKind::ConnectionOpen), 1);

        send_ok(&relay, id, "CONNECT\naccept-version:1.2\n\n").await;
        let connected = next_frame(&mut rx);
        assert_eq!(connected.command(), Command::Connected);
        assert_eq!(connected.header("version"), Some(PROTOCOL_VERSION));
        assert_eq!(connected.header("session"), Some(id.to_string().as_str()));
        assert_eq!(relay.connection_state(id).await, Some(ConnectionState::Open));
    }

    #[tokio::test]
    async fn every_subscriber_receives_body_exactly_once() {
        let (relay, recorder) = relay_with(settings());
        let (sender, mut sender_rx) = open(&relay).await;
        let mut subscribers = Vec::new();
        for _ in 0..3 {
            let (id, rx) = open(&relay).await;
            send_ok(&relay, id, "SUBSCRIBE destination=chat").await;
            subscribers.push((id, rx));
        }

        send_ok(&relay, sender, "SEND destination=chat\n\nhello").await;

        for (_, rx) in &mut subscribers {
            let message = next_frame(rx);
            assert_eq!(message.command(), Command::Message);
            assert_eq!(message.destination(), Some("chat"));
            assert_eq!(message.body(), Some("hello"));
            assert_eq!(message.header("sender"), Some(sender.to_string().as_str()));
            assert!(message.header("message-id").is_some());
            assert_idle(rx);
        }
        assert_idle(&mut sender_rx);
        let delivered = recorder
            .of_kind(EventKind::FrameDelivered)
            .into_iter()
            .filter(|e| e.destination.as_deref() == Some("chat"))
            .count();
        assert_eq!(delivered, 3);
    }

    #[tokio::test]
    async fn failed_subscriber_is_recorded_and_others_still_receive() {
        let (relay, recorder) = relay_with(settings());
        let (sender, _sender_rx) = open(&relay).await;
        let (first, mut first_rx) = open(&relay).await;
        let (broken, broken_rx) = open(&relay).await;
        let (last, mut last_rx) = open(&relay).await;
        for id in [first, broken, last] {
            send_ok(&relay, id, "SUBSCRIBE destination=chat").await;
        }
        drop(broken_rx);

        send_ok(&relay, sender, "SEND destination=chat\n\nhi").await;

        assert_eq!(next_frame(&mut first_rx).body(), Some("hi"));
        assert_eq!(next_frame(&mut last_rx).body(), Some("hi"));
        let failures = recorder.of_kind(EventKind::FrameDeliveryFailed);
        assert_eq!(failures.len(), 1);
        let Some(failure) = failures.first() else {
            panic!("expected a failure event");
        };
        assert_eq!(failure.connection_id, broken);
        assert_eq!(failure.destination.as_deref(), Some("chat"));
        assert_eq!(relay.subscribers("chat").await, Some(vec![first, broken, last]));
    }

    #[tokio::test]
    async fn full_outbox_times_out_without_blocking_others() {
        let (relay, recorder) = relay_with(settings());
        let (sender, _sender_rx) = open(&relay).await;
        let (slow, _slow_rx) = open_with_capacity(&relay, 1).await;
        let (fast, mut fast_rx) = open(&relay).await;
        send_ok(&relay, slow, "SUBSCRIBE destination=chat").await;
        send_ok(&relay, fast, "SUBSCRIBE destination=chat").await;

        // Fill the slow subscriber's only slot.
        send_ok(&relay, sender, "SEND destination=chat\n\none").await;
        send_ok(&relay, sender, "SEND destination=chat\n\ntwo").await;

        assert_eq!(next_frame(&mut fast_rx).body(), Some("one"));
        assert_eq!(next_frame(&mut fast_rx).body(), Some("two"));
        let failures = recorder.of_kind(EventKind::FrameDeliveryFailed);
        assert_eq!(failures.len(), 1);
        assert!(
            failures
                .iter()
                .all(|e| e.connection_id == slow
                    && e.detail.as_deref().is_some_and(|d| d.contains("timed out")))
        );
    }

    #[tokio::test]
    async fn unsubscribed_connection_no_longer_receives() {
        let (relay, _) = relay_with(settings());
        let (sender, _sender_rx) = open(&relay).await;
        let (listener, mut listener_rx) = open(&relay).await;
        send_ok(&relay, listener, "SUBSCRIBE destination=chat").await;
        send_ok(&relay, listener, "UNSUBSCRIBE destination=chat").await;

        send_ok(&relay, sender, "SEND destination=chat\n\nhi").await;

        assert_idle(&mut listener_rx);
        assert!(relay.subscribers("chat").await.is_none());
        assert_eq!(relay.subscriptions(listener).await, Some(Vec::new()));
    }

    #[tokio::test]
    async fn duplicate_subscribe_delivers_once() {
        let (relay, _) = relay_with(settings());
        let (sender, _sender_rx) = open(&relay).await;
        let (listener, mut listener_rx) = open(&relay).await;
        send_ok(&relay, listener, "SUBSCRIBE destination=chat").await;
        send_ok(&relay, listener, "SUBSCRIBE destination=chat").await;

        send_ok(&relay, sender, "SEND destination=chat\n\nhi").await;

        assert_eq!(next_frame(&mut listener_rx).body(), Some("hi"));
        assert_idle(&mut listener_rx);
    }

    #[tokio::test]
    async fn disconnect_removes_connection_from_every_destination() {
        let (relay, recorder) = relay_with(settings());
        let (a, _a_rx) = open(&relay).await;
        let (b, _b_rx) = open(&relay).await;
        for destination in ["chat", "news", "sports"] {
            send_ok(&relay, a, &format!("SUBSCRIBE destination={destination}")).await;
        }
        send_ok(&relay, b, "SUBSCRIBE destination=news").await;

        relay.handle_disconnect(a).await;

        assert!(relay.subscribers("chat").await.is_none());
        assert!(relay.subscribers("sports").await.is_none());
        assert_eq!(relay.subscribers("news").await, Some(vec![b]));
        assert_eq!(relay.connection_state(a).await, None);
        assert_eq!(relay.connection_count().await, 1);

        let closes = recorder.of_kind(EventKind::ConnectionClose);
        assert_eq!(closes.len(), 1);
        assert!(closes.iter().all(|e| e.connection_id == a && e.duration.is_some()));

        relay.handle_disconnect(a).await;
        assert_eq!(recorder.count(EventKind::ConnectionClose), 1);
    }

    #[tokio::test]
    async fn send_to_destination_without_subscribers_succeeds() {
        let (relay, recorder) = relay_with(settings());
        let (sender, mut sender_rx) = open(&relay).await;
        recorder.clear();

        send_ok(&relay, sender, "SEND destination=nowhere\n\nhello?").await;

        assert_idle(&mut sender_rx);
        assert_eq!(recorder.count(EventKind::FrameDelivered), 0);
        assert_eq!(recorder.count(EventKind::FrameDeliveryFailed), 0);
        assert!(relay.destinations().await.is_empty());
    }

    #[tokio::test]
    async fn chat_scenario_without_echo() {
        let (relay, _) = relay_with(settings());
        let (a, mut a_rx) = open(&relay).await;
        let (b, mut b_rx) = open(&relay).await;
        send_ok(&relay, a, "SUBSCRIBE destination=chat").await;
        send_ok(&relay, b, "SUBSCRIBE destination=chat").await;

        send_ok(&relay, a, "SEND destination=chat\n\nhi").await;

        assert_eq!(next_frame(&mut b_rx).body(), Some("hi"));
        assert_idle(&mut a_rx);
    }

    #[tokio::test]
    async fn chat_scenario_with_echo() {
        let (relay, _) = relay_with(RelaySettings {
            echo_to_sender: true,
            ..settings()
        });
        let (a, mut a_rx) = open(&relay).await;
        let (b, mut b_rx) = open(&relay).await;
        send_ok(&relay, a, "SUBSCRIBE destination=chat").await;
        send_ok(&relay, b, "SUBSCRIBE destination=chat").await;

        send_ok(&relay, a, "SEND destination=chat\n\nhi").await;

        assert_eq!(next_frame(&mut a_rx).body(), Some("hi"));
        assert_eq!(next_frame(&mut b_rx).body(), Some("hi"));
        assert_idle(&mut a_rx);
    }

    #[tokio::test]
    async fn malformed_send_closes_only_the_sender() {
        let (relay, recorder) = relay_with(settings());
        let (a, mut a_rx) = open(&relay).await;
        let (b, mut b_rx) = open(&relay).await;
        send_ok(&relay, a, "SUBSCRIBE destination=chat").await;
        send_ok(&relay, b, "SUBSCRIBE destination=chat").await;

        let result = relay.handle_frame(a, b"SEND\n\nhi").await;
        assert!(matches!(result, Err(ProtocolError::Malformed(_))));

        let error = next_frame(&mut a_rx);
        assert_eq!(error.command(), Command::Error);
        assert!(error.header("message").is_some());
        assert_eq!(
            a_rx.try_recv().ok(),
            Some(Outbound::Close(CloseReason::ProtocolViolation))
        );
        assert_eq!(relay.subscribers("chat").await, Some(vec![a, b]));
        assert_eq!(relay.connection_state(a).await, Some(ConnectionState::Closing));
        assert_eq!(relay.connection_state(b).await, Some(ConnectionState::Open));
        assert_eq!(recorder.count(EventKind::FrameRejected), 1);
        assert_idle(&mut b_rx);

        // The closing sender is skipped on later fan-outs, and the skip is reported.
        send_ok(&relay, b, "SEND destination=chat\n\nstill here").await;
        assert_idle(&mut a_rx);
        let failures = recorder.of_kind(EventKind::FrameDeliveryFailed);
        assert_eq!(failures.len(), 1);
        assert!(failures.iter().all(|e| e.connection_id == a));
    }

    #[tokio::test]
    async fn frames_after_close_are_unknown_connection() {
        let (relay, _) = relay_with(settings());
        let (a, _a_rx) = open(&relay).await;
        assert!(relay.handle_frame(a, b"BOGUS").await.is_err());

        let result = relay.handle_frame(a, b"SUBSCRIBE destination=chat").await;
        assert_eq!(result, Err(ProtocolError::UnknownConnection(a)));
        assert!(relay.subscribers("chat").await.is_none());
    }

    #[tokio::test]
    async fn frames_before_connect_are_rejected() {
        let (relay, _) = relay_with(settings());
        let (outbox, mut rx) = Outbox::channel(4);
        let id = relay.handle_connect(outbox).await;

        let result = relay.handle_frame(id, b"SUBSCRIBE destination=chat").await;
        assert_eq!(result, Err(ProtocolError::NotConnected));
        assert_eq!(next_frame(&mut rx).command(), Command::Error);
        assert!(relay.subscribers("chat").await.is_none());
    }

    #[tokio::test]
    async fn server_commands_from_clients_are_rejected() {
        let (relay, _) = relay_with(settings());
        let (a, _a_rx) = open(&relay).await;
        let result = relay.handle_frame(a, b"MESSAGE destination=chat\n\nspoof").await;
        assert_eq!(result, Err(ProtocolError::UnexpectedCommand(Command::Message)));
    }

    #[tokio::test]
    async fn unknown_connection_is_not_fatal() {
        let (relay, recorder) = relay_with(settings());
        let stranger = ConnectionId::new();
        let result = relay.handle_frame(stranger, b"CONNECT").await;
        assert_eq!(result, Err(ProtocolError::UnknownConnection(stranger)));
        assert_eq!(recorder.count(EventKind::FrameRejected), 1);
        assert_eq!(recorder.count(EventKind::FrameReceived), 0);
    }

    #[tokio::test]
    async fn frames_for_closing_session_are_not_counted_as_received() {
        let (relay, recorder) = relay_with(settings());
        let (a, _a_rx) = open(&relay).await;
        send_ok(&relay, a, "DISCONNECT").await;
        recorder.clear();

        let result = relay.handle_frame(a, b"SEND destination=chat\n\nlate").await;
        assert_eq!(result, Err(ProtocolError::UnknownConnection(a)));
        assert_eq!(recorder.count(EventKind::FrameReceived), 0);
        assert_eq!(recorder.count(EventKind::FrameRejected), 1);
    }

    #[tokio::test]
    async fn disconnect_frame_queues_close() {
        let (relay, _) = relay_with(settings());
        let (a, mut a_rx) = open(&relay).await;
        send_ok(&relay, a, "DISCONNECT").await;

        assert_eq!(a_rx.try_recv().ok(), Some(Outbound::Close(CloseReason::Disconnect)));
        assert_eq!(relay.connection_state(a).await, Some(ConnectionState::Closing));
    }

    /// Fills a capacity-1 subscriber's outbox with one MESSAGE.
    async fn open_full(relay: &Relay) -> (ConnectionId, OutboxReceiver) {
        let (sender, _sender_rx) = open(relay).await;
        let (slow, slow_rx) = open_with_capacity(relay, 1).await;
        send_ok(relay, slow, "SUBSCRIBE destination=chat").await;
        send_ok(relay, sender, "SEND destination=chat\n\nfill").await;
        (slow, slow_rx)
    }

    #[tokio::test]
    async fn disconnect_with_full_outbox_still_closes() {
        let (relay, _) = relay_with(settings());
        let (slow, mut slow_rx) = open_full(&relay).await;

        send_ok(&relay, slow, "DISCONNECT").await;
        assert_eq!(relay.connection_state(slow).await, Some(ConnectionState::Closing));

        assert_eq!(next_frame(&mut slow_rx).body(), Some("fill"));
        assert_eq!(
            slow_rx.try_recv(),
            Ok(Outbound::Close(CloseReason::Disconnect))
        );
        assert_eq!(slow_rx.try_recv(), Err(TryRecvError::Empty));
    }

    #[tokio::test]
    async fn shutdown_with_full_outbox_still_closes() {
        let (relay, _) = relay_with(settings());
        let (_slow, mut slow_rx) = open_full(&relay).await;

        assert!(relay.shutdown().await >= 1);

        assert_eq!(next_frame(&mut slow_rx).body(), Some("fill"));
        assert_eq!(slow_rx.recv().await, Some(Outbound::Close(CloseReason::Shutdown)));
    }

    #[tokio::test]
    async fn routed_send_reaches_target_destination() {
        let (relay, _) = relay_with(RelaySettings {
            routes: DestinationRoutes::new().with_route("/app/tube", "/topic/messages"),
            ..settings()
        });
        let (sender, _sender_rx) = open(&relay).await;
        let (listener, mut listener_rx) = open(&relay).await;
        send_ok(&relay, listener, "SUBSCRIBE destination=/topic/messages").await;

        send_ok(
            &relay,
            sender,
            "SEND\ndestination:/app/tube\ncontent-type:application/json\n\n{\"from\":\"a\"}",
        )
        .await;

        let message = next_frame(&mut listener_rx);
        assert_eq!(message.destination(), Some("/topic/messages"));
        assert_eq!(message.header("content-type"), Some("application/json"));
        assert_eq!(message.body(), Some("{\"from\":\"a\"}"));
    }

    #[tokio::test]
    async fn shutdown_closes_sessions_and_stops_accepting() {
        let (relay, _) = relay_with(settings());
        let (_a, mut a_rx) = open(&relay).await;
        let (_b, mut b_rx) = open(&relay).await;

        assert_eq!(relay.shutdown().await, 2);
        assert!(!relay.is_accepting());
        assert_eq!(a_rx.try_recv().ok(), Some(Outbound::Close(CloseReason::Shutdown)));
        assert_eq!(b_rx.try_recv().ok(), Some(Outbound::Close(CloseReason::Shutdown)));

        let (outbox, mut late_rx) = Outbox::channel(4);
        let late = relay.handle_connect(outbox).await;
        assert_eq!(late_rx.try_recv().ok(), Some(Outbound::Close(CloseReason::Shutdown)));
        assert_eq!(relay.connection_state(late).await, Some(ConnectionState::Closing));
    }

    #[tokio::test]
    async fn concurrent_subscribe_and_send_keep_table_consistent() {
        let (relay, _) = relay_with(settings());
        let (sender, _sender_rx) = open(&relay).await;

        let mut tasks = Vec::new();
        for _ in 0..16 {
            let relay = Arc::clone(&relay);
            tasks.push(tokio::spawn(async move {
                let (id, rx) = open(&relay).await;
                send_ok(&relay, id, "SUBSCRIBE destination=chat").await;
                (id, rx)
            }));
        }
        for _ in 0..8 {
            send_ok(&relay, sender, "SEND destination=chat\n\ntick").await;
        }

        let mut listeners = Vec::new();
        for task in tasks {
            let Ok(listener) = task.await else {
                panic!("subscriber task panicked");
            };
            listeners.push(listener);
        }
        let Some(subscribers) = relay.subscribers("chat").await else {
            panic!("chat must exist");
        };
        assert_eq!(subscribers.len(), 16);

        send_ok(&relay, sender, "SEND destination=chat\n\nfinal").await;
        for (_, rx) in &mut listeners {
            let mut bodies = Vec::new();
            while let Ok(Outbound::Frame(text)) = rx.try_recv() {
                let Ok(frame) = Frame::parse(text.as_bytes()) else {
                    panic!("unparseable frame");
                };
                bodies.push(frame.body().map(str::to_string));
            }
            assert!(bodies.len() <= 9);
            assert_eq!(bodies.last(), Some(&Some("final".to_string())));
        }
    }
}
