//! Relay-side session record and its outbound queue.
//!
//! The relay never touches a socket. Each [`Connection`] owns an [`Outbox`],
//! the sending half of a bounded channel whose receiver is drained by the
//! transport task that owns the socket.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{mpsc, watch};

use super::ConnectionId;
use crate::error::DeliveryError;

/// Liveness of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// Registered, waiting for CONNECT.
    Connecting,
    /// CONNECT accepted; frames are processed.
    Open,
    /// A close has been queued; frames are no longer processed.
    Closing,
    /// Removed from the relay.
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::Closing => "closing",
            Self::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Why the relay asked the transport to close.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The client sent DISCONNECT.
    Disconnect,
    /// The client violated the frame protocol.
    ProtocolViolation,
    /// The relay is shutting down.
    Shutdown,
}

/// Item queued for the transport writer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// Encoded frame text. Shared between all recipients of one fan-out.
    Frame(Arc<str>),
    /// Close the transport after everything queued before this item.
    Close(CloseReason),
}

/// Sending half of a connection's outbound queue.
///
/// Frames travel through a bounded channel. A close request that does not
/// fit in the channel is carried by a separate signal, so it is never lost.
#[derive(Debug)]
pub struct Outbox {
    sender: mpsc::Sender<Outbound>,
    close: Arc<watch::Sender<Option<CloseReason>>>,
}

impl Clone for Outbox {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
            close: Arc::clone(&self.close),
        }
    }
}

impl Outbox {
    /// Creates an outbox with room for `capacity` pending items, returning
    /// the receiver the transport writer drains.
    #[must_use]
    pub fn channel(capacity: usize) -> (Self, OutboxReceiver) {
        let (sender, items) = mpsc::channel(capacity.max(1));
        let (close_tx, close) = watch::channel(None);
        (
            Self {
                sender,
                close: Arc::new(close_tx),
            },
            OutboxReceiver {
                items,
                close,
                close_taken: false,
            },
        )
    }

    /// Queues a frame, waiting at most `timeout` for room.
    ///
    /// # Errors
    ///
    /// Returns [`DeliveryError::TransportFailure`] if the receiver is gone
    /// and [`DeliveryError::Timeout`] if the queue stayed full.
    pub async fn deliver(
        &self,
        id: ConnectionId,
        frame: Arc<str>,
        timeout: Duration,
    ) -> Result<(), DeliveryError> {
        match tokio::time::timeout(timeout, self.sender.send(Outbound::Frame(frame))).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(DeliveryError::TransportFailure(id)),
            Err(_) => Err(DeliveryError::Timeout(id, timeout)),
        }
    }

    /// Queues an item without waiting.
    ///
    /// Used for replies to the connection's own frames: the transport task
    /// that would drain the queue is the one waiting on the reply.
    ///
    /// # Errors
    ///
    /// Returns [`DeliveryError::TransportFailure`] if the queue is full or
    /// the receiver is gone.
    pub fn push(&self, id: ConnectionId, item: Outbound) -> Result<(), DeliveryError> {
        self.sender
            .try_send(item)
            .map_err(|_| DeliveryError::TransportFailure(id))
    }

    /// Asks the transport to close once everything already queued is
    /// written. Never waits and never fails.
    ///
    /// Returns `false` when the queue had no room and the close was
    /// signalled out of band. The first requested reason wins.
    pub fn close(&self, reason: CloseReason) -> bool {
        if self.sender.try_send(Outbound::Close(reason)).is_ok() {
            return true;
        }
        self.close.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(reason);
            true
        });
        false
    }

    /// Returns `true` once the transport writer has dropped its receiver.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

/// Receiving half of an [`Outbox`], drained by the transport writer.
///
/// Queued items come out in order. An out-of-band close comes out as
/// [`Outbound::Close`] once the queue is empty.
#[derive(Debug)]
pub struct OutboxReceiver {
    items: mpsc::Receiver<Outbound>,
    close: watch::Receiver<Option<CloseReason>>,
    close_taken: bool,
}

impl OutboxReceiver {
    /// Waits for the next item. Returns `None` once every [`Outbox`] is
    /// dropped and nothing is left to drain.
    ///
    /// Cancel safe.
    pub async fn recv(&mut self) -> Option<Outbound> {
        loop {
            match self.try_recv() {
                Ok(item) => return Some(item),
                Err(TryRecvError::Disconnected) => return None,
                Err(TryRecvError::Empty) => {}
            }
            tokio::select! {
                item = self.items.recv() => return item,
                changed = self.close.changed() => {
                    if changed.is_err() {
                        return self.items.recv().await;
                    }
                }
            }
        }
    }

    /// Takes the next item without waiting.
    ///
    /// # Errors
    ///
    /// Returns [`TryRecvError::Empty`] when nothing is ready and
    /// [`TryRecvError::Disconnected`] when every [`Outbox`] is gone.
    pub fn try_recv(&mut self) -> Result<Outbound, TryRecvError> {
        match self.items.try_recv() {
            Ok(item) => Ok(item),
            Err(err) => match self.take_close() {
                Some(reason) => Ok(Outbound::Close(reason)),
                None => Err(err),
            },
        }
    }

    fn take_close(&mut self) -> Option<CloseReason> {
        if self.close_taken {
            return None;
        }
        let reason = *self.close.borrow();
        self.close_taken = reason.is_some();
        reason
    }
}

/// One registered session.
#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    state: ConnectionState,
    subscriptions: BTreeSet<String>,
    connected_at: Instant,
    opened_at: DateTime<Utc>,
    outbox: Outbox,
}

impl Connection {
    /// Creates a session in [`ConnectionState::Connecting`].
    #[must_use]
    pub fn new(id: ConnectionId, outbox: Outbox) -> Self {
        Self {
            id,
            state: ConnectionState::Connecting,
            subscriptions: BTreeSet::new(),
            connected_at: Instant::now(),
            opened_at: Utc::now(),
            outbox,
        }
    }

    /// Returns the session id.
    #[must_use]
    pub const fn id(&self) -> ConnectionId {
        self.id
    }

    /// Returns the liveness state.
    #[must_use]
    pub const fn state(&self) -> ConnectionState {
        self.state
    }

    /// Moves the session to `state`.
    pub fn set_state(&mut self, state: ConnectionState) {
        self.state = state;
    }

    /// Returns the destinations this session is subscribed to.
    #[must_use]
    pub const fn subscriptions(&self) -> &BTreeSet<String> {
        &self.subscriptions
    }

    /// Records a subscription. Returns `false` if it already existed.
    pub fn add_subscription(&mut self, destination: &str) -> bool {
        self.subscriptions.insert(destination.to_string())
    }

    /// Forgets a subscription. Returns `false` if it did not exist.
    pub fn remove_subscription(&mut self, destination: &str) -> bool {
        self.subscriptions.remove(destination)
    }

    /// Empties and returns the subscription set.
    pub fn take_subscriptions(&mut self) -> BTreeSet<String> {
        std::mem::take(&mut self.subscriptions)
    }

    /// Returns the time elapsed since the session was registered.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.connected_at.elapsed()
    }

    /// Returns the wall-clock registration time.
    #[must_use]
    pub const fn opened_at(&self) -> DateTime<Utc> {
        self.opened_at
    }

    /// Returns the session's outbound queue.
    #[must_use]
    pub const fn outbox(&self) -> &Outbox {
        &self.outbox
    }
}
