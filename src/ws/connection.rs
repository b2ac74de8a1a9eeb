//! Per-session WebSocket loop.
//!
//! Reads frames from the client and hands them to the [`Relay`], and writes
//! whatever the relay queues in the session's outbox back to the client.
//! The loop ends when either side closes, the relay queues a close, or the
//! client stays silent past the idle timeout. The session is then removed
//! from the relay.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, Utf8Bytes, WebSocket, close_code};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::time::{Instant, sleep};
use tracing::Instrument;

use crate::domain::{CloseReason, ConnectionId, Outbound, Outbox, OutboxReceiver};
use crate::service::Relay;

/// Idle deadline used when the idle check is disabled; never reached.
const NO_IDLE_DEADLINE: Duration = Duration::from_secs(60 * 60 * 24 * 365);

type WsSink = SplitSink<WebSocket, Message>;

/// Runs the read/write loop for a single WebSocket connection.
///
/// - Registers the session with the relay.
/// - Passes each text or binary message to [`Relay::handle_frame`];
///   messages made only of line breaks are heart-beats and are skipped.
/// - Forwards queued [`Outbound`] items to the client.
/// - Calls [`Relay::handle_disconnect`] on exit.
pub async fn run_connection(socket: WebSocket, relay: Arc<Relay>, idle_timeout: Option<Duration>) {
    let (outbox, outbound_rx) = Outbox::channel(relay.settings().outbound_buffer);
    let connection_id = relay.handle_connect(outbox).await;
    let span = tracing::info_span!("ws_session", connection_id = %connection_id);

    async move {
        tracing::debug!("ws session started");
        session_loop(socket, &relay, connection_id, outbound_rx, idle_timeout).await;
        relay.handle_disconnect(connection_id).await;
        tracing::debug!("ws session closed");
    }
    .instrument(span)
    .await;
}

async fn session_loop(
    socket: WebSocket,
    relay: &Relay,
    connection_id: ConnectionId,
    mut outbound_rx: OutboxReceiver,
    idle_timeout: Option<Duration>,
) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let idle_window = idle_timeout.unwrap_or(NO_IDLE_DEADLINE);
    let idle = sleep(idle_window);
    tokio::pin!(idle);

    loop {
        tokio::select! {
            // Incoming message from client
            msg = ws_rx.next() => {
                idle.as_mut().reset(Instant::now() + idle_window);
                let result = match msg {
                    Some(Ok(Message::Text(text))) => {
                        if is_heartbeat(text.as_str().as_bytes()) {
                            continue;
                        }
                        relay.handle_frame(connection_id, text.as_str().as_bytes()).await
                    }
                    Some(Ok(Message::Binary(bytes))) => {
                        if is_heartbeat(&bytes) {
                            continue;
                        }
                        relay.handle_frame(connection_id, &bytes).await
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(err)) => {
                        tracing::debug!(error = %err, "ws read failed");
                        break;
                    }
                    Some(Ok(_)) => continue,
                };
                if let Err(err) = result
                    && err.is_connection_fatal()
                {
                    flush_and_close(&mut ws_tx, &mut outbound_rx, CloseReason::ProtocolViolation).await;
                    break;
                }
            }
            // Item queued by the relay
            outbound = outbound_rx.recv() => {
                match outbound {
                    Some(Outbound::Frame(text)) => {
                        if ws_tx.send(Message::text(String::from(&*text))).await.is_err() {
                            break;
                        }
                    }
                    Some(Outbound::Close(reason)) => {
                        let _ = ws_tx.send(close_message(reason)).await;
                        break;
                    }
                    None => break,
                }
            }
            () = &mut idle, if idle_timeout.is_some() => {
                tracing::info!(idle_secs = idle_window.as_secs(), "closing idle ws session");
                let _ = ws_tx
                    .send(Message::Close(Some(CloseFrame {
                        code: close_code::NORMAL,
                        reason: Utf8Bytes::from_static("idle timeout"),
                    })))
                    .await;
                break;
            }
        }
    }
}

/// Writes everything the relay already queued (the ERROR frame among it),
/// then closes the socket.
async fn flush_and_close(
    ws_tx: &mut WsSink,
    outbound_rx: &mut OutboxReceiver,
    fallback: CloseReason,
) {
    while let Ok(item) = outbound_rx.try_recv() {
        match item {
            Outbound::Frame(text) => {
                if ws_tx.send(Message::text(String::from(&*text))).await.is_err() {
                    return;
                }
            }
            Outbound::Close(reason) => {
                let _ = ws_tx.send(close_message(reason)).await;
                return;
            }
        }
    }
    let _ = ws_tx.send(close_message(fallback)).await;
}

fn close_message(reason: CloseReason) -> Message {
    let (code, text) = match reason {
        CloseReason::Disconnect => (close_code::NORMAL, "disconnect"),
        CloseReason::ProtocolViolation => (close_code::PROTOCOL, "protocol violation"),
        CloseReason::Shutdown => (close_code::AWAY, "relay shutting down"),
    };
    Message::Close(Some(CloseFrame {
        code,
        reason: Utf8Bytes::from_static(text),
    }))
}

/// Returns `true` for a STOMP heart-beat: a message made only of EOLs.
fn is_heartbeat(raw: &[u8]) -> bool {
    !raw.is_empty() && raw.iter().all(|b| *b == b'\n' || *b == b'\r')
}
