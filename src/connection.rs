//! WebSocket connection with backpressure-aware sends and a shared inbound
//! fan-out.
//!
//! One connection carries every logical subscription. A single background
//! task owns the stream: it writes queued outbound frames, fans inbound text
//! payloads out to every [`messages`](Connection::messages) consumer, and
//! reacts to cancellation. There is no reconnection; once a connection is
//! closed or errored, a new attempt requires a new [`Connection`].

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::Duration;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::error::{LedgerLinkError, Result};
use crate::fanout::{FanOut, Subscriber};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// How long the background task waits for the close handshake to complete
/// after sending its own close frame.
const CLOSE_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Lifecycle of a connection. Transitions are one-way; a state never moves
/// to one earlier in the order below.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closing,
    Closed,
    Errored,
}

fn state_rank(state: ConnectionState) -> u8 {
    match state {
        ConnectionState::Connecting => 0,
        ConnectionState::Open => 1,
        ConnectionState::Closing => 2,
        ConnectionState::Closed => 3,
        ConnectionState::Errored => 4,
    }
}

/// Advance the tracked state, ignoring transitions that would move backward.
fn advance_state(tx: &watch::Sender<ConnectionState>, next: ConnectionState) {
    tx.send_if_modified(|current| {
        if state_rank(next) > state_rank(*current) {
            *current = next;
            true
        } else {
            false
        }
    });
}

/// Validate a WebSocket URL before any socket exists. Only `ws` and `wss`
/// schemes are accepted, case-insensitively.
pub fn validate_url(url: &str) -> Result<Url> {
    let parsed = Url::parse(url)
        .map_err(|e| LedgerLinkError::Configuration(format!("invalid URL `{url}`: {e}")))?;
    match parsed.scheme() {
        "ws" | "wss" => Ok(parsed),
        other => Err(LedgerLinkError::Configuration(format!(
            "unsupported URL scheme `{other}`; expected `ws` or `wss`"
        ))),
    }
}

// ── Drain gate ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
struct DrainState {
    /// Bytes serialized and queued but not yet written to the socket.
    buffered: usize,
    closed: bool,
}

/// The single shared watcher every backpressured send waits on. Senders add
/// to the buffered count when they queue a frame; the writer subtracts once
/// the frame is actually written. Closing wakes and fails all waiters.
#[derive(Clone)]
pub(crate) struct DrainGate {
    tx: Arc<watch::Sender<DrainState>>,
}

impl DrainGate {
    pub(crate) fn new() -> Self {
        let (tx, _rx) = watch::channel(DrainState {
            buffered: 0,
            closed: false,
        });
        Self { tx: Arc::new(tx) }
    }

    pub(crate) fn add(&self, bytes: usize) {
        self.tx.send_modify(|state| state.buffered += bytes);
    }

    pub(crate) fn sub(&self, bytes: usize) {
        self.tx
            .send_modify(|state| state.buffered = state.buffered.saturating_sub(bytes));
    }

    pub(crate) fn close(&self) {
        self.tx.send_modify(|state| state.closed = true);
    }

    /// Wait until the buffered count is at or below `high_watermark`.
    /// Fails with `ClosedBeforeBuffered` if the gate closes first.
    pub(crate) async fn wait_ready(&self, high_watermark: usize) -> Result<()> {
        let mut rx = self.tx.subscribe();
        let state = rx
            .wait_for(|state| state.closed || state.buffered <= high_watermark)
            .await
            .map_err(|_| LedgerLinkError::ClosedBeforeBuffered)?;
        if state.closed {
            return Err(LedgerLinkError::ClosedBeforeBuffered);
        }
        Ok(())
    }
}

// ── Connection (public handle) ──────────────────────────────────────────────

struct OutboundFrame {
    payload: String,
    bytes: usize,
}

/// An open WebSocket connection.
///
/// Dropping the connection closes the socket cleanly; live
/// [`messages`](Connection::messages) consumers then observe a clean end of
/// sequence.
pub struct Connection {
    out_tx: mpsc::UnboundedSender<OutboundFrame>,
    fanout: FanOut<String>,
    drain: DrainGate,
    state_rx: watch::Receiver<ConnectionState>,
    high_watermark: usize,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("state", &self.state())
            .field("high_watermark", &self.high_watermark)
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Connect to `url` and resolve once the socket is open.
    ///
    /// Fails with a `Configuration` error before any I/O when the URL is
    /// invalid, and with `ConnectFailed` when the handshake errors or
    /// `token` fires first. A token that is already cancelled fails without
    /// opening a socket.
    pub async fn open(
        url: &str,
        high_watermark: usize,
        token: &CancellationToken,
    ) -> Result<Self> {
        let url = validate_url(url)?;
        if token.is_cancelled() {
            return Err(LedgerLinkError::ConnectFailed {
                reason: "aborted before connecting".to_string(),
            });
        }
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);
        let state_tx = Arc::new(state_tx);

        log::debug!("connecting to {url}");
        let ws = tokio::select! {
            biased;
            _ = token.cancelled() => {
                advance_state(&state_tx, ConnectionState::Errored);
                return Err(LedgerLinkError::ConnectFailed {
                    reason: "aborted during handshake".to_string(),
                });
            }
            result = connect_async(url.as_str()) => match result {
                Ok((ws, _response)) => ws,
                Err(e) => {
                    advance_state(&state_tx, ConnectionState::Errored);
                    return Err(LedgerLinkError::ConnectFailed {
                        reason: e.to_string(),
                    });
                }
            }
        };
        advance_state(&state_tx, ConnectionState::Open);
        log::debug!("connection open: {url}");

        let fanout = FanOut::new();
        let drain = DrainGate::new();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        tokio::spawn(connection_task(
            ws,
            out_rx,
            fanout.clone(),
            drain.clone(),
            state_tx,
            token.clone(),
        ));

        Ok(Self {
            out_tx,
            fanout,
            drain,
            state_rx,
            high_watermark,
        })
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    /// Serialize `payload` as JSON and queue it for the socket.
    ///
    /// When the buffered-byte count is above the configured high watermark,
    /// waits on the connection's shared drain watcher until the writer has
    /// caught up. Fails with `ClosedBeforeBuffered` if the connection closes
    /// or is aborted while the message is still waiting.
    pub async fn send<T: Serialize>(&self, payload: &T) -> Result<()> {
        let text = serde_json::to_string(payload)
            .map_err(|e| LedgerLinkError::Serialization(e.to_string()))?;
        let bytes = text.len();
        self.drain.wait_ready(self.high_watermark).await?;
        self.drain.add(bytes);
        if self
            .out_tx
            .send(OutboundFrame {
                payload: text,
                bytes,
            })
            .is_err()
        {
            self.drain.sub(bytes);
            return Err(LedgerLinkError::ClosedBeforeBuffered);
        }
        Ok(())
    }

    /// A new independent consumer of inbound message payloads.
    ///
    /// Every consumer receives every payload that arrives after its first
    /// poll; nothing is replayed. After the connection fails, each consumer
    /// drains its queued payloads and then ends with the connection error;
    /// after cancellation it ends cleanly.
    pub fn messages(&self) -> Subscriber<String> {
        self.fanout.subscriber()
    }
}

// ── Background connection task ──────────────────────────────────────────────

/// Send our close frame (normal closure, code 1000) and wait briefly for the
/// handshake to complete so the close is clean on the wire.
async fn close_socket(ws: &mut WsStream) {
    let _ = ws
        .close(Some(CloseFrame {
            code: CloseCode::Normal,
            reason: "".into(),
        }))
        .await;
    let drain = async {
        while let Some(frame) = ws.next().await {
            match frame {
                Ok(Message::Close(_)) | Err(_) => break,
                // Late frames after the close request are dropped.
                _ => {}
            }
        }
    };
    if tokio::time::timeout(CLOSE_HANDSHAKE_TIMEOUT, drain).await.is_err() {
        log::warn!("close handshake timed out");
    }
}

/// The single task owning the WebSocket stream: writes queued frames, fans
/// inbound payloads out, and tears everything down exactly once.
async fn connection_task(
    mut ws: WsStream,
    mut out_rx: mpsc::UnboundedReceiver<OutboundFrame>,
    fanout: FanOut<String>,
    drain: DrainGate,
    state_tx: Arc<watch::Sender<ConnectionState>>,
    token: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;

            _ = token.cancelled() => {
                log::debug!("connection aborted by caller");
                advance_state(&state_tx, ConnectionState::Closing);
                drain.close();
                fanout.cancel();
                close_socket(&mut ws).await;
                advance_state(&state_tx, ConnectionState::Closed);
                return;
            }

            frame = out_rx.recv() => {
                match frame {
                    Some(out) => {
                        let bytes = out.bytes;
                        if let Err(e) = ws.send(Message::Text(out.payload.into())).await {
                            log::warn!("send failed: {e}");
                            advance_state(&state_tx, ConnectionState::Errored);
                            drain.close();
                            fanout.fail(LedgerLinkError::ConnectionClosed {
                                cause: e.to_string(),
                            });
                            return;
                        }
                        drain.sub(bytes);
                    }
                    None => {
                        // The handle was dropped; close cleanly.
                        advance_state(&state_tx, ConnectionState::Closing);
                        drain.close();
                        fanout.cancel();
                        close_socket(&mut ws).await;
                        advance_state(&state_tx, ConnectionState::Closed);
                        return;
                    }
                }
            }

            frame = ws.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        fanout.publish(&text.to_string());
                    }
                    Some(Ok(Message::Binary(data))) => {
                        match String::from_utf8(data.to_vec()) {
                            Ok(text) => fanout.publish(&text),
                            Err(_) => log::warn!("dropping non-UTF-8 binary frame ({} bytes)", data.len()),
                        }
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        let _ = ws.send(Message::Pong(payload)).await;
                    }
                    Some(Ok(Message::Pong(_))) | Some(Ok(Message::Frame(_))) => {}
                    Some(Ok(Message::Close(close))) => {
                        let cause = match close {
                            Some(frame) => format!(
                                "closed by server: {} (code {})",
                                frame.reason, frame.code
                            ),
                            None => "closed by server".to_string(),
                        };
                        log::debug!("{cause}");
                        advance_state(&state_tx, ConnectionState::Closed);
                        drain.close();
                        fanout.fail(LedgerLinkError::ConnectionClosed { cause });
                        // tungstenite replies to the close frame on flush.
                        let _ = ws.close(None).await;
                        return;
                    }
                    Some(Err(e)) => {
                        log::warn!("socket error: {e}");
                        advance_state(&state_tx, ConnectionState::Errored);
                        drain.close();
                        fanout.fail(LedgerLinkError::ConnectionClosed {
                            cause: e.to_string(),
                        });
                        return;
                    }
                    None => {
                        advance_state(&state_tx, ConnectionState::Closed);
                        drain.close();
                        fanout.fail(LedgerLinkError::ConnectionClosed {
                            cause: "stream ended".to_string(),
                        });
                        return;
                    }
                }
            }
        }
    }
}
