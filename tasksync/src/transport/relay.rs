//! WebSocket connection to the `TaskSync` relay server.
//!
//! The relay connection serves two purposes: it is the signaling channel
//! for negotiating direct links, and it is the always-on fallback path that
//! carries every task mutation to the rest of the room.
//!
//! [`RelayClient::connect`] dials the relay, waits for the `Welcome` frame
//! carrying this client's connection id, and spawns one reader and one
//! writer task. Outbound frames go through a cloneable [`RelayOutbound`].

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use tasksync_proto::relay::{self, RelayMessage};

use super::{PeerId, TransportError};

/// Type alias for the write half of a WebSocket connection.
type WsSender = futures_util::stream::SplitSink<
    WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>,
    Message,
>;

/// Type alias for the read half of a WebSocket connection.
type WsReader =
    futures_util::stream::SplitStream<WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>>;

/// Timeouts and buffer sizes for a relay connection.
#[derive(Debug, Clone, Copy)]
pub struct RelayOptions {
    /// How long to wait for the WebSocket handshake.
    pub connect_timeout: Duration,
    /// How long to wait for the `Welcome` frame after connecting.
    pub welcome_timeout: Duration,
    /// Capacity of the inbound message channel.
    pub channel_capacity: usize,
}

impl Default for RelayOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            welcome_timeout: Duration::from_secs(5),
            channel_capacity: 256,
        }
    }
}

/// Cloneable handle for queueing frames to the relay.
#[derive(Debug, Clone)]
pub struct RelayOutbound {
    tx: mpsc::UnboundedSender<RelayMessage>,
}

impl RelayOutbound {
    /// Wraps a raw channel. The receiving half is whatever drains to the
    /// relay; tests use this to observe outbound frames directly.
    #[must_use]
    pub const fn new(tx: mpsc::UnboundedSender<RelayMessage>) -> Self {
        Self { tx }
    }

    /// Queues a frame for the relay.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::ConnectionClosed`] if the writer has exited.
    pub fn send(&self, msg: RelayMessage) -> Result<(), TransportError> {
        self.tx
            .send(msg)
            .map_err(|_| TransportError::ConnectionClosed)
    }
}

/// A live connection to the relay server.
pub struct RelayClient {
    /// Connection id the relay assigned to us.
    local_id: PeerId,
    /// The relay server URL (ws:// or wss://).
    relay_url: String,
    outbound: RelayOutbound,
    /// Frames received by the background reader task.
    incoming: mpsc::Receiver<RelayMessage>,
    /// Whether the WebSocket connection to the relay is active.
    connected: Arc<AtomicBool>,
    reader_handle: JoinHandle<()>,
    writer_handle: JoinHandle<()>,
}

impl RelayClient {
    /// Connect to a relay server and wait for its `Welcome`.
    ///
    /// # Errors
    ///
    /// - [`TransportError::Timeout`] if connecting or the welcome times out.
    /// - [`TransportError::Unreachable`] if the relay refuses the connection.
    /// - [`TransportError::ConnectionClosed`] if the relay hangs up first.
    /// - [`TransportError::Io`] for TLS, HTTP, or protocol failures.
    pub async fn connect(relay_url: &str, options: RelayOptions) -> Result<Self, TransportError> {
        let (ws_stream, _response) =
            tokio::time::timeout(options.connect_timeout, connect_async(relay_url))
                .await
                .map_err(|_| {
                    tracing::warn!(url = relay_url, "relay WebSocket connect timed out");
                    TransportError::Timeout
                })?
                .map_err(|e| {
                    tracing::warn!(url = relay_url, error = %e, "relay WebSocket connect failed");
                    map_ws_connect_error(e)
                })?;

        let (ws_sender, mut ws_reader) = ws_stream.split();

        let local_id = tokio::time::timeout(options.welcome_timeout, wait_for_welcome(&mut ws_reader))
            .await
            .map_err(|_| {
                tracing::warn!(url = relay_url, "relay welcome timed out");
                TransportError::Timeout
            })??;
        tracing::info!(conn_id = %local_id, url = relay_url, "connected to relay");

        let connected = Arc::new(AtomicBool::new(true));
        let (in_tx, in_rx) = mpsc::channel(options.channel_capacity.max(1));
        let (out_tx, out_rx) = mpsc::unbounded_channel();

        let reader_handle = tokio::spawn(reader_loop(ws_reader, in_tx, Arc::clone(&connected)));
        let writer_handle = tokio::spawn(writer_loop(ws_sender, out_rx, Arc::clone(&connected)));

        Ok(Self {
            local_id,
            relay_url: relay_url.to_string(),
            outbound: RelayOutbound::new(out_tx),
            incoming: in_rx,
            connected,
            reader_handle,
            writer_handle,
        })
    }

    /// Return the connection id the relay assigned.
    #[must_use]
    pub const fn local_id(&self) -> &PeerId {
        &self.local_id
    }

    /// Return the relay server URL this client is connected to.
    #[must_use]
    pub fn relay_url(&self) -> &str {
        &self.relay_url
    }

    /// A handle for sending frames to the relay.
    #[must_use]
    pub fn outbound(&self) -> RelayOutbound {
        self.outbound.clone()
    }

    /// Whether the relay connection is still up.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    /// Receive the next frame from the relay.
    ///
    /// Returns `None` once the connection is gone and every buffered frame
    /// has been read.
    pub async fn recv(&mut self) -> Option<RelayMessage> {
        self.incoming.recv().await
    }
}

impl Drop for RelayClient {
    fn drop(&mut self) {
        self.reader_handle.abort();
        self.writer_handle.abort();
    }
}

/// Reads frames until the relay's `Welcome` arrives.
async fn wait_for_welcome(ws_reader: &mut WsReader) -> Result<PeerId, TransportError> {
    while let Some(frame) = ws_reader.next().await {
        match frame {
            Ok(Message::Binary(data)) => match relay::decode(&data) {
                Ok(RelayMessage::Welcome { conn_id }) if !conn_id.is_empty() => {
                    return Ok(PeerId::new(conn_id));
                }
                Ok(other) => {
                    tracing::warn!(kind = other.kind(), "unexpected frame before welcome");
                    return Err(TransportError::Io(std::io::Error::other(
                        "unexpected frame before welcome",
                    )));
                }
                Err(e) => {
                    tracing::warn!(error = %e, "malformed welcome frame");
                    return Err(TransportError::Io(std::io::Error::other(format!(
                        "malformed welcome: {e}"
                    ))));
                }
            },
            Ok(Message::Close(_)) => {
                tracing::warn!("relay server closed connection before welcome");
                return Err(TransportError::ConnectionClosed);
            }
            Ok(_) => {
                // Ping/pong/text frames carry nothing for us.
            }
            Err(e) => {
                tracing::warn!(error = %e, "WebSocket error before welcome");
                return Err(TransportError::Io(std::io::Error::other(format!(
                    "WebSocket error before welcome: {e}"
                ))));
            }
        }
    }
    Err(TransportError::ConnectionClosed)
}

/// Background task that decodes inbound frames into the `tx` channel.
///
/// Malformed frames are logged and skipped; the task does not disconnect on
/// bad data. Sets `connected` to `false` when the WebSocket closes.
async fn reader_loop(
    mut ws_reader: WsReader,
    tx: mpsc::Sender<RelayMessage>,
    connected: Arc<AtomicBool>,
) {
    while let Some(msg_result) = ws_reader.next().await {
        match msg_result {
            Ok(Message::Binary(data)) => match relay::decode(&data) {
                Ok(msg) => {
                    if tx.send(msg).await.is_err() {
                        // Receiver dropped, client is gone.
                        break;
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "malformed relay frame, skipping");
                }
            },
            Ok(Message::Close(_)) => {
                tracing::info!("relay WebSocket closed by server");
                break;
            }
            Ok(Message::Ping(_) | Message::Pong(_) | Message::Text(_) | Message::Frame(_)) => {}
            Err(e) => {
                tracing::warn!(error = %e, "relay WebSocket read error");
                break;
            }
        }
    }
    connected.store(false, Ordering::Relaxed);
    tracing::info!("relay reader task exiting");
}

/// Background task that encodes queued frames onto the WebSocket.
async fn writer_loop(
    mut ws_sender: WsSender,
    mut rx: mpsc::UnboundedReceiver<RelayMessage>,
    connected: Arc<AtomicBool>,
) {
    while let Some(msg) = rx.recv().await {
        let bytes = match relay::encode(&msg) {
            Ok(b) => b,
            Err(e) => {
                tracing::error!(error = %e, kind = msg.kind(), "failed to encode relay frame");
                continue;
            }
        };
        if let Err(e) = ws_sender.send(Message::Binary(bytes.into())).await {
            tracing::warn!(error = %e, "relay send failed");
            break;
        }
    }
    connected.store(false, Ordering::Relaxed);
    let _ = ws_sender.close().await;
}

/// Map a `tokio_tungstenite` connection error to a [`TransportError`].
fn map_ws_connect_error(err: tokio_tungstenite::tungstenite::Error) -> TransportError {
    use tokio_tungstenite::tungstenite::Error as WsError;
    match err {
        WsError::Io(io_err) => {
            if io_err.kind() == std::io::ErrorKind::ConnectionRefused
                || io_err.kind() == std::io::ErrorKind::AddrNotAvailable
            {
                TransportError::Unreachable(PeerId::new("relay"))
            } else {
                TransportError::Io(io_err)
            }
        }
        WsError::Tls(_) => TransportError::Io(std::io::Error::other(format!("TLS error: {err}"))),
        WsError::Http(response) => TransportError::Io(std::io::Error::other(format!(
            "relay HTTP error: status {}",
            response.status()
        ))),
        other => TransportError::Io(std::io::Error::other(format!(
            "relay connection error: {other}"
        ))),
    }
}
