use crate::error::GatewayError;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use sharp_core::gateway_ipc::{decode_frame, encode_frame, Frame};
use std::borrow::Cow;
use std::fmt;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};
use url::Url;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const CLOSE_WRITE_TIMEOUT: Duration = Duration::from_secs(1);
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);
const OUTBOUND_CAPACITY: usize = 256;

pub const CONNECT_TIMEOUT_REASON: &str = "connect timeout";

/// Normalizes a configured gateway address into a websocket URL.
///
/// `http`/`https` map to `ws`/`wss`, a bare `host:port` gets `ws://`, and `ws` is upgraded to
/// `wss` when `secure_context` is set.
pub fn gateway_ws_url(raw: &str, secure_context: bool) -> Result<Url, GatewayError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(GatewayError::InvalidUrl("empty url".to_string()));
    }
    let candidate = if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("ws://{trimmed}")
    };
    let mut url =
        Url::parse(&candidate).map_err(|err| GatewayError::InvalidUrl(format!("{raw}: {err}")))?;
    let scheme = match url.scheme() {
        "http" => "ws",
        "https" | "wss" => "wss",
        "ws" if secure_context => "wss",
        "ws" => "ws",
        other => {
            return Err(GatewayError::InvalidUrl(format!(
                "unsupported scheme {other}"
            )))
        }
    };
    if url.scheme() != scheme {
        url.set_scheme(scheme)
            .map_err(|_| GatewayError::InvalidUrl(format!("cannot use scheme {scheme}")))?;
    }
    Ok(url)
}

#[derive(Debug)]
pub struct SocketEvent {
    /// Socket the event belongs to; events from a replaced socket are stale.
    pub generation: u64,
    pub event: TransportEvent,
}

#[derive(Debug)]
pub enum TransportEvent {
    Open(TransportHandle),
    Frame(Frame),
    ParseError(String),
    /// Inbound ping or pong.
    Heartbeat,
    Closed { code: Option<u16>, reason: String },
}

/// Write side of an open socket.
///
/// Frames are queued for a writer task, so `send` and `close` never wait on the network. Dropping
/// the handle stops the reader; the writer drains what is queued and exits.
pub struct TransportHandle {
    outbound: mpsc::Sender<Message>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
    open: bool,
    max_frame_bytes: usize,
}

impl fmt::Debug for TransportHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportHandle")
            .field("open", &self.open)
            .field("max_frame_bytes", &self.max_frame_bytes)
            .finish_non_exhaustive()
    }
}

impl TransportHandle {
    pub fn is_open(&self) -> bool {
        self.open
    }

    /// Marks the socket closed by the peer so `close` does not write to it.
    pub fn mark_closed(&mut self) {
        self.open = false;
    }

    /// Queues a frame. A full queue means the peer stopped reading; the frame is refused.
    pub fn send(&mut self, frame: &Frame) -> Result<(), GatewayError> {
        if !self.open {
            return Err(GatewayError::NotOpen);
        }
        let text = encode_frame(frame, self.max_frame_bytes)?;
        match self.outbound.try_send(Message::Text(text)) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                Err(GatewayError::Transport("send queue full".to_string()))
            }
            Err(TrySendError::Closed(_)) => {
                self.open = false;
                Err(GatewayError::Transport("socket writer stopped".to_string()))
            }
        }
    }

    pub fn close(&mut self, code: u16, reason: &str) {
        if !self.open {
            return;
        }
        self.open = false;
        let frame = CloseFrame {
            code: CloseCode::from(code),
            reason: Cow::Owned(reason.to_string()),
        };
        if self
            .outbound
            .try_send(Message::Close(Some(frame)))
            .is_err()
        {
            debug!(event = "gateway_close_dropped");
            self.writer.abort();
        }
    }
}

impl Drop for TransportHandle {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// Dials `url` in the background. The outcome arrives on `events` as `Open` or `Closed`; a dial
/// or upgrade that takes longer than `connect_timeout` ends as `Closed`.
pub fn open(
    generation: u64,
    url: Url,
    events: mpsc::Sender<SocketEvent>,
    max_frame_bytes: usize,
    connect_timeout: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let dialed = tokio::time::timeout(connect_timeout, connect_async(url.as_str())).await;
        let ws = match dialed {
            Ok(Ok((ws, _response))) => ws,
            Ok(Err(err)) => {
                send_closed(&events, generation, err.to_string()).await;
                return;
            }
            Err(_) => {
                warn!(event = "gateway_dial_timeout", generation, url = %url);
                send_closed(&events, generation, CONNECT_TIMEOUT_REASON.to_string()).await;
                return;
            }
        };
        let (sink, stream) = ws.split();
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let writer = tokio::spawn(write_loop(generation, sink, outbound_rx, events.clone()));
        let (ready_tx, ready_rx) = oneshot::channel();
        let reader_events = events.clone();
        let reader = tokio::spawn(async move {
            if ready_rx.await.is_err() {
                return;
            }
            read_loop(generation, stream, reader_events, max_frame_bytes).await;
        });
        let handle = TransportHandle {
            outbound: outbound_tx,
            reader,
            writer,
            open: true,
            max_frame_bytes,
        };
        if events
            .send(SocketEvent {
                generation,
                event: TransportEvent::Open(handle),
            })
            .await
            .is_ok()
        {
            let _ = ready_tx.send(());
        }
    })
}

async fn send_closed(events: &mpsc::Sender<SocketEvent>, generation: u64, reason: String) {
    let _ = events
        .send(SocketEvent {
            generation,
            event: TransportEvent::Closed { code: None, reason },
        })
        .await;
}

async fn write_loop(
    generation: u64,
    mut sink: SplitSink<WsStream, Message>,
    mut outbound: mpsc::Receiver<Message>,
    events: mpsc::Sender<SocketEvent>,
) {
    while let Some(message) = outbound.recv().await {
        let closing = matches!(message, Message::Close(_));
        let limit = if closing { CLOSE_WRITE_TIMEOUT } else { WRITE_TIMEOUT };
        let failure = match tokio::time::timeout(limit, sink.send(message)).await {
            Ok(Ok(())) if closing => break,
            Ok(Ok(())) => continue,
            Ok(Err(err)) => err.to_string(),
            Err(_) => "write timed out".to_string(),
        };
        if closing {
            debug!(event = "gateway_close_failed", generation, error = %failure);
            return;
        }
        warn!(event = "gateway_write_failed", generation, error = %failure);
        send_closed(&events, generation, failure).await;
        return;
    }
    let _ = tokio::time::timeout(CLOSE_WRITE_TIMEOUT, sink.close()).await;
}

async fn read_loop(
    generation: u64,
    mut stream: SplitStream<WsStream>,
    events: mpsc::Sender<SocketEvent>,
    max_frame_bytes: usize,
) {
    let mut close_code = None;
    let mut close_reason = String::from("connection closed");
    while let Some(message) = stream.next().await {
        let event = match message {
            Ok(Message::Text(text)) => match decode_frame(&text, max_frame_bytes) {
                Ok(frame) => TransportEvent::Frame(frame),
                Err(err) => TransportEvent::ParseError(err.to_string()),
            },
            Ok(Message::Close(frame)) => {
                if let Some(frame) = frame {
                    close_code = Some(u16::from(frame.code));
                    close_reason = frame.reason.to_string();
                }
                break;
            }
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => TransportEvent::Heartbeat,
            Ok(_) => continue,
            Err(err) => {
                warn!(event = "gateway_socket_error", generation, error = %err);
                close_reason = err.to_string();
                break;
            }
        };
        if events.send(SocketEvent { generation, event }).await.is_err() {
            return;
        }
    }
    let _ = events
        .send(SocketEvent {
            generation,
            event: TransportEvent::Closed {
                code: close_code,
                reason: close_reason,
            },
        })
        .await;
}
