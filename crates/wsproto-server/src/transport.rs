//! Socket wrapper: serialized writes, the read loop and the keepalive
//! state machine.
//!
//! The read loop multiplexes three sources: frames forwarded by a background
//! reader task, the ping ticker, and the shutdown signal raised by
//! [`Transport::close`]. Lifecycle outcomes are published on the transport's
//! own emitter as `message`, `error` and `close` events.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket};
use bytes::Bytes;
use futures::{Sink, SinkExt, Stream, StreamExt};
use serde::Serialize;
use tokio::sync::{mpsc, Mutex};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use wsproto_core::{envelope, ConnectionId, Emitter, ListenerId};

use crate::errors::TransportError;

/// Time allowed to write a control frame or close the socket.
pub const WRITE_WAIT: Duration = Duration::from_secs(10);

/// Time allowed between two inbound frames.
pub const PONG_WAIT: Duration = Duration::from_secs(10);

/// Pings go out at 90% of the pong wait so the peer can answer in time.
pub const PING_PERIOD: Duration = Duration::from_secs(9);

const INBOUND_QUEUE: usize = 64;

pub(crate) const MESSAGE_EVENT: &str = "message";
pub(crate) const ERROR_EVENT: &str = "error";
pub(crate) const CLOSE_EVENT: &str = "close";

/// Keepalive timings. The defaults are the module constants.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KeepaliveConfig {
    pub pong_wait: Duration,
    pub ping_period: Duration,
    pub write_wait: Duration,
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self {
            pong_wait: PONG_WAIT,
            ping_period: PING_PERIOD,
            write_wait: WRITE_WAIT,
        }
    }
}

impl KeepaliveConfig {
    /// Derive the ping period (9/10) from a pong wait.
    pub fn from_pong_wait(pong_wait: Duration) -> Self {
        Self {
            pong_wait,
            ping_period: pong_wait * 9 / 10,
            write_wait: WRITE_WAIT,
        }
    }
}

/// Close code and reason carried by `error` and `close` events.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CloseReason {
    pub code: u16,
    pub reason: String,
}

impl CloseReason {
    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }

    /// A close frame without a payload maps to 1005 (no status received).
    pub fn from_frame(frame: Option<CloseFrame>) -> Self {
        match frame {
            Some(frame) => Self::new(frame.code, frame.reason.as_str()),
            None => Self::new(close_code::STATUS, ""),
        }
    }
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.code, self.reason)
    }
}

#[derive(Clone, Debug)]
pub(crate) enum TransportEvent {
    Message(Bytes),
    Error(CloseReason),
    Close(CloseReason),
}

type FrameSink = Pin<Box<dyn Sink<Message, Error = axum::Error> + Send>>;
type FrameStream = Pin<Box<dyn Stream<Item = Result<Message, axum::Error>> + Send>>;

struct Writer {
    sink: FrameSink,
    closed: bool,
}

enum Inbound {
    Frame(Bytes),
    Closed(CloseReason),
    Failed(CloseReason),
}

pub struct Transport {
    id: ConnectionId,
    writer: Mutex<Writer>,
    reader: parking_lot::Mutex<Option<FrameStream>>,
    emitter: Emitter<TransportEvent>,
    keepalive: KeepaliveConfig,
    shutdown: CancellationToken,
}

impl Transport {
    pub(crate) fn new(socket: WebSocket, keepalive: KeepaliveConfig) -> Self {
        let (sink, stream) = socket.split();
        Self::from_parts(ConnectionId::new(), sink, stream, keepalive)
    }

    pub(crate) fn from_parts<S, R>(id: ConnectionId, sink: S, stream: R, keepalive: KeepaliveConfig) -> Self
    where
        S: Sink<Message, Error = axum::Error> + Send + 'static,
        R: Stream<Item = Result<Message, axum::Error>> + Send + 'static,
    {
        let emitter = Emitter::new();
        let connection_id = id.clone();
        emitter.recover_with(move |event, listener, failure, _payload: &TransportEvent| {
            tracing::error!(
                connection_id = %connection_id,
                event,
                listener = %listener,
                error = %failure,
                "Transport listener failed"
            );
        });

        Self {
            id,
            writer: Mutex::new(Writer {
                sink: Box::pin(sink),
                closed: false,
            }),
            reader: parking_lot::Mutex::new(Some(Box::pin(stream))),
            emitter,
            keepalive,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    pub(crate) fn on_message<F, Fut>(&self, listener: F) -> ListenerId
    where
        F: Fn(Bytes) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.emitter.on(MESSAGE_EVENT, move |event| {
            let fut = match event {
                TransportEvent::Message(bytes) => Some(listener(bytes)),
                _ => None,
            };
            async move {
                if let Some(fut) = fut {
                    fut.await
                }
            }
        })
    }

    pub(crate) fn on_error<F, Fut>(&self, listener: F) -> ListenerId
    where
        F: Fn(CloseReason) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.emitter.on(ERROR_EVENT, move |event| {
            let fut = match event {
                TransportEvent::Error(reason) => Some(listener(reason)),
                _ => None,
            };
            async move {
                if let Some(fut) = fut {
                    fut.await
                }
            }
        })
    }

    pub(crate) fn on_close<F, Fut>(&self, listener: F) -> ListenerId
    where
        F: Fn(CloseReason) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.emitter.on(CLOSE_EVENT, move |event| {
            let fut = match event {
                TransportEvent::Close(reason) => Some(listener(reason)),
                _ => None,
            };
            async move {
                if let Some(fut) = fut {
                    fut.await
                }
            }
        })
    }

    /// Encode `{event, data}` and send it as one text frame.
    pub async fn write<D>(&self, event: &str, data: &D) -> Result<(), TransportError>
    where
        D: Serialize + ?Sized,
    {
        let mut writer = self.writer.lock().await;
        if writer.closed {
            return Err(TransportError::WriteClosed);
        }
        let payload = envelope::encode(event, data)?;
        tracing::debug!(connection_id = %self.id, event, bytes = payload.len(), "Sending frame");
        writer
            .sink
            .send(Message::Text(payload.into()))
            .await
            .map_err(TransportError::Socket)
    }

    /// Close the socket. Only the first call has an effect.
    pub async fn close(&self) {
        let mut writer = self.writer.lock().await;
        if writer.closed {
            tracing::warn!(connection_id = %self.id, "Transport already closed");
            return;
        }
        tracing::info!(connection_id = %self.id, "Closing transport");
        self.shutdown_writer(&mut writer).await;
    }

    async fn close_quietly(&self) {
        let mut writer = self.writer.lock().await;
        if !writer.closed {
            self.shutdown_writer(&mut writer).await;
        }
    }

    async fn shutdown_writer(&self, writer: &mut Writer) {
        writer.closed = true;
        self.shutdown.cancel();
        match tokio::time::timeout(self.keepalive.write_wait, writer.sink.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                tracing::debug!(connection_id = %self.id, error = %err, "Socket close failed");
            }
            Err(_) => {
                tracing::debug!(connection_id = %self.id, "Socket close timed out");
            }
        }
    }

    async fn ping(&self) -> Result<(), TransportError> {
        let mut writer = self.writer.lock().await;
        if writer.closed {
            return Err(TransportError::WriteClosed);
        }
        let wait = self.keepalive.write_wait;
        match tokio::time::timeout(wait, writer.sink.send(Message::Ping(Bytes::new()))).await {
            Ok(Ok(())) => {
                tracing::trace!(connection_id = %self.id, "Sent ping");
                Ok(())
            }
            Ok(Err(err)) => Err(TransportError::PingPong(err.to_string())),
            Err(_) => Err(TransportError::PingPong(format!("not written within {wait:?}"))),
        }
    }

    /// Run the read loop until the socket fails, the peer closes, a ping
    /// cannot be written, or [`close`](Self::close) is called. The transport
    /// is closed when this returns.
    pub(crate) async fn read(&self) {
        let stream = self.reader.lock().take();
        let Some(stream) = stream else {
            tracing::warn!(connection_id = %self.id, "Read loop already started");
            return;
        };

        let (tx, mut rx) = mpsc::channel(INBOUND_QUEUE);
        let pump = tokio::spawn(pump_frames(stream, tx, self.keepalive.pong_wait));

        let mut ticker = tokio::time::interval(self.keepalive.ping_period);
        ticker.tick().await; // consume first immediate tick
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => {
                    tracing::debug!(connection_id = %self.id, "Read loop stopped by close");
                    let reason = CloseReason::new(close_code::POLICY, "use of closed connection");
                    self.emitter.emit(ERROR_EVENT, TransportEvent::Error(reason)).await;
                    break;
                }
                inbound = rx.recv() => match inbound {
                    Some(Inbound::Frame(bytes)) => {
                        tracing::trace!(connection_id = %self.id, bytes = bytes.len(), "Received frame");
                        self.emitter.emit(MESSAGE_EVENT, TransportEvent::Message(bytes)).await;
                    }
                    Some(Inbound::Closed(reason)) => {
                        tracing::info!(
                            connection_id = %self.id,
                            code = reason.code,
                            reason = %reason.reason,
                            "Peer closed connection"
                        );
                        self.emitter.emit(CLOSE_EVENT, TransportEvent::Close(reason.clone())).await;
                        self.close().await;
                        self.emitter.emit(ERROR_EVENT, TransportEvent::Error(reason)).await;
                        break;
                    }
                    Some(Inbound::Failed(reason)) => {
                        tracing::warn!(
                            connection_id = %self.id,
                            code = reason.code,
                            reason = %reason.reason,
                            "Read failed"
                        );
                        self.emitter.emit(ERROR_EVENT, TransportEvent::Error(reason)).await;
                        break;
                    }
                    None => break,
                },
                _ = ticker.tick() => {
                    if let Err(err) = self.ping().await {
                        tracing::error!(
                            connection_id = %self.id,
                            error = %err,
                            kind = err.error_kind(),
                            "Keepalive ping failed"
                        );
                        let reason = CloseReason::new(close_code::POLICY, err.to_string());
                        self.emitter.emit(ERROR_EVENT, TransportEvent::Error(reason)).await;
                        break;
                    }
                }
            }
        }

        pump.abort();
        self.close_quietly().await;
    }
}

/// Forward frames until the stream ends or fails. Every frame, control
/// frames included, moves the read deadline forward.
async fn pump_frames(mut stream: FrameStream, tx: mpsc::Sender<Inbound>, pong_wait: Duration) {
    let mut deadline = Instant::now() + pong_wait;
    loop {
        let next = match tokio::time::timeout_at(deadline, stream.next()).await {
            Ok(next) => next,
            Err(_) => {
                let reason = format!("read deadline exceeded after {pong_wait:?}");
                let _ = tx.send(Inbound::Failed(CloseReason::new(close_code::POLICY, reason))).await;
                return;
            }
        };

        let message = match next {
            Some(Ok(message)) => message,
            Some(Err(err)) => {
                let reason = CloseReason::new(close_code::POLICY, err.to_string());
                let _ = tx.send(Inbound::Failed(reason)).await;
                return;
            }
            None => {
                let reason = CloseReason::new(close_code::ABNORMAL, "unexpected EOF");
                let _ = tx.send(Inbound::Failed(reason)).await;
                return;
            }
        };

        deadline = Instant::now() + pong_wait;

        let inbound = match message {
            Message::Text(text) => Inbound::Frame(Bytes::copy_from_slice(text.as_str().as_bytes())),
            Message::Binary(bytes) => Inbound::Frame(bytes),
            Message::Close(frame) => {
                let _ = tx.send(Inbound::Closed(CloseReason::from_frame(frame))).await;
                return;
            }
            Message::Pong(_) => {
                tracing::trace!("Received pong");
                continue;
            }
            Message::Ping(_) => continue, // axum answers pings itself
        };

        if tx.send(inbound).await.is_err() {
            return;
        }
    }
}
