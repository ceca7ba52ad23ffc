//! The application-facing peer handle.

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Weak};

use bytes::Bytes;
use serde::Serialize;
use serde_json::Value;
use wsproto_core::{ConnectionId, Emitter, ListenerId};

use crate::errors::TransportError;
use crate::hook::Context;
use crate::transport::{CloseReason, Transport, CLOSE_EVENT, ERROR_EVENT, MESSAGE_EVENT};

/// Emitted when a frame carried an empty `event` field.
pub const EMPTY_EVENT: &str = "empty";

/// Payload of a connection event. Which variant arrives depends on the
/// event name: `message`, `error`, `close` and `empty` carry their own
/// variant, every other name carries [`ConnectionEvent::Application`].
#[derive(Clone, Debug, PartialEq)]
pub enum ConnectionEvent {
    Message { event: String, data: Value },
    Error(CloseReason),
    Close(CloseReason),
    Empty(Bytes),
    Application(Value),
}

struct ConnectionInner {
    transport: Arc<Transport>,
    context: Context,
    emitter: Emitter<(Connection, ConnectionEvent)>,
}

/// One upgraded WebSocket session.
///
/// Cloning is cheap and every clone refers to the same session.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl Connection {
    pub(crate) fn new(transport: Arc<Transport>, context: Context) -> Self {
        let emitter = Emitter::new();
        let connection_id = transport.id().clone();
        emitter.recover_with(move |event, listener, failure, _payload: &(Connection, ConnectionEvent)| {
            tracing::error!(
                connection_id = %connection_id,
                event,
                listener = %listener,
                error = %failure,
                "Connection listener failed"
            );
        });

        Self {
            inner: Arc::new(ConnectionInner {
                transport,
                context,
                emitter,
            }),
        }
    }

    /// Identifier shared with the underlying transport.
    pub fn uid(&self) -> &ConnectionId {
        self.inner.transport.id()
    }

    /// Values produced by the pre-upgrade hook.
    pub fn context(&self) -> &Context {
        &self.inner.context
    }

    /// Send `{event, data}` to the peer.
    pub async fn send<D>(&self, event: &str, data: &D) -> Result<(), TransportError>
    where
        D: Serialize + Sync + ?Sized,
    {
        self.inner.transport.write(event, data).await
    }

    pub async fn close(&self) {
        self.inner.transport.close().await;
    }

    pub fn is_closed(&self) -> bool {
        self.inner.transport.is_closed()
    }

    /// Every well-formed frame, before its named event.
    pub fn on_message<F, Fut>(&self, listener: F) -> ListenerId
    where
        F: Fn(Connection, String, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.inner.emitter.on(MESSAGE_EVENT, move |(conn, event)| {
            let fut = match event {
                ConnectionEvent::Message { event, data } => Some(listener(conn, event, data)),
                _ => None,
            };
            async move {
                if let Some(fut) = fut {
                    fut.await
                }
            }
        })
    }

    /// Read failures, and the peer's close after its `close` event.
    pub fn on_error<F, Fut>(&self, listener: F) -> ListenerId
    where
        F: Fn(Connection, CloseReason) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.inner.emitter.on(ERROR_EVENT, move |(conn, event)| {
            let fut = match event {
                ConnectionEvent::Error(reason) => Some(listener(conn, reason)),
                _ => None,
            };
            async move {
                if let Some(fut) = fut {
                    fut.await
                }
            }
        })
    }

    pub fn on_close<F, Fut>(&self, listener: F) -> ListenerId
    where
        F: Fn(Connection, CloseReason) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.inner.emitter.on(CLOSE_EVENT, move |(conn, event)| {
            let fut = match event {
                ConnectionEvent::Close(reason) => Some(listener(conn, reason)),
                _ => None,
            };
            async move {
                if let Some(fut) = fut {
                    fut.await
                }
            }
        })
    }

    /// Frames whose `event` was empty, with the raw payload.
    pub fn on_empty<F, Fut>(&self, listener: F) -> ListenerId
    where
        F: Fn(Connection, Bytes) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.inner.emitter.on(EMPTY_EVENT, move |(conn, event)| {
            let fut = match event {
                ConnectionEvent::Empty(raw) => Some(listener(conn, raw)),
                _ => None,
            };
            async move {
                if let Some(fut) = fut {
                    fut.await
                }
            }
        })
    }

    /// Application-defined event, called with the frame's `data`.
    pub fn on<F, Fut>(&self, name: impl Into<String>, listener: F) -> ListenerId
    where
        F: Fn(Connection, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.inner.emitter.on(name, move |(conn, event)| {
            let fut = match event {
                ConnectionEvent::Application(data) => Some(listener(conn, data)),
                _ => None,
            };
            async move {
                if let Some(fut) = fut {
                    fut.await
                }
            }
        })
    }

    pub fn off(&self, name: &str, id: ListenerId) -> bool {
        self.inner.emitter.off(name, id)
    }

    pub fn listener_count(&self, name: &str) -> usize {
        self.inner.emitter.listener_count(name)
    }

    pub(crate) async fn emit(&self, name: &str, event: ConnectionEvent) -> usize {
        self.inner.emitter.emit(name, (self.clone(), event)).await
    }

    pub(crate) fn downgrade(&self) -> WeakConnection {
        WeakConnection {
            inner: Arc::downgrade(&self.inner),
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("uid", self.uid())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Non-owning handle held by transport listeners so the transport does not
/// keep its own connection alive.
#[derive(Clone)]
pub(crate) struct WeakConnection {
    inner: Weak<ConnectionInner>,
}

impl WeakConnection {
    pub(crate) fn upgrade(&self) -> Option<Connection> {
        self.inner.upgrade().map(|inner| Connection { inner })
    }
}
