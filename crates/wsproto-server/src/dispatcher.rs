//! Turns an upgraded transport into a [`Connection`] and routes its frames.

use std::future::Future;
use std::sync::Arc;

use bytes::Bytes;
use wsproto_core::{envelope, Emitter, Envelope, EnvelopeError, ListenerId};

use crate::connection::{Connection, ConnectionEvent, EMPTY_EVENT};
use crate::hook::{Context, RequestInfo};
use crate::transport::{Transport, CLOSE_EVENT, ERROR_EVENT, MESSAGE_EVENT};

/// Emitted once per upgraded request, before the read loop starts.
pub const CONNECTION_EVENT: &str = "connection";

pub struct Dispatcher {
    emitter: Emitter<(Connection, RequestInfo)>,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher {
    pub fn new() -> Self {
        let emitter = Emitter::new();
        emitter.recover_with(|event, listener, failure, (conn, _request): &(Connection, RequestInfo)| {
            tracing::error!(
                connection_id = %conn.uid(),
                event,
                listener = %listener,
                error = %failure,
                "Connection callback failed, closing connection"
            );
            let conn = conn.clone();
            tokio::spawn(async move { conn.close().await });
        });
        Self { emitter }
    }

    /// Register a callback run for every new connection.
    pub fn on_connection<F, Fut>(&self, listener: F) -> ListenerId
    where
        F: Fn(Connection, RequestInfo) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.emitter
            .on(CONNECTION_EVENT, move |(conn, request)| listener(conn, request))
    }

    pub fn connection_listeners(&self) -> usize {
        self.emitter.listener_count(CONNECTION_EVENT)
    }

    /// Build the connection for `transport`, wire its events and announce it.
    pub(crate) async fn process(
        &self,
        context: Context,
        transport: Arc<Transport>,
        request: RequestInfo,
    ) -> Connection {
        let conn = Connection::new(Arc::clone(&transport), context);
        let weak = conn.downgrade();

        let on_error = weak.clone();
        transport.on_error(move |reason| {
            let conn = on_error.upgrade();
            async move {
                if let Some(conn) = conn {
                    conn.emit(ERROR_EVENT, ConnectionEvent::Error(reason)).await;
                }
            }
        });

        let on_close = weak.clone();
        transport.on_close(move |reason| {
            let conn = on_close.upgrade();
            async move {
                if let Some(conn) = conn {
                    conn.emit(CLOSE_EVENT, ConnectionEvent::Close(reason)).await;
                }
            }
        });

        transport.on_message(move |raw| {
            let conn = weak.upgrade();
            async move {
                if let Some(conn) = conn {
                    route_frame(&conn, raw).await;
                }
            }
        });

        tracing::info!(
            connection_id = %conn.uid(),
            path = request.path(),
            "Connection established"
        );
        self.emitter
            .emit(CONNECTION_EVENT, (conn.clone(), request))
            .await;
        conn
    }
}

async fn route_frame(conn: &Connection, raw: Bytes) {
    match envelope::decode(&raw) {
        Ok(Envelope { event, data }) => {
            tracing::debug!(connection_id = %conn.uid(), event = %event, "Received event");
            let message = ConnectionEvent::Message {
                event: event.clone(),
                data: data.clone(),
            };
            conn.emit(MESSAGE_EVENT, message).await;
            conn.emit(&event, ConnectionEvent::Application(data)).await;
        }
        Err(EnvelopeError::EmptyEvent) => {
            tracing::warn!(connection_id = %conn.uid(), bytes = raw.len(), "Frame with empty event");
            conn.emit(EMPTY_EVENT, ConnectionEvent::Empty(raw)).await;
        }
        Err(err) => {
            tracing::error!(
                connection_id = %conn.uid(),
                error = %err,
                kind = err.error_kind(),
                "Dropping undecodable frame"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use axum::extract::ws::Message;
    use axum::http::{HeaderMap, Method};
    use futures::{stream, Stream, StreamExt};
    use parking_lot::Mutex;
    use serde_json::Value;
    use wsproto_core::ConnectionId;

    use crate::transport::tests::{text, RecordingSink};
    use crate::transport::{CloseReason, KeepaliveConfig};

    fn request() -> RequestInfo {
        RequestInfo::new(Method::GET, "/stream?peer=abc".parse().unwrap(), HeaderMap::new())
    }

    fn transport<R>(stream: R) -> Arc<Transport>
    where
        R: Stream<Item = Result<Message, axum::Error>> + Send + 'static,
    {
        transport_with(RecordingSink::default(), stream)
    }

    fn transport_with<R>(sink: RecordingSink, stream: R) -> Arc<Transport>
    where
        R: Stream<Item = Result<Message, axum::Error>> + Send + 'static,
    {
        Arc::new(Transport::from_parts(
            ConnectionId::new(),
            sink,
            stream,
            KeepaliveConfig::default(),
        ))
    }

    fn record_errors(dispatcher: &Dispatcher) -> Arc<Mutex<Vec<CloseReason>>> {
        let errors = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&errors);
        dispatcher.on_connection(move |conn, _request| {
            let log = Arc::clone(&log);
            conn.on_error(move |_conn, reason| {
                let log = Arc::clone(&log);
                async move { log.lock().push(reason) }
            });
            async {}
        });
        errors
    }

    async fn wait_closed(conn: &Connection) {
        tokio::time::timeout(Duration::from_secs(1), async {
            while !conn.is_closed() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn named_and_generic_listeners_receive_event() {
        let dispatcher = Dispatcher::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        let seen = Arc::clone(&log);
        dispatcher.on_connection(move |conn, _request| {
            let named = Arc::clone(&seen);
            conn.on("ping-app", move |_conn, data| {
                let named = Arc::clone(&named);
                async move { named.lock().push(format!("named:{data}")) }
            });
            let generic = Arc::clone(&seen);
            conn.on_message(move |_conn, event, data| {
                let generic = Arc::clone(&generic);
                async move { generic.lock().push(format!("message:{event}:{data}")) }
            });
            async {}
        });

        let transport = transport(stream::iter(vec![text(r#"{"event":"ping-app","data":{"x":1}}"#)]));
        let _conn = dispatcher
            .process(Context::new(), Arc::clone(&transport), request())
            .await;
        transport.read().await;

        assert_eq!(
            *log.lock(),
            vec![r#"message:ping-app:{"x":1}"#, r#"named:{"x":1}"#]
        );
    }

    #[tokio::test]
    async fn connection_event_carries_context_and_request() {
        let dispatcher = Dispatcher::new();
        let seen = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&seen);
        dispatcher.on_connection(move |conn, request| {
            let slot = Arc::clone(&slot);
            async move {
                let peer = conn.context().get_str("peer_id").map(str::to_owned);
                let query = request.query_param("peer").map(str::to_owned);
                *slot.lock() = Some((peer, query));
            }
        });

        let context = Context::new().with("peer_id", "abc");
        let conn = dispatcher
            .process(context, transport(stream::pending()), request())
            .await;

        assert_eq!(
            *seen.lock(),
            Some((Some("abc".to_owned()), Some("abc".to_owned())))
        );
        assert!(!conn.is_closed());
    }

    #[tokio::test]
    async fn empty_event_goes_to_empty_listeners() {
        let dispatcher = Dispatcher::new();
        let raw = Arc::new(Mutex::new(Vec::new()));
        let messages = Arc::new(Mutex::new(0));

        let (raw_log, message_count) = (Arc::clone(&raw), Arc::clone(&messages));
        dispatcher.on_connection(move |conn, _request| {
            let raw_log = Arc::clone(&raw_log);
            conn.on_empty(move |_conn, bytes| {
                let raw_log = Arc::clone(&raw_log);
                async move { raw_log.lock().push(bytes) }
            });
            let message_count = Arc::clone(&message_count);
            conn.on_message(move |_conn, _event, _data| {
                let message_count = Arc::clone(&message_count);
                async move { *message_count.lock() += 1 }
            });
            async {}
        });

        let frame = r#"{"event":"","data":1}"#;
        let transport = transport(stream::iter(vec![text(frame)]));
        let _conn = dispatcher
            .process(Context::new(), Arc::clone(&transport), request())
            .await;
        transport.read().await;

        assert_eq!(raw.lock().len(), 1);
        assert_eq!(&raw.lock()[0][..], frame.as_bytes());
        assert_eq!(*messages.lock(), 0);
    }

    #[tokio::test]
    async fn malformed_frame_is_dropped() {
        let dispatcher = Dispatcher::new();
        let events = Arc::new(Mutex::new(Vec::<String>::new()));
        let log = Arc::clone(&events);
        dispatcher.on_connection(move |conn, _request| {
            let log = Arc::clone(&log);
            conn.on_message(move |_conn, event, _data| {
                let log = Arc::clone(&log);
                async move { log.lock().push(event) }
            });
            async {}
        });

        let frames = stream::iter(vec![
            text("{not json"),
            text(r#"["ping-app",{"x":1}]"#),
            text(r#"{"event":"after","data":null}"#),
        ]);
        let transport = transport(frames);
        let _conn = dispatcher
            .process(Context::new(), Arc::clone(&transport), request())
            .await;
        transport.read().await;

        assert_eq!(*events.lock(), vec!["after"]);
    }

    #[tokio::test]
    async fn transport_errors_reach_connection() {
        let dispatcher = Dispatcher::new();
        let errors = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&errors);
        dispatcher.on_connection(move |conn, _request| {
            let log = Arc::clone(&log);
            conn.on_error(move |conn, reason| {
                let log = Arc::clone(&log);
                async move { log.lock().push((conn.uid().clone(), reason)) }
            });
            async {}
        });

        let transport = transport(stream::empty());
        let conn = dispatcher
            .process(Context::new(), Arc::clone(&transport), request())
            .await;
        transport.read().await;

        let errors = errors.lock();
        assert_eq!(errors.len(), 1);
        assert_eq!(&errors[0].0, conn.uid());
        assert_eq!(errors[0].1, CloseReason::new(1006, "unexpected EOF"));
    }

    #[tokio::test]
    async fn local_close_reaches_connection_error_listeners() {
        let dispatcher = Dispatcher::new();
        let errors = record_errors(&dispatcher);

        let transport = transport(stream::pending());
        let conn = dispatcher
            .process(Context::new(), Arc::clone(&transport), request())
            .await;
        let reader = tokio::spawn(async move { transport.read().await });

        tokio::task::yield_now().await;
        conn.close().await;
        tokio::time::timeout(Duration::from_secs(1), reader).await.unwrap().unwrap();

        assert_eq!(
            *errors.lock(),
            vec![CloseReason::new(1008, "use of closed connection")]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn ping_failure_reaches_connection_error_listeners() {
        let dispatcher = Dispatcher::new();
        let errors = record_errors(&dispatcher);

        let sink = RecordingSink {
            fail_pings: true,
            ..Default::default()
        };
        let transport = transport_with(sink, stream::pending());
        let conn = dispatcher
            .process(Context::new(), Arc::clone(&transport), request())
            .await;
        transport.read().await;

        let errors = errors.lock();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].code, 1008);
        assert!(errors[0].reason.starts_with("keepalive ping failed"), "got: {}", errors[0].reason);
        assert!(conn.is_closed());
    }

    #[tokio::test]
    async fn panicking_connection_callback_closes_connection() {
        let dispatcher = Dispatcher::new();
        let later = Arc::new(Mutex::new(false));
        dispatcher.on_connection(|_conn, _request| async { panic!("callback exploded") });
        let flag = Arc::clone(&later);
        dispatcher.on_connection(move |_conn, _request| {
            let flag = Arc::clone(&flag);
            async move { *flag.lock() = true }
        });

        let conn = dispatcher
            .process(Context::new(), transport(stream::pending()), request())
            .await;

        wait_closed(&conn).await;
        assert!(*later.lock());
    }

    #[tokio::test]
    async fn dropped_connection_stops_routing() {
        let dispatcher = Dispatcher::new();
        let count = Arc::new(Mutex::new(0));
        let counter = Arc::clone(&count);
        dispatcher.on_connection(move |conn, _request| {
            let counter = Arc::clone(&counter);
            conn.on_message(move |_conn, _event, _data: Value| {
                let counter = Arc::clone(&counter);
                async move { *counter.lock() += 1 }
            });
            async {}
        });

        let transport = transport(
            stream::iter(vec![text(r#"{"event":"x","data":1}"#)]).chain(stream::pending()),
        );
        let conn = dispatcher
            .process(Context::new(), Arc::clone(&transport), request())
            .await;
        drop(conn);

        let _ = tokio::time::timeout(Duration::from_millis(50), transport.read()).await;
        assert_eq!(*count.lock(), 0);
    }
}
