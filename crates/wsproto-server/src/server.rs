use std::fmt;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use futures::FutureExt;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::trace::TraceLayer;
use wsproto_core::{ListenerFailure, ListenerId};

use crate::connection::Connection;
use crate::dispatcher::Dispatcher;
use crate::errors::{HookError, ServerError};
use crate::hook::{error_response, BeforeUpgrade, Context, DefaultBeforeUpgrade, RequestInfo};
use crate::transport::{KeepaliveConfig, Transport};

const INTERNAL_ERROR: &str = "internal server error";

/// Origin policy: returns true when the request may upgrade.
pub type OriginCheck = Arc<dyn Fn(&RequestInfo) -> bool + Send + Sync>;

/// Handshake settings applied to every upgrade.
#[derive(Clone)]
pub struct UpgraderConfig {
    /// Sub-protocols offered to clients, in preference order.
    pub protocols: Vec<String>,
    pub check_origin: OriginCheck,
    pub read_buffer_size: Option<usize>,
    pub write_buffer_size: Option<usize>,
    pub max_message_size: Option<usize>,
    pub max_frame_size: Option<usize>,
}

impl Default for UpgraderConfig {
    fn default() -> Self {
        Self {
            protocols: vec!["protoo".to_string()],
            check_origin: Arc::new(|_| true),
            read_buffer_size: None,
            write_buffer_size: None,
            max_message_size: None,
            max_frame_size: None,
        }
    }
}

impl fmt::Debug for UpgraderConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpgraderConfig")
            .field("protocols", &self.protocols)
            .field("read_buffer_size", &self.read_buffer_size)
            .field("write_buffer_size", &self.write_buffer_size)
            .field("max_message_size", &self.max_message_size)
            .field("max_frame_size", &self.max_frame_size)
            .finish_non_exhaustive()
    }
}

impl UpgraderConfig {
    pub fn with_origin_check<F>(mut self, check: F) -> Self
    where
        F: Fn(&RequestInfo) -> bool + Send + Sync + 'static,
    {
        self.check_origin = Arc::new(check);
        self
    }

    /// Accept only requests whose `Origin` header is in `origins`.
    /// Requests without an `Origin` header are accepted.
    pub fn with_allowed_origins<I, S>(self, origins: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let allowed: Vec<String> = origins.into_iter().map(Into::into).collect();
        self.with_origin_check(move |request| match request.origin() {
            Some(origin) => allowed.iter().any(|a| a == origin),
            None => true,
        })
    }

    fn apply(&self, upgrade: WebSocketUpgrade) -> WebSocketUpgrade {
        let mut upgrade = upgrade.protocols(self.protocols.clone());
        if let Some(size) = self.read_buffer_size {
            upgrade = upgrade.read_buffer_size(size);
        }
        if let Some(size) = self.write_buffer_size {
            upgrade = upgrade.write_buffer_size(size);
        }
        if let Some(size) = self.max_message_size {
            upgrade = upgrade.max_message_size(size);
        }
        if let Some(size) = self.max_frame_size {
            upgrade = upgrade.max_frame_size(size);
        }
        upgrade
    }
}

/// Server configuration.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Route serving the upgrade endpoint.
    pub path: String,
    pub keepalive: KeepaliveConfig,
    pub upgrader: UpgraderConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            path: "/stream".to_string(),
            keepalive: KeepaliveConfig::default(),
            upgrader: UpgraderConfig::default(),
        }
    }
}

/// State shared by the upgrade handler and every connection task.
struct Shared {
    hook: Arc<dyn BeforeUpgrade>,
    dispatcher: Arc<Dispatcher>,
    upgrader: UpgraderConfig,
    keepalive: KeepaliveConfig,
}

/// HTTP front end: runs the pre-upgrade hook, upgrades, and hands each
/// socket to the dispatcher.
pub struct WebSocketServer {
    config: ServerConfig,
    hook: Arc<dyn BeforeUpgrade>,
    dispatcher: Arc<Dispatcher>,
}

impl Default for WebSocketServer {
    fn default() -> Self {
        Self::new()
    }
}

impl WebSocketServer {
    pub fn new() -> Self {
        Self::with_config(ServerConfig::default())
    }

    pub fn with_config(config: ServerConfig) -> Self {
        Self {
            config,
            hook: Arc::new(DefaultBeforeUpgrade),
            dispatcher: Arc::new(Dispatcher::new()),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn set_before_upgrade(&mut self, hook: impl BeforeUpgrade) -> &mut Self {
        self.hook = Arc::new(hook);
        self
    }

    pub fn set_upgrader(&mut self, upgrader: UpgraderConfig) -> &mut Self {
        self.config.upgrader = upgrader;
        self
    }

    pub fn set_path(&mut self, path: impl Into<String>) -> &mut Self {
        self.config.path = path.into();
        self
    }

    pub fn set_keepalive(&mut self, keepalive: KeepaliveConfig) -> &mut Self {
        self.config.keepalive = keepalive;
        self
    }

    /// Register a callback run for every upgraded connection, before its
    /// first frame is read.
    pub fn on_connection<F, Fut>(&self, listener: F) -> ListenerId
    where
        F: Fn(Connection, RequestInfo) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        self.dispatcher.on_connection(listener)
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Build the axum router serving the upgrade endpoint.
    pub fn router(&self) -> Router {
        let path = if self.config.path.starts_with('/') {
            self.config.path.clone()
        } else {
            format!("/{}", self.config.path)
        };
        let shared = Arc::new(Shared {
            hook: Arc::clone(&self.hook),
            dispatcher: Arc::clone(&self.dispatcher),
            upgrader: self.config.upgrader.clone(),
            keepalive: self.config.keepalive,
        });

        Router::new()
            .route(&path, get(upgrade_handler))
            .with_state(shared)
            .layer(CatchPanicLayer::custom(panic_response))
            .layer(TraceLayer::new_for_http())
    }

    /// Serve plain WebSocket connections on `addr` until the listener fails.
    pub async fn listen_and_serve(&self, addr: &str) -> Result<(), ServerError> {
        let listener = bind(addr).await?;
        if let Ok(local) = listener.local_addr() {
            tracing::info!(addr = %local, path = %self.config.path, "WebSocket server listening");
        }
        axum::serve(listener, self.router())
            .await
            .map_err(ServerError::Serve)
    }

    /// Serve secure WebSocket connections with a PEM certificate and key.
    #[cfg(feature = "tls")]
    pub async fn listen_and_serve_tls(
        &self,
        addr: &str,
        cert_path: impl AsRef<std::path::Path>,
        key_path: impl AsRef<std::path::Path>,
    ) -> Result<(), ServerError> {
        use axum_server::tls_rustls::RustlsConfig;

        let tls = RustlsConfig::from_pem_file(cert_path, key_path)
            .await
            .map_err(ServerError::Tls)?;
        let socket_addr = resolve(addr).await?;
        tracing::info!(addr = %socket_addr, path = %self.config.path, "Secure WebSocket server listening");
        axum_server::bind_rustls(socket_addr, tls)
            .serve(self.router().into_make_service())
            .await
            .map_err(ServerError::Serve)
    }

    /// Bind `addr` and serve in the background. Returns a handle to the
    /// bound port and to shut it down.
    pub async fn start(&self, addr: &str) -> Result<ServerHandle, ServerError> {
        let listener = bind(addr).await?;
        let local_addr = listener.local_addr().map_err(ServerError::Serve)?;
        let shutdown = CancellationToken::new();
        let router = self.router();

        tracing::info!(port = local_addr.port(), path = %self.config.path, "WebSocket server started");

        let signal = shutdown.clone();
        let server = tokio::spawn(async move {
            let result = axum::serve(listener, router)
                .with_graceful_shutdown(async move { signal.cancelled().await })
                .await;
            if let Err(err) = result {
                tracing::error!(error = %err, "WebSocket server stopped");
            }
        });

        Ok(ServerHandle {
            port: local_addr.port(),
            local_addr,
            shutdown,
            _server: server,
        })
    }
}

/// Handle returned by [`WebSocketServer::start`].
pub struct ServerHandle {
    pub port: u16,
    pub local_addr: SocketAddr,
    shutdown: CancellationToken,
    _server: tokio::task::JoinHandle<()>,
}

impl ServerHandle {
    /// Stop accepting new requests.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

async fn bind(addr: &str) -> Result<TcpListener, ServerError> {
    TcpListener::bind(addr).await.map_err(|source| ServerError::Bind {
        addr: addr.to_string(),
        source,
    })
}

#[cfg(feature = "tls")]
async fn resolve(addr: &str) -> Result<SocketAddr, ServerError> {
    let bind_error = |source| ServerError::Bind {
        addr: addr.to_string(),
        source,
    };
    tokio::net::lookup_host(addr)
        .await
        .map_err(bind_error)?
        .next()
        .ok_or_else(|| bind_error(std::io::Error::new(std::io::ErrorKind::NotFound, "no address resolved")))
}

async fn upgrade_handler(
    State(shared): State<Arc<Shared>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    upgrade: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let request = RequestInfo::new(method, uri, headers);

    let outcome = AssertUnwindSafe(shared.hook.before_upgrade(&request))
        .catch_unwind()
        .await;
    let context = match outcome {
        Ok(Ok(context)) => context,
        Ok(Err(HookError::Fail(fail))) => {
            tracing::debug!(
                path = request.path(),
                status = fail.status.as_u16(),
                error = %fail,
                "Upgrade rejected by pre-upgrade hook"
            );
            return fail.into_response();
        }
        Ok(Err(HookError::Unexpected(err))) => {
            tracing::error!(path = request.path(), error = %err, "Pre-upgrade hook failed");
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, INTERNAL_ERROR, Vec::new());
        }
        Err(panic) => {
            let failure = ListenerFailure::from_panic(panic.as_ref());
            tracing::error!(path = request.path(), error = %failure, "Pre-upgrade hook panicked");
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, INTERNAL_ERROR, Vec::new());
        }
    };

    if !(shared.upgrader.check_origin)(&request) {
        tracing::warn!(origin = request.origin().unwrap_or_default(), "Request origin not allowed");
        return error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "websocket: request origin not allowed",
            Vec::new(),
        );
    }

    let upgrade = match upgrade {
        Ok(upgrade) => upgrade,
        Err(rejection) => {
            tracing::warn!(
                path = request.path(),
                status = rejection.status().as_u16(),
                error = %rejection.body_text(),
                "WebSocket handshake failed"
            );
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, rejection.body_text(), Vec::new());
        }
    };

    let task_shared = Arc::clone(&shared);
    shared
        .upgrader
        .apply(upgrade)
        .on_failed_upgrade(|err| tracing::warn!(error = %err, "WebSocket upgrade failed"))
        .on_upgrade(move |socket| serve_socket(task_shared, socket, context, request))
}

/// Post-upgrade lifetime of one socket: dispatch, then read until closed.
async fn serve_socket(shared: Arc<Shared>, socket: WebSocket, context: Context, request: RequestInfo) {
    let transport = Arc::new(Transport::new(socket, shared.keepalive));
    let connection_id = transport.id().clone();

    let session = async {
        let _conn = shared
            .dispatcher
            .process(context, Arc::clone(&transport), request)
            .await;
        transport.read().await;
    };

    if let Err(panic) = AssertUnwindSafe(session).catch_unwind().await {
        let failure = ListenerFailure::from_panic(panic.as_ref());
        tracing::error!(connection_id = %connection_id, error = %failure, "Connection task panicked");
        if !transport.is_closed() {
            transport.close().await;
        }
    }

    tracing::info!(connection_id = %connection_id, "Connection finished");
}

fn panic_response(panic: Box<dyn std::any::Any + Send + 'static>) -> Response {
    let failure = ListenerFailure::from_panic(panic.as_ref());
    tracing::error!(error = %failure, "Request handler panicked");
    error_response(StatusCode::INTERNAL_SERVER_ERROR, INTERNAL_ERROR, Vec::new())
}
