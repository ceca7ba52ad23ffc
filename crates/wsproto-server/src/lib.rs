pub mod connection;
pub mod dispatcher;
pub mod errors;
pub mod hook;
pub mod server;
pub mod transport;

pub use connection::{Connection, ConnectionEvent, EMPTY_EVENT};
pub use dispatcher::{Dispatcher, CONNECTION_EVENT};
pub use errors::{HookError, ServerError, TransportError};
pub use hook::{error_response, fail, BeforeUpgrade, Context, DefaultBeforeUpgrade, RaiseFail, RequestInfo};
pub use server::{OriginCheck, ServerConfig, ServerHandle, UpgraderConfig, WebSocketServer};
pub use transport::{CloseReason, KeepaliveConfig, Transport, PING_PERIOD, PONG_WAIT, WRITE_WAIT};
pub use wsproto_core::{ConnectionId, Envelope, EnvelopeError, ListenerFailure, ListenerId};
