use wsproto_core::EnvelopeError;

use crate::hook::RaiseFail;

/// Failures of a single transport.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("websocket closed")]
    WriteClosed,

    #[error(transparent)]
    Encode(#[from] EnvelopeError),

    #[error("socket error: {0}")]
    Socket(#[source] axum::Error),

    #[error("keepalive ping failed: {0}")]
    PingPong(String),
}

impl TransportError {
    /// Short classification string for logging.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::WriteClosed => "write_closed",
            Self::Encode(_) => "encode",
            Self::Socket(_) => "socket",
            Self::PingPong(_) => "ping_pong",
        }
    }
}

/// Outcome of a pre-upgrade hook that did not produce a context.
#[derive(Debug, thiserror::Error)]
pub enum HookError {
    /// The hook rejected the request with its own status and message.
    #[error("raise fail usage: {0}")]
    Fail(RaiseFail),

    /// Anything else that went wrong inside the hook.
    #[error("pre-upgrade hook failed: {0}")]
    Unexpected(anyhow::Error),
}

impl From<RaiseFail> for HookError {
    fn from(fail: RaiseFail) -> Self {
        Self::Fail(fail)
    }
}

impl From<anyhow::Error> for HookError {
    fn from(err: anyhow::Error) -> Self {
        Self::Unexpected(err)
    }
}

/// Fatal failures of the listening socket.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("server stopped: {0}")]
    Serve(#[source] std::io::Error),

    #[error("failed to load TLS material: {0}")]
    Tls(#[source] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;

    #[test]
    fn write_closed_message() {
        assert_eq!(TransportError::WriteClosed.to_string(), "websocket closed");
        assert_eq!(TransportError::WriteClosed.error_kind(), "write_closed");
    }

    #[test]
    fn ping_pong_message_carries_detail() {
        let err = TransportError::PingPong("not written within 10s".into());
        assert_eq!(err.to_string(), "keepalive ping failed: not written within 10s");
        assert_eq!(err.error_kind(), "ping_pong");
    }

    #[test]
    fn raise_fail_converts_to_hook_error() {
        let err: HookError = RaiseFail::new("bad peer id", StatusCode::BAD_REQUEST).into();
        assert!(matches!(err, HookError::Fail(_)));
        assert_eq!(err.to_string(), "raise fail usage: bad peer id");
    }

    #[test]
    fn anyhow_converts_to_unexpected() {
        let err: HookError = anyhow::anyhow!("db down").into();
        assert!(matches!(err, HookError::Unexpected(_)));
    }
}
