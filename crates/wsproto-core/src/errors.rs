use std::any::Any;

/// Errors produced by the envelope codec.
///
/// `Decode` and `EmptyEvent` are kept apart because callers react to them
/// differently: malformed payloads are dropped, empty events are surfaced.
#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("failed to encode envelope: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("malformed envelope: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("empty event")]
    EmptyEvent,
}

impl EnvelopeError {
    /// Short classification string for logging.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Encode(_) => "encode",
            Self::Decode(_) => "decode",
            Self::EmptyEvent => "empty_event",
        }
    }
}

/// A listener that panicked while handling an emitted event.
#[derive(Clone, Debug, thiserror::Error)]
#[error("listener panicked: {message}")]
pub struct ListenerFailure {
    pub message: String,
}

impl ListenerFailure {
    pub fn from_panic(payload: &(dyn Any + Send)) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "non-string panic payload".to_string()
        };
        Self { message }
    }
}
