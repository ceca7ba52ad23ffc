//! Transport-independent building blocks: connection identifiers, the
//! `{event, data}` envelope codec and the failure-isolating event emitter.

pub mod emitter;
pub mod envelope;
pub mod errors;
pub mod ids;

pub use emitter::Emitter;
pub use envelope::Envelope;
pub use errors::{EnvelopeError, ListenerFailure};
pub use ids::{ConnectionId, ListenerId};
