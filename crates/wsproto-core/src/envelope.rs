//! Wire format: every frame is a JSON object `{"event": <string>, "data": <any>}`.

use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::EnvelopeError;

/// One decoded wire message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(default, deserialize_with = "null_as_empty")]
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

impl Envelope {
    pub fn new(event: impl Into<String>, data: Value) -> Self {
        Self {
            event: event.into(),
            data,
        }
    }
}

fn null_as_empty<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}

#[derive(Serialize)]
struct EnvelopeRef<'a, D: ?Sized> {
    event: &'a str,
    data: &'a D,
}

/// Serialize `{event, data}` to its canonical wire text.
pub fn encode<D>(event: &str, data: &D) -> Result<String, EnvelopeError>
where
    D: Serialize + ?Sized,
{
    serde_json::to_string(&EnvelopeRef { event, data }).map_err(EnvelopeError::Encode)
}

/// Parse a wire frame. Anything but a JSON object is a decode failure. A
/// missing, null or empty `event` yields [`EnvelopeError::EmptyEvent`].
pub fn decode(bytes: &[u8]) -> Result<Envelope, EnvelopeError> {
    let value: Value = serde_json::from_slice(bytes).map_err(EnvelopeError::Decode)?;
    if !value.is_object() {
        let err = <serde_json::Error as de::Error>::custom("frame is not a JSON object");
        return Err(EnvelopeError::Decode(err));
    }
    let envelope: Envelope = serde_json::from_value(value).map_err(EnvelopeError::Decode)?;
    if envelope.event.is_empty() {
        return Err(EnvelopeError::EmptyEvent);
    }
    Ok(envelope)
}
