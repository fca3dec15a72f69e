//! Inbound frame envelope: `{"type": "...", "data": {"roomId": ..., ...}}`.

use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::channel::EventType;
use crate::error::{ClientError, Result};

/// Server-assigned room identifier (a UUID on the wire, kept opaque here).
pub type RoomId = String;

/// One decoded frame from the streaming endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub event_type: EventType,
    #[serde(default)]
    pub data: Value,
}

impl Envelope {
    pub fn new(event_type: EventType, data: Value) -> Self {
        Self { event_type, data }
    }

    /// Decode a text frame.
    pub fn parse(frame: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(frame)?;
        if !value.is_object() {
            return Err(ClientError::MalformedFrame("frame is not a JSON object".into()));
        }
        if value.get("type").and_then(Value::as_str).is_none() {
            return Err(ClientError::MalformedFrame("missing string field `type`".into()));
        }
        Ok(serde_json::from_value(value)?)
    }

    /// Room the event belongs to. Accepts string or numeric ids.
    pub fn room_id(&self) -> Option<RoomId> {
        match self.data.get("roomId")? {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }
}

/// Deserialize a field that the server sends either as a string or a number.
pub(crate) fn de_string_or_number<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(de::Error::custom(format!("expected string or number, got {other}"))),
    }
}
