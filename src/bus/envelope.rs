use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::error::{BusError, BusResult};

const TIMESTAMP_FIELD: &str = "timestamp_ms";

/// Message envelope carried by every bus backend
///
/// On the wire this is a flat JSON object: the payload fields plus
/// `timestamp_ms`. The bus never looks inside the payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(flatten)]
    pub payload: Map<String, Value>,
    pub timestamp_ms: i64,
}

impl Envelope {
    /// Wrap a serializable message
    ///
    /// A `timestamp_ms` field on the message becomes the envelope timestamp,
    /// otherwise the current time is used.
    pub fn wrap<T: Serialize>(topic: &str, message: &T) -> BusResult<Self> {
        let value = serde_json::to_value(message).map_err(|e| BusError::Serialization {
            topic: topic.to_string(),
            reason: e.to_string(),
        })?;

        let mut payload = match value {
            Value::Object(map) => map,
            other => {
                return Err(BusError::Serialization {
                    topic: topic.to_string(),
                    reason: format!("expected a JSON object, got {}", json_kind(&other)),
                })
            }
        };

        let timestamp_ms = payload
            .remove(TIMESTAMP_FIELD)
            .and_then(|v| v.as_i64())
            .unwrap_or_else(|| chrono::Utc::now().timestamp_millis());

        Ok(Self {
            payload,
            timestamp_ms,
        })
    }

    /// Decode the payload (including `timestamp_ms`) into a typed message
    pub fn decode<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        let mut map = self.payload.clone();
        map.insert(TIMESTAMP_FIELD.to_string(), Value::from(self.timestamp_ms));
        serde_json::from_value(Value::Object(map))
    }

    pub fn to_bytes(&self, topic: &str) -> BusResult<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| BusError::Serialization {
            topic: topic.to_string(),
            reason: e.to_string(),
        })
    }

    pub fn from_bytes(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
