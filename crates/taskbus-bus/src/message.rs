//! Message envelope: caller payload plus generated metadata.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Metadata attached to every published message.
///
/// `id`, `timestamp`, and `responseChannel` may be overridden by the
/// publisher; `channel` always reflects where the message was published.
/// Any other caller keys land in `extra`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageMetadata {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub channel: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_channel: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl MessageMetadata {
    /// Fresh metadata for a publish on `channel`.
    pub fn generate(channel: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            channel: channel.to_string(),
            response_channel: None,
            extra: Map::new(),
        }
    }

    /// Merge caller-supplied metadata over the generated values.
    pub fn merge(&mut self, overrides: Map<String, Value>) {
        for (key, value) in overrides {
            match key.as_str() {
                "id" => match value {
                    Value::String(id) => self.id = id,
                    other => self.id = other.to_string(),
                },
                "timestamp" => match serde_json::from_value::<DateTime<Utc>>(value) {
                    Ok(timestamp) => self.timestamp = timestamp,
                    Err(e) => tracing::debug!("Ignoring invalid timestamp override: {e}"),
                },
                "responseChannel" => {
                    self.response_channel = value.as_str().map(str::to_string);
                }
                "channel" => {
                    tracing::debug!("Ignoring channel override on '{}'", self.channel);
                }
                _ => {
                    self.extra.insert(key, value);
                }
            }
        }
    }
}

/// A published message as seen by subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub data: Value,
    pub metadata: MessageMetadata,
}

impl Message {
    pub fn new(channel: &str, data: Value, overrides: Map<String, Value>) -> Self {
        let mut metadata = MessageMetadata::generate(channel);
        metadata.merge(overrides);
        Self { data, metadata }
    }

    pub fn channel(&self) -> &str {
        &self.metadata.channel
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn map(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => Map::new(),
        }
    }

    #[test]
    fn test_generated_metadata() {
        let a = Message::new("agent:status", json!({"ok": true}), Map::new());
        let b = Message::new("agent:status", json!({"ok": true}), Map::new());
        assert_eq!(a.channel(), "agent:status");
        assert_ne!(a.metadata.id, b.metadata.id);
        assert!(a.metadata.response_channel.is_none());
    }

    #[test]
    fn test_merge_overrides() {
        let msg = Message::new(
            "agent:status",
            json!(1),
            map(json!({
                "id": "custom-id",
                "timestamp": "2026-01-01T00:00:00Z",
                "channel": "spoofed",
                "responseChannel": "reply:abc",
                "traceId": "t-1"
            })),
        );
        assert_eq!(msg.metadata.id, "custom-id");
        assert_eq!(msg.metadata.timestamp.to_rfc3339(), "2026-01-01T00:00:00+00:00");
        assert_eq!(msg.metadata.channel, "agent:status");
        assert_eq!(msg.metadata.response_channel.as_deref(), Some("reply:abc"));
        assert_eq!(msg.metadata.extra["traceId"], "t-1");
    }

    #[test]
    fn test_serialized_shape() {
        let msg = Message::new("a", json!(null), map(json!({"responseChannel": "reply:x", "k": 2})));
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["metadata"]["responseChannel"], "reply:x");
        assert_eq!(value["metadata"]["k"], 2);
        assert_eq!(value["metadata"]["channel"], "a");
    }
}
