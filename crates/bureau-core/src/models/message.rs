//! Inter-office message model.
//!
//! The serialized field set is the wire contract consumed by every office:
//! `{id, type, priority, sender_office, target_office, payload,
//! correlation_id, timestamp, ttl_seconds, require_ack, retry_count,
//! max_retries}`. Enum values travel as lowercase strings.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::BureauError;

/// Message delivery priority. Carried on the wire but not structurally
/// enforced by the router.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessagePriority {
    Urgent,
    High,
    Normal,
    Low,
}

impl MessagePriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Urgent => "urgent",
            Self::High => "high",
            Self::Normal => "normal",
            Self::Low => "low",
        }
    }
}

/// Closed set of inter-office message types. Handler dispatch is resolved
/// against this enum once at office registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Request,
    Response,
    Broadcast,
    Notification,
    Error,
    Heartbeat,
    Workflow,
    MemoryShare,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Request => "request",
            Self::Response => "response",
            Self::Broadcast => "broadcast",
            Self::Notification => "notification",
            Self::Error => "error",
            Self::Heartbeat => "heartbeat",
            Self::Workflow => "workflow",
            Self::MemoryShare => "memory_share",
        }
    }
}

/// Default message expiry in seconds.
pub const DEFAULT_MESSAGE_TTL_SECS: i64 = 300;

/// Default retry cap for request/response exchanges.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// A single inter-office message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    #[serde(rename = "type")]
    pub message_type: MessageType,
    pub priority: MessagePriority,
    pub sender_office: String,
    /// `None` routes to the broadcast channel.
    pub target_office: Option<String>,
    #[serde(default)]
    pub payload: Value,
    /// Links a response back to its originating request.
    pub correlation_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub ttl_seconds: i64,
    pub require_ack: bool,
    pub retry_count: u32,
    pub max_retries: u32,
}

impl Message {
    /// Create a message with defaults for the non-routing fields.
    pub fn new(
        message_type: MessageType,
        priority: MessagePriority,
        sender_office: impl Into<String>,
        target_office: Option<String>,
        payload: Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            message_type,
            priority,
            sender_office: sender_office.into(),
            target_office,
            payload,
            correlation_id: None,
            timestamp: Utc::now(),
            ttl_seconds: DEFAULT_MESSAGE_TTL_SECS,
            require_ack: false,
            retry_count: 0,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    /// Build a request carrying `{action, params}` that expects a reply.
    pub fn request(
        sender_office: impl Into<String>,
        target_office: impl Into<String>,
        action: &str,
        params: Value,
        priority: MessagePriority,
    ) -> Self {
        let mut msg = Self::new(
            MessageType::Request,
            priority,
            sender_office,
            Some(target_office.into()),
            serde_json::json!({ "action": action, "params": params }),
        );
        msg.require_ack = true;
        msg
    }

    /// Build the reply to a request, preserving the correlation id and
    /// reversing the routing. Failure replies travel as `error` messages.
    pub fn response_to(request: &Message, payload: Value, success: bool) -> Self {
        let mut msg = Self::new(
            if success {
                MessageType::Response
            } else {
                MessageType::Error
            },
            request.priority,
            request
                .target_office
                .clone()
                .unwrap_or_else(|| "system".to_string()),
            Some(request.sender_office.clone()),
            payload,
        );
        msg.correlation_id = Some(request.id.clone());
        msg
    }

    /// Build a broadcast notification carrying `{event_type, data}`.
    pub fn broadcast(
        sender_office: impl Into<String>,
        event_type: &str,
        data: Value,
        priority: MessagePriority,
    ) -> Self {
        Self::new(
            MessageType::Broadcast,
            priority,
            sender_office,
            None,
            serde_json::json!({ "event_type": event_type, "data": data }),
        )
    }

    /// Age-based expiry. A non-positive TTL never expires.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.ttl_seconds > 0 && (now - self.timestamp).num_seconds() > self.ttl_seconds
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, BureauError> {
        serde_json::to_vec(self).map_err(Into::into)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, BureauError> {
        serde_json::from_slice(bytes).map_err(Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_wire_field_set() {
        let msg = Message::request("banker", "economist", "forecast", serde_json::json!({}), MessagePriority::Normal);
        let value = serde_json::to_value(&msg).unwrap();
        let obj = value.as_object().unwrap();

        let expected = [
            "id",
            "type",
            "priority",
            "sender_office",
            "target_office",
            "payload",
            "correlation_id",
            "timestamp",
            "ttl_seconds",
            "require_ack",
            "retry_count",
            "max_retries",
        ];
        assert_eq!(obj.len(), expected.len());
        for field in expected {
            assert!(obj.contains_key(field), "missing wire field: {}", field);
        }
        assert_eq!(obj["type"], "request");
        assert_eq!(obj["priority"], "normal");
    }

    #[test]
    fn test_response_reverses_routing() {
        let request = Message::request("banker", "economist", "forecast", serde_json::json!({}), MessagePriority::High);
        let response = Message::response_to(&request, serde_json::json!({"result": 1}), true);

        assert_eq!(response.message_type, MessageType::Response);
        assert_eq!(response.sender_office, "economist");
        assert_eq!(response.target_office.as_deref(), Some("banker"));
        assert_eq!(response.correlation_id.as_deref(), Some(request.id.as_str()));
        assert_eq!(response.priority, MessagePriority::High);

        let failure = Message::response_to(&request, serde_json::json!({"error": "nope"}), false);
        assert_eq!(failure.message_type, MessageType::Error);
    }

    #[test]
    fn test_expiry() {
        let mut msg = Message::new(
            MessageType::Notification,
            MessagePriority::Low,
            "system",
            None,
            Value::Null,
        );
        msg.ttl_seconds = 60;
        let now = msg.timestamp;
        assert!(!msg.is_expired(now + Duration::seconds(30)));
        assert!(msg.is_expired(now + Duration::seconds(61)));

        msg.ttl_seconds = 0;
        assert!(!msg.is_expired(now + Duration::days(30)));
    }

    #[test]
    fn test_roundtrip() {
        let msg = Message::broadcast("system", "office_online", serde_json::json!({"office_id": "tarot"}), MessagePriority::Normal);
        let bytes = msg.to_bytes().unwrap();
        let parsed = Message::from_bytes(&bytes).unwrap();
        assert_eq!(parsed.id, msg.id);
        assert_eq!(parsed.message_type, MessageType::Broadcast);
        assert!(parsed.target_office.is_none());
    }

    #[test]
    fn test_memory_share_wire_value() {
        assert_eq!(MessageType::MemoryShare.as_str(), "memory_share");
        let parsed: MessageType = serde_json::from_str("\"memory_share\"").unwrap();
        assert_eq!(parsed, MessageType::MemoryShare);
    }
}
