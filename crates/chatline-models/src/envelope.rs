use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const NOTIFICATION_CHAT_CREATED: &str = "chat_created";
pub const NOTIFICATION_MESSAGE_CREATED: &str = "message_created";

/// Inbound publish body. Client metadata is accepted on the wire and dropped.
#[derive(Debug, Clone, Deserialize)]
pub struct InboundEnvelope {
    #[serde(default)]
    pub payload: Option<Map<String, Value>>,
    #[serde(default)]
    pub metadata: Option<Value>,
}

/// Envelope as stored in history and delivered to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageEnvelope {
    pub payload: Option<Map<String, Value>>,
    pub metadata: EnvelopeMetadata,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvelopeMetadata {
    pub originator_user_id: String,
    pub originator_client_id: String,
}

/// Server-originated event pushed by the notification publisher.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification<T> {
    pub payload: T,
    #[serde(rename = "type")]
    pub event_type: String,
}
