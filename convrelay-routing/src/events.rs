use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Push-delivery envelope received from the upstream event feed.
///
/// The feed delivers at-least-once over HTTP POST; every field is optional
/// here because a malformed envelope must be absorbed, never bounced back
/// for redelivery.
#[derive(Debug, Deserialize)]
pub struct PushEnvelope {
    #[serde(default)]
    pub message: Option<PushMessage>,
    #[serde(default)]
    pub subscription: Option<String>,
}

/// Inner message of a push envelope; `data` is base64-encoded JSON
#[derive(Debug, Deserialize)]
pub struct PushMessage {
    #[serde(default)]
    pub data: Option<String>,
    #[serde(default, rename = "messageId")]
    pub message_id: Option<String>,
    #[serde(default, rename = "publishTime")]
    pub publish_time: Option<String>,
}

/// Envelope carried over the routing channel from the instance that accepted
/// an external event to the instance owning the conversation's sessions.
///
/// Immutable once published; the owning instance forwards it verbatim to
/// every connected session in the conversation's room.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutedEvent {
    /// Canonical conversation identifier
    pub conversation_name: String,
    /// Decoded upstream payload, kept as the original JSON text
    pub data: String,
    /// Event name the session transport emits to clients
    pub data_type: String,
    /// When this backend accepted the event, for latency measurement
    pub ack_time: DateTime<Utc>,
    /// Publish timestamp reported by the upstream feed
    #[serde(default)]
    pub publish_time: String,
    /// Message identifier reported by the upstream feed
    #[serde(default)]
    pub message_id: String,
}
