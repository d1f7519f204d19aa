use chrono::Utc;
use nanoid::nanoid;
use serde::{Deserialize, Serialize};

/// Generate a 12-character nanoid for connection IDs
pub fn generate_id() -> String {
    nanoid!(12)
}

/// Marker segment of a location-qualified conversation identifier
const LOCATION_SEGMENT: &str = "/locations/";

/// Canonical conversation identifier.
///
/// Upstream identifiers may arrive location-qualified
/// (`projects/p/locations/l/conversations/c`) or already canonical
/// (`projects/p/conversations/c`). All registry keys, routing channels and
/// room names use the canonical form so every instance agrees on one key per
/// conversation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationId(pub String);

impl ConversationId {
    /// Canonicalize a raw identifier by dropping its location segment.
    ///
    /// Keeps the leading two and trailing two path components, so
    /// `projects/p/locations/l/conversations/c` becomes
    /// `projects/p/conversations/c`. Already-canonical identifiers pass
    /// through unchanged, which makes this idempotent.
    #[must_use]
    pub fn canonical(raw: &str) -> Self {
        if raw.contains(LOCATION_SEGMENT) {
            let parts: Vec<&str> = raw.split('/').collect();
            if parts.len() >= 4 {
                let joined = [
                    parts[0],
                    parts[1],
                    parts[parts.len() - 2],
                    parts[parts.len() - 1],
                ]
                .join("/");
                return Self(joined);
            }
        }
        Self(raw.to_string())
    }

    #[must_use]
    pub const fn from_string(id: String) -> Self {
        Self(id)
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ConversationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for ConversationId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Identifier of one running server instance, fixed for the process
/// lifetime.
///
/// Routing channels are partitioned by this value, so it must never contain
/// `:` (the channel name separator).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServerId(String);

impl ServerId {
    /// Generate the identity for this instance from the hostname, the start
    /// timestamp and a random suffix.
    #[must_use]
    pub fn generate() -> Self {
        let host = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "unknown".to_string())
            .replace(':', "_");

        Self(format!(
            "{host}-{}-{}",
            Utc::now().timestamp_millis(),
            nanoid!(6)
        ))
    }

    #[must_use]
    pub const fn from_string(id: String) -> Self {
        Self(id)
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ServerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
