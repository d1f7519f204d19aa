use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use convrelay_core::models::ConversationId;

use crate::channel::{channel_name, PublishRequest};
use crate::error::{Error, Result};
use crate::events::{PushEnvelope, RoutedEvent};
use crate::registry::ConversationRegistry;

/// What became of one inbound event.
///
/// Every variant is acknowledged as success to the event source; the
/// upstream feed delivers at-least-once, and bouncing bad input would only
/// produce an endless redelivery loop.
#[derive(Debug, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Published toward the owning instance's channel partition
    Routed { channel: String },
    /// No instance currently owns the conversation; nothing is listening
    Unowned,
    /// The event could not be understood and was absorbed
    Ignored(&'static str),
}

/// Inbound half of the delivery pipeline.
///
/// Takes a decoded push event, resolves the owning instance through the
/// registry and enqueues the routed envelope onto that instance's channel
/// partition. The registry lookup and the publish are not one transaction:
/// ownership may move in between, which at worst misroutes or drops a single
/// event. Past the lookup the publish is unconditional.
pub struct EventRouter {
    registry: Arc<dyn ConversationRegistry>,
    publish_tx: mpsc::Sender<PublishRequest>,
}

impl EventRouter {
    #[must_use]
    pub fn new(
        registry: Arc<dyn ConversationRegistry>,
        publish_tx: mpsc::Sender<PublishRequest>,
    ) -> Self {
        Self {
            registry,
            publish_tx,
        }
    }

    /// Route one inbound push event toward whichever instance owns its
    /// conversation.
    ///
    /// Malformed input and ownerless conversations are absorbed as no-ops.
    /// Only broker faults surface as errors, for the caller's own handling;
    /// the event source is acknowledged either way.
    pub async fn route(&self, data_type: &str, body: &[u8]) -> Result<RouteOutcome> {
        let envelope: PushEnvelope = match serde_json::from_slice(body) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(error = %e, data_type = %data_type, "Unparseable push envelope");
                return Ok(RouteOutcome::Ignored("unparseable push envelope"));
            }
        };

        let Some(message) = envelope.message else {
            warn!(data_type = %data_type, "Push envelope has no message");
            return Ok(RouteOutcome::Ignored("missing message"));
        };

        let Some(encoded) = message.data else {
            warn!(data_type = %data_type, "Push message has no data");
            return Ok(RouteOutcome::Ignored("missing message data"));
        };

        let decoded = match BASE64.decode(encoded.as_bytes()) {
            Ok(decoded) => decoded,
            Err(e) => {
                warn!(error = %e, data_type = %data_type, "Push data is not valid base64");
                return Ok(RouteOutcome::Ignored("data is not valid base64"));
            }
        };

        let text = match String::from_utf8(decoded) {
            Ok(text) => text,
            Err(e) => {
                warn!(error = %e, data_type = %data_type, "Push data is not valid UTF-8");
                return Ok(RouteOutcome::Ignored("data is not valid UTF-8"));
            }
        };

        let payload: serde_json::Value = match serde_json::from_str(&text) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, data_type = %data_type, "Push data is not valid JSON");
                return Ok(RouteOutcome::Ignored("data is not valid JSON"));
            }
        };

        let Some(raw_conversation) = payload.get("conversation").and_then(|v| v.as_str())
        else {
            warn!(data_type = %data_type, "Cannot extract conversation id from push event");
            return Ok(RouteOutcome::Ignored("missing conversation field"));
        };

        let conversation = ConversationId::canonical(raw_conversation);

        if !self.registry.exists(&conversation).await? {
            // Expected steady state: the conversation has no live session
            // anywhere right now
            debug!(
                conversation = %conversation,
                data_type = %data_type,
                "No owner for conversation, dropping event"
            );
            return Ok(RouteOutcome::Unowned);
        }

        let Some(owner) = self.registry.owner(&conversation).await? else {
            // The entry vanished between the two reads; same no-op
            return Ok(RouteOutcome::Unowned);
        };

        let event = RoutedEvent {
            conversation_name: conversation.as_str().to_string(),
            data: text,
            data_type: data_type.to_string(),
            ack_time: Utc::now(),
            publish_time: message.publish_time.unwrap_or_default(),
            message_id: message.message_id.unwrap_or_default(),
        };

        let channel = channel_name(&owner, &conversation);
        match self.publish_tx.try_send(PublishRequest {
            channel: channel.clone(),
            event,
        }) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                // At-most-once: under broker outage the queue fills and the
                // event is gone
                warn!(
                    channel = %channel,
                    "Publish queue full, dropping routed event"
                );
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                return Err(Error::ChannelClosed("publish queue".to_string()));
            }
        }

        debug!(
            conversation = %conversation,
            channel = %channel,
            data_type = %data_type,
            "Inbound event routed"
        );

        Ok(RouteOutcome::Routed { channel })
    }
}
