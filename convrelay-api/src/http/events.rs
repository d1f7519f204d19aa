//! Event-ingest webhooks
//!
//! The upstream feed pushes conversation activity here over HTTP POST, one
//! endpoint per topic. The endpoint name doubles as the event type clients
//! receive. Delivery is at-least-once upstream, so these handlers
//! acknowledge success for anything that is not a broker fault: returning an
//! error for malformed input would only trigger a retry storm for an event
//! that can never be processed.

use axum::{extract::State, http::StatusCode, response::IntoResponse, response::Response};
use bytes::Bytes;
use tracing::{debug, error};

use crate::http::AppState;

/// Receives human-agent-assist suggestion events
pub async fn human_agent_assistant_event(
    State(state): State<AppState>,
    body: Bytes,
) -> Response {
    ingest(&state, "human-agent-assistant-event", &body).await
}

/// Receives conversation lifecycle events
pub async fn conversation_lifecycle_event(
    State(state): State<AppState>,
    body: Bytes,
) -> Response {
    ingest(&state, "conversation-lifecycle-event", &body).await
}

/// Receives new message events
pub async fn new_message_event(State(state): State<AppState>, body: Bytes) -> Response {
    ingest(&state, "new-message-event", &body).await
}

async fn ingest(state: &AppState, data_type: &str, body: &[u8]) -> Response {
    match state.router.route(data_type, body).await {
        Ok(outcome) => {
            debug!(data_type = %data_type, outcome = ?outcome, "Inbound event processed");
            StatusCode::NO_CONTENT.into_response()
        }
        Err(e) => {
            // Broker fault: the one case the event source should retry
            error!(error = %e, data_type = %data_type, "Inbound event routing failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
