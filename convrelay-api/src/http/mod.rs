// Module: http
// HTTP/WebSocket surface: session transport, event-ingest webhooks, token
// registration, upstream proxy and health probes

pub mod auth;
pub mod error;
pub mod events;
pub mod health;
pub mod proxy;
pub mod websocket;

use axum::{
    http::HeaderValue,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;

use convrelay_core::auth::TokenService;
use convrelay_core::config::{AuthConfig, CorsConfig};
use convrelay_routing::{EventRouter, OwnershipManager, RoomHub};

pub use error::{AppError, AppResult};
pub use proxy::UpstreamClient;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub tokens: Arc<TokenService>,
    pub auth: AuthConfig,
    pub ownership: Arc<OwnershipManager>,
    pub hub: Arc<RoomHub>,
    pub router: Arc<EventRouter>,
    pub upstream: Arc<UpstreamClient>,
}

/// Create the HTTP router with all routes
pub fn create_router(state: AppState, cors: &CorsConfig) -> Router {
    let cors_layer = if cors.allowed_origins.is_empty() {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
    } else {
        let origins: Vec<HeaderValue> = cors
            .allowed_origins
            .iter()
            .filter_map(|origin| origin.parse().ok())
            .collect();
        CorsLayer::new()
            .allow_origin(AllowOrigin::list(origins))
            .allow_methods(Any)
            .allow_headers(Any)
    };

    Router::new()
        // Health check endpoints (for monitoring probes)
        .merge(health::create_health_router())
        // Session token registration
        .route("/register", post(auth::register_token))
        // Event-ingest webhooks, one per upstream topic
        .route(
            "/human-agent-assistant-event",
            post(events::human_agent_assistant_event),
        )
        .route(
            "/conversation-lifecycle-event",
            post(events::conversation_lifecycle_event),
        )
        .route("/new-message-event", post(events::new_message_event))
        // WebSocket session transport
        .route("/ws", get(websocket::websocket_handler))
        // Upstream API passthrough
        .route(
            "/{version}/projects/{project}/locations/{location}/{*rest}",
            get(proxy::forward)
                .post(proxy::forward)
                .patch(proxy::forward),
        )
        .layer(cors_layer)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
