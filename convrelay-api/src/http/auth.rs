//! Session token registration
//!
//! Front-end integrations call `/register` with their platform credential in
//! the Authorization header; the configured auth option decides whether that
//! credential is acceptable. On success the caller gets a short-lived
//! session token for the WebSocket and proxy endpoints.

use axum::{
    extract::State,
    http::{header::AUTHORIZATION, HeaderMap},
    Json,
};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::info;

use convrelay_core::config::{AuthConfig, AuthOption};

use crate::http::{AppError, AppResult, AppState};

/// Optional registration body carrying a user handle to stamp into the token
#[derive(Debug, Default, Deserialize)]
pub struct RegisterRequest {
    #[serde(default)]
    pub user: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct RegisterResponse {
    pub token: String,
}

/// Issue a session token after checking the Authorization header
pub async fn register_token(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> AppResult<Json<RegisterResponse>> {
    let authorization = headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok());

    if !check_auth(&state.auth, authorization) {
        return Err(AppError::unauthorized("Could not authenticate user"));
    }

    // Body is optional and tolerated when malformed, matching lenient
    // front-end integrations
    let user = serde_json::from_slice::<RegisterRequest>(&body)
        .ok()
        .and_then(|r| r.user);

    let token = state.tokens.issue(user.as_deref())?;

    info!(user = user.as_deref().unwrap_or(""), "Session token issued");

    Ok(Json(RegisterResponse { token }))
}

/// Check a platform credential against the configured auth option
fn check_auth(config: &AuthConfig, authorization: Option<&str>) -> bool {
    match config.option {
        AuthOption::Skip => true,
        AuthOption::Static => match (config.shared_secret.as_deref(), authorization) {
            (Some(secret), Some(header)) => !secret.is_empty() && header == secret,
            _ => false,
        },
    }
}
