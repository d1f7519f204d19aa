//! Authenticated passthrough to the upstream conversational-AI API
//!
//! Front-end clients hold a session token, never an upstream credential, so
//! their API calls come through here. The handler verifies the session
//! token, rebuilds the regional upstream URL from the request path and
//! relays body and status both ways. No shaping of the forwarded request or
//! response beyond that.

use axum::{
    body::Body,
    extract::{OriginalUri, Path, State},
    http::{
        header::{AUTHORIZATION, CONTENT_TYPE},
        HeaderMap, Method, StatusCode,
    },
    response::Response,
};
use bytes::Bytes;
use std::time::Duration;
use tracing::{debug, error};

use convrelay_core::config::UpstreamConfig;
use convrelay_core::{Error, Result};

use crate::http::{AppError, AppResult, AppState};

/// HTTP client for the upstream API, regional-endpoint aware
#[derive(Clone)]
pub struct UpstreamClient {
    http: reqwest::Client,
    scheme: String,
    host: String,
    bearer_token: Option<String>,
}

impl UpstreamClient {
    pub fn from_config(config: &UpstreamConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()
            .map_err(|e| Error::Configuration(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self {
            http,
            scheme: config.scheme.clone(),
            host: config.host.clone(),
            bearer_token: config.bearer_token.clone(),
        })
    }

    /// Build the upstream URL for a location and original path+query.
    ///
    /// The global location uses the bare API host; any other location is
    /// served from its regional endpoint.
    #[must_use]
    pub fn target_url(&self, location: &str, path_and_query: &str) -> String {
        let path = path_and_query.trim_start_matches('/');
        if location == "global" {
            format!("{}://{}/{}", self.scheme, self.host, path)
        } else {
            format!("{}://{}-{}/{}", self.scheme, location, self.host, path)
        }
    }

    pub async fn get(
        &self,
        location: &str,
        path_and_query: &str,
    ) -> reqwest::Result<reqwest::Response> {
        let url = self.target_url(location, path_and_query);
        debug!(url = %url, "Forwarding GET upstream");
        self.request(self.http.get(url)).await
    }

    pub async fn post(
        &self,
        location: &str,
        path_and_query: &str,
        body: Bytes,
    ) -> reqwest::Result<reqwest::Response> {
        let url = self.target_url(location, path_and_query);
        debug!(url = %url, "Forwarding POST upstream");
        self.request(
            self.http
                .post(url)
                .header(CONTENT_TYPE, "application/json")
                .body(body),
        )
        .await
    }

    pub async fn patch(
        &self,
        location: &str,
        path_and_query: &str,
        body: Bytes,
    ) -> reqwest::Result<reqwest::Response> {
        let url = self.target_url(location, path_and_query);
        debug!(url = %url, "Forwarding PATCH upstream");
        self.request(
            self.http
                .patch(url)
                .header(CONTENT_TYPE, "application/json")
                .body(body),
        )
        .await
    }

    async fn request(
        &self,
        mut builder: reqwest::RequestBuilder,
    ) -> reqwest::Result<reqwest::Response> {
        if let Some(token) = &self.bearer_token {
            builder = builder.bearer_auth(token);
        }
        builder.send().await
    }
}

/// Forward one API call upstream, relaying status and body back
pub async fn forward(
    State(state): State<AppState>,
    Path((_version, _project, location, _rest)): Path<(String, String, String, String)>,
    OriginalUri(uri): OriginalUri,
    method: Method,
    headers: HeaderMap,
    body: Bytes,
) -> AppResult<Response> {
    let token = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| AppError::unauthorized("Token is missing"))?;
    state.tokens.verify(token)?;

    let path_and_query = uri
        .path_and_query()
        .map_or_else(|| uri.path(), |pq| pq.as_str());

    let upstream_response = if method == Method::GET {
        state.upstream.get(&location, path_and_query).await
    } else if method == Method::POST {
        // Completion-style calls must forward an empty body
        let body = if uri.path().ends_with(":complete") {
            Bytes::new()
        } else {
            body
        };
        state.upstream.post(&location, path_and_query, body).await
    } else if method == Method::PATCH {
        state.upstream.patch(&location, path_and_query, body).await
    } else {
        return Err(AppError::bad_request("Unsupported method"));
    }
    .map_err(|e| {
        error!(error = %e, path = %path_and_query, "Upstream request failed");
        AppError::internal("Upstream request failed")
    })?;

    let status = StatusCode::from_u16(upstream_response.status().as_u16())
        .map_err(|e| AppError::internal(format!("Invalid upstream status: {e}")))?;
    let content_type = upstream_response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let bytes = upstream_response
        .bytes()
        .await
        .map_err(|e| AppError::internal(format!("Failed to read upstream response: {e}")))?;

    let mut builder = Response::builder().status(status);
    if let Some(content_type) = content_type {
        builder = builder.header(CONTENT_TYPE, content_type);
    }
    builder
        .body(Body::from(bytes))
        .map_err(|e| AppError::internal(format!("Failed to build response: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_string, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client_for(server: &MockServer) -> UpstreamClient {
        UpstreamClient::from_config(&UpstreamConfig {
            host: server.address().to_string(),
            scheme: "http".to_string(),
            bearer_token: Some("upstream-credential".to_string()),
            timeout_seconds: 5,
        })
        .unwrap()
    }

    #[test]
    fn test_target_url_global() {
        let client = UpstreamClient::from_config(&UpstreamConfig::default()).unwrap();

        assert_eq!(
            client.target_url("global", "/v2beta1/projects/p/conversations/c1"),
            "https://dialogflow.googleapis.com/v2beta1/projects/p/conversations/c1"
        );
    }

    #[test]
    fn test_target_url_regional() {
        let client = UpstreamClient::from_config(&UpstreamConfig::default()).unwrap();

        assert_eq!(
            client.target_url("us-central1", "/v2beta1/projects/p/conversations/c1"),
            "https://us-central1-dialogflow.googleapis.com/v2beta1/projects/p/conversations/c1"
        );
    }

    #[tokio::test]
    async fn test_get_forwards_bearer_token() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v2beta1/projects/p/conversations/c1"))
            .and(header("authorization", "Bearer upstream-credential"))
            .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"name":"c1"}"#))
            .mount(&server)
            .await;

        let client = client_for(&server);
        let response = client
            .get("global", "/v2beta1/projects/p/conversations/c1")
            .await
            .unwrap();

        assert_eq!(response.status().as_u16(), 200);
        assert_eq!(response.text().await.unwrap(), r#"{"name":"c1"}"#);
    }

    #[tokio::test]
    async fn test_post_forwards_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v2beta1/projects/p/conversations"))
            .and(body_string(r#"{"lifespanCount":1}"#))
            .respond_with(ResponseTemplate::new(201))
            .mount(&server)
            .await;

        let client = client_for(&server);
        let response = client
            .post(
                "global",
                "/v2beta1/projects/p/conversations",
                Bytes::from_static(br#"{"lifespanCount":1}"#),
            )
            .await
            .unwrap();

        assert_eq!(response.status().as_u16(), 201);
    }

    #[tokio::test]
    async fn test_patch_forwards_body() {
        let server = MockServer::start().await;
        Mock::given(method("PATCH"))
            .and(path("/v2beta1/projects/p/answerRecords/a1"))
            .and(body_string(r#"{"clicked":true}"#))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let client = client_for(&server);
        let response = client
            .patch(
                "global",
                "/v2beta1/projects/p/answerRecords/a1",
                Bytes::from_static(br#"{"clicked":true}"#),
            )
            .await
            .unwrap();

        assert_eq!(response.status().as_u16(), 200);
    }

    #[tokio::test]
    async fn test_upstream_error_status_is_relayed() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404).set_body_string("not found"))
            .mount(&server)
            .await;

        let client = client_for(&server);
        let response = client
            .get("global", "/v2beta1/projects/p/conversations/missing")
            .await
            .unwrap();

        assert_eq!(response.status().as_u16(), 404);
    }
}
