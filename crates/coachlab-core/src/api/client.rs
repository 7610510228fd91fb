//! Low-level HTTP access to the CoachLab workspace API.
//!
//! `ApiClient` knows the base URL, the endpoint paths and how to turn a raw
//! response into JSON or an [`ApiError`]. It attaches no credentials on its
//! own; that is the job of [`RequestPipeline`](super::RequestPipeline).

use std::time::Duration;

use anyhow::Result;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use tracing::debug;

use super::ApiError;
use crate::models::RefreshPayload;

// ============================================================================
// Constants
// ============================================================================

/// Header carrying the anti-forgery token on mutating requests
pub const ANTI_FORGERY_HEADER: &str = "X-CSRF-Token";

pub const LOGIN_PATH: &str = "/auth/login";
pub const LOGOUT_PATH: &str = "/auth/logout";
pub const REFRESH_PATH: &str = "/auth/refresh";
pub const ACCEPT_INVITE_PATH: &str = "/auth/accept-invite";
pub const CREATE_WORKSPACE_PATH: &str = "/workspaces";
pub const MY_WORKSPACE_PATH: &str = "/workspaces/me";
pub const ME_PATH: &str = "/me";
pub const ANTI_FORGERY_TOKEN_PATH: &str = "/csrf/";

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    data: T,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AntiForgeryPayload {
    csrf_token: String,
}

/// HTTP client bound to one API base URL.
/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling,
/// and clones share the cookie jar.
#[derive(Clone)]
pub struct ApiClient {
    client: Client,
    base_url: String,
}

impl ApiClient {
    /// Create a client whose every request is bounded by `timeout`.
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .cookie_store(true)
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn url(&self, path: &str) -> String {
        if path.starts_with('/') {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}/{}", self.base_url, path)
        }
    }

    pub(crate) fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.client
            .request(method, self.url(path))
            .header(reqwest::header::ACCEPT, "application/json")
    }

    /// Read a response body as JSON. An empty body reads as `null`.
    pub(crate) async fn read_json(response: Response) -> Result<(StatusCode, serde_json::Value), ApiError> {
        let status = response.status();
        let text = response.text().await.map_err(ApiError::from_transport)?;
        if text.trim().is_empty() {
            return Ok((status, serde_json::Value::Null));
        }
        let value = serde_json::from_str(&text)
            .map_err(|e| ApiError::InvalidResponse(format!("Malformed JSON body: {}", e)))?;
        Ok((status, value))
    }

    /// Check if response is successful, returning an error with body if not.
    async fn check_response(response: Response) -> Result<Response, ApiError> {
        if response.status().is_success() {
            Ok(response)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(ApiError::from_status(status, &body))
        }
    }

    /// Fetch a fresh anti-forgery token. Sent without an access token; the
    /// server binds the token to the cookie it sets on this response.
    pub(crate) async fn fetch_anti_forgery_token(&self) -> Result<String, ApiError> {
        let response = self
            .request(Method::GET, ANTI_FORGERY_TOKEN_PATH)
            .send()
            .await
            .map_err(ApiError::from_transport)?;
        let response = Self::check_response(response).await?;

        let envelope: Envelope<AntiForgeryPayload> =
            response.json().await.map_err(ApiError::from_transport)?;
        debug!("Anti-forgery token issued");
        Ok(envelope.data.csrf_token)
    }

    /// Exchange the refresh cookie for a new access token.
    pub(crate) async fn refresh_access_token(
        &self,
        anti_forgery_token: Option<&str>,
    ) -> Result<String, ApiError> {
        let mut request = self
            .request(Method::POST, REFRESH_PATH)
            .json(&serde_json::json!({}));
        if let Some(token) = anti_forgery_token {
            request = request.header(ANTI_FORGERY_HEADER, token);
        }

        let response = request.send().await.map_err(ApiError::from_transport)?;
        let response = Self::check_response(response).await?;

        let envelope: Envelope<RefreshPayload> =
            response.json().await.map_err(ApiError::from_transport)?;
        Ok(envelope.data.auth.access_token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_joining() {
        let api = ApiClient::new("http://localhost:3000/", Duration::from_secs(1)).unwrap();
        assert_eq!(api.base_url(), "http://localhost:3000");
        assert_eq!(api.url("/teams"), "http://localhost:3000/teams");
        assert_eq!(api.url("teams/4"), "http://localhost:3000/teams/4");
    }

    #[test]
    fn test_parse_anti_forgery_envelope() {
        let json = r#"{"success":true,"data":{"csrfToken":"abc"}}"#;
        let env: Envelope<AntiForgeryPayload> = serde_json::from_str(json).unwrap();
        assert_eq!(env.data.csrf_token, "abc");
    }

    #[test]
    fn test_parse_refresh_envelope() {
        let json = r#"{"data":{"auth":{"accessToken":"T2","expiresIn":900}}}"#;
        let env: Envelope<RefreshPayload> = serde_json::from_str(json).unwrap();
        assert_eq!(env.data.auth.access_token, "T2");
    }
}
