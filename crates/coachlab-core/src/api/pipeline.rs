//! Request decoration and recovery shared by every outbound call.
//!
//! A request is attached, sent and classified. Two failure classes are
//! recovered here, each at most once per request: an anti-forgery rejection
//! (fetch a new token and resend) and an expired access token (refresh and
//! resend). Everything else goes back to the caller as-is.

use std::sync::Arc;

use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::client::ANTI_FORGERY_HEADER;
use super::error::ErrorBody;
use super::single_flight::SingleFlight;
use super::{AntiForgeryTokenManager, ApiClient, ApiError};
use crate::auth::{CredentialStore, SessionState};

/// One outbound call, independent of any credentials.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    method: Method,
    path: String,
    body: Option<serde_json::Value>,
    query: Vec<(String, String)>,
    allow_refresh: bool,
}

impl ApiRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            body: None,
            query: Vec::new(),
            allow_refresh: true,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    pub fn put(path: impl Into<String>) -> Self {
        Self::new(Method::PUT, path)
    }

    pub fn patch(path: impl Into<String>) -> Self {
        Self::new(Method::PATCH, path)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::DELETE, path)
    }

    pub fn body(mut self, body: serde_json::Value) -> Self {
        self.body = Some(body);
        self
    }

    /// Serialize `body` as the JSON payload.
    pub fn json<B: Serialize>(self, body: &B) -> Result<Self, ApiError> {
        let value = serde_json::to_value(body)
            .map_err(|e| ApiError::InvalidInput(format!("Unserializable request body: {}", e)))?;
        Ok(self.body(value))
    }

    pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    /// Treat a 401 as a plain failure instead of refreshing the session.
    /// Used by the calls that establish or end a session.
    pub fn without_refresh(mut self) -> Self {
        self.allow_refresh = false;
        self
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Create, update and delete verbs need an anti-forgery token.
    pub fn is_mutating(&self) -> bool {
        matches!(
            self.method,
            Method::POST | Method::PUT | Method::PATCH | Method::DELETE
        )
    }
}

/// Successful response.
#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: StatusCode,
    pub body: serde_json::Value,
}

impl ApiResponse {
    /// Deserialize the `data` member of the envelope, or the whole body when
    /// there is no envelope.
    pub fn data<T: DeserializeOwned>(&self) -> Result<T, ApiError> {
        let value = self.body.get("data").unwrap_or(&self.body).clone();
        serde_json::from_value(value)
            .map_err(|e| ApiError::InvalidResponse(format!("Unexpected response shape: {}", e)))
    }
}

/// Which recoveries a request has already used.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryState {
    pub anti_forgery: bool,
    pub authentication: bool,
}

enum Outcome {
    Success(ApiResponse),
    AntiForgeryRejected,
    AuthenticationExpired(String),
    Failed(ApiError),
}

/// Result of one send, with the tokens it actually carried and the session
/// generation its access token came from.
struct Attempt {
    outcome: Outcome,
    access_token: Option<String>,
    anti_forgery_token: Option<String>,
    epoch: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Refresh {
    /// A usable access token is stored.
    Refreshed,
    /// The server refused to refresh.
    Failed,
    /// A sign-in or sign-out replaced the session meanwhile.
    Superseded,
}

pub struct RequestPipeline {
    api: ApiClient,
    credentials: Arc<CredentialStore>,
    anti_forgery: Arc<AntiForgeryTokenManager>,
    session: Arc<SessionState>,
    refresh: SingleFlight<(u64, Refresh)>,
}

impl RequestPipeline {
    pub fn new(
        api: ApiClient,
        credentials: Arc<CredentialStore>,
        anti_forgery: Arc<AntiForgeryTokenManager>,
        session: Arc<SessionState>,
    ) -> Self {
        Self {
            api,
            credentials,
            anti_forgery,
            session,
            refresh: SingleFlight::new(),
        }
    }

    pub fn credentials(&self) -> &Arc<CredentialStore> {
        &self.credentials
    }

    pub fn anti_forgery(&self) -> &Arc<AntiForgeryTokenManager> {
        &self.anti_forgery
    }

    /// Send `request`, recovering from anti-forgery rejection and access
    /// token expiry at most once each.
    pub async fn send(&self, request: ApiRequest) -> Result<ApiResponse, ApiError> {
        let mut retry = RetryState::default();

        loop {
            let attempt = self.dispatch(&request).await?;

            match attempt.outcome {
                Outcome::Success(response) => return Ok(response),
                Outcome::Failed(err) => return Err(err),

                Outcome::AntiForgeryRejected => {
                    if retry.anti_forgery {
                        warn!(method = %request.method, path = %request.path, "Anti-forgery token rejected again");
                        return Err(ApiError::Session(
                            "anti-forgery token rejected after retry".into(),
                        ));
                    }
                    retry.anti_forgery = true;
                    debug!(method = %request.method, path = %request.path, retry = "anti_forgery", "Retrying with a new anti-forgery token");

                    if self
                        .anti_forgery
                        .reacquire(attempt.anti_forgery_token.as_deref())
                        .await
                        .is_none()
                    {
                        return Err(ApiError::Session(
                            "could not acquire a new anti-forgery token".into(),
                        ));
                    }
                }

                Outcome::AuthenticationExpired(message) => {
                    if !request.allow_refresh {
                        return Err(ApiError::Unauthorized(message));
                    }
                    if retry.authentication {
                        warn!(method = %request.method, path = %request.path, "Access token rejected after refresh");
                        return Err(self.expire_session(attempt.epoch));
                    }
                    retry.authentication = true;
                    debug!(method = %request.method, path = %request.path, retry = "authentication", "Access token expired, refreshing");

                    match self
                        .refresh_session(attempt.access_token.as_deref(), attempt.epoch)
                        .await
                    {
                        Refresh::Refreshed => {}
                        Refresh::Failed => return Err(self.expire_session(attempt.epoch)),
                        Refresh::Superseded => {
                            debug!(method = %request.method, path = %request.path, "Session changed while refreshing");
                            return Err(ApiError::SessionExpired);
                        }
                    }
                }
            }
        }
    }

    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        self.send(ApiRequest::get(path)).await?.data()
    }

    pub async fn post_json<T: DeserializeOwned, B: Serialize>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ApiError> {
        self.send(ApiRequest::post(path).json(body)?).await?.data()
    }

    pub async fn patch_json<T: DeserializeOwned, B: Serialize>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ApiError> {
        self.send(ApiRequest::patch(path).json(body)?).await?.data()
    }

    pub async fn delete(&self, path: &str) -> Result<ApiResponse, ApiError> {
        self.send(ApiRequest::delete(path)).await
    }

    async fn dispatch(&self, request: &ApiRequest) -> Result<Attempt, ApiError> {
        let anti_forgery_token = if request.is_mutating() {
            self.anti_forgery.ensure_token().await
        } else {
            None
        };
        // Read after the possible suspension above so a refresh that landed
        // meanwhile is picked up.
        let (access_token, epoch) = self.credentials.access_token_in_epoch();

        let mut builder = self.api.request(request.method.clone(), &request.path);
        if let Some(ref token) = access_token {
            builder = builder.bearer_auth(token);
        }
        if let Some(ref token) = anti_forgery_token {
            builder = builder.header(ANTI_FORGERY_HEADER, token);
        }
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        if let Some(ref body) = request.body {
            builder = builder.json(body);
        }

        let response = builder.send().await.map_err(|e| {
            warn!(method = %request.method, path = %request.path, error = %e, "Request failed");
            ApiError::from_transport(e)
        })?;
        let status = response.status();
        debug!(method = %request.method, path = %request.path, status = status.as_u16(), "Response received");

        let outcome = if status.is_success() {
            let (status, body) = ApiClient::read_json(response).await?;
            Outcome::Success(ApiResponse { status, body })
        } else {
            let text = response.text().await.unwrap_or_default();
            Self::classify_failure(status, &text)
        };

        Ok(Attempt {
            outcome,
            access_token,
            anti_forgery_token,
            epoch,
        })
    }

    fn classify_failure(status: StatusCode, body: &str) -> Outcome {
        match status {
            StatusCode::FORBIDDEN
                if ErrorBody::parse(body).is_some_and(|e| e.is_anti_forgery()) =>
            {
                Outcome::AntiForgeryRejected
            }
            StatusCode::UNAUTHORIZED => match ApiError::from_status(status, body) {
                ApiError::Unauthorized(message) => Outcome::AuthenticationExpired(message),
                other => Outcome::Failed(other),
            },
            _ => Outcome::Failed(ApiError::from_status(status, body)),
        }
    }

    /// Get a usable access token after `rejected` was refused by a request
    /// sent in session `epoch`. Concurrent callers share a single refresh
    /// call. A token is only stored while `epoch` is still current.
    async fn refresh_session(&self, rejected: Option<&str>, epoch: u64) -> Refresh {
        let (current, current_epoch) = self.credentials.access_token_in_epoch();
        if current_epoch != epoch {
            return Refresh::Superseded;
        }
        if current.is_some() && current.as_deref() != rejected {
            debug!("Access token already refreshed");
            return Refresh::Refreshed;
        }

        let (started_in, outcome) = self.run_refresh(epoch).await;
        if started_in == epoch {
            return outcome;
        }

        // Joined a refresh begun for an earlier session; it says nothing
        // about this one.
        if self.credentials.epoch() != epoch {
            return Refresh::Superseded;
        }
        match self.run_refresh(epoch).await {
            (started_in, outcome) if started_in == epoch => outcome,
            _ => Refresh::Superseded,
        }
    }

    async fn run_refresh(&self, epoch: u64) -> (u64, Refresh) {
        let api = self.api.clone();
        let credentials = self.credentials.clone();
        self.refresh
            .run(move || async move {
                let anti_forgery_token = credentials.anti_forgery_token();
                let outcome = match api.refresh_access_token(anti_forgery_token.as_deref()).await {
                    Ok(token) => {
                        if credentials.set_access_token_in_epoch(epoch, token) {
                            info!("Session refreshed");
                            Refresh::Refreshed
                        } else {
                            debug!("Session changed during refresh, discarding new token");
                            Refresh::Superseded
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "Session refresh failed");
                        Refresh::Failed
                    }
                };
                (epoch, outcome)
            })
            .await
    }

    /// Forget all credentials and fall back to anonymous, unless the session
    /// that failed has already been replaced.
    fn expire_session(&self, epoch: u64) -> ApiError {
        let err = ApiError::SessionExpired;
        if self.credentials.clear_in_epoch(epoch) {
            self.session.reset_anonymous(Some(&err));
        } else {
            debug!("Expired session already replaced, keeping current credentials");
        }
        err
    }
}
