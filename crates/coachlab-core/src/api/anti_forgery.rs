//! Anti-forgery (CSRF) token acquisition and caching.

use std::sync::Arc;

use tracing::{debug, warn};

use super::single_flight::SingleFlight;
use super::ApiClient;
use crate::auth::CredentialStore;

pub struct AntiForgeryTokenManager {
    api: ApiClient,
    credentials: Arc<CredentialStore>,
    flight: SingleFlight<Option<String>>,
}

impl AntiForgeryTokenManager {
    pub fn new(api: ApiClient, credentials: Arc<CredentialStore>) -> Self {
        Self {
            api,
            credentials,
            flight: SingleFlight::new(),
        }
    }

    /// Acquire a token up front so the first mutating request does not wait.
    pub async fn prime(&self) -> Option<String> {
        let token = self.ensure_token().await;
        if token.is_none() {
            warn!("Could not acquire anti-forgery token at start-up");
        }
        token
    }

    /// Cached token, or the result of the one acquisition in flight.
    pub async fn ensure_token(&self) -> Option<String> {
        if let Some(token) = self.credentials.anti_forgery_token() {
            return Some(token);
        }
        self.acquire().await
    }

    /// Drop the cached token; the next `ensure_token` fetches a new one.
    pub fn invalidate(&self) {
        self.credentials.clear_anti_forgery_token();
    }

    /// Replace a token the server just rejected.
    ///
    /// The rejected value is dropped from the cache first, so a failed fetch
    /// leaves nothing cached. When the cache already holds something other
    /// than `rejected`, another request has replaced it and that value is
    /// reused.
    pub async fn reacquire(&self, rejected: Option<&str>) -> Option<String> {
        let dropped = rejected.is_some_and(|r| self.credentials.clear_anti_forgery_token_if(r));
        if !dropped {
            if let Some(current) = self.credentials.anti_forgery_token() {
                if Some(current.as_str()) != rejected {
                    debug!("Anti-forgery token already replaced");
                    return Some(current);
                }
            }
        }
        self.acquire().await
    }

    pub fn is_acquiring(&self) -> bool {
        self.flight.is_running()
    }

    async fn acquire(&self) -> Option<String> {
        let api = self.api.clone();
        let credentials = self.credentials.clone();
        self.flight
            .run(move || async move {
                match api.fetch_anti_forgery_token().await {
                    Ok(token) => {
                        credentials.set_anti_forgery_token(token.clone());
                        Some(token)
                    }
                    Err(e) => {
                        warn!(error = %e, "Failed to fetch anti-forgery token");
                        None
                    }
                }
            })
            .await
    }
}
