//! Process start-up: build the credential store, the API client, the
//! anti-forgery manager, the request pipeline and the session controller,
//! wired to each other explicitly.

use std::sync::Arc;

use anyhow::Result;
use tracing::{debug, info, warn};

use crate::api::{AntiForgeryTokenManager, ApiClient, RequestPipeline};
use crate::auth::{CredentialStore, FileBackend, KeyringBackend, SessionController, SessionState};
use crate::config::{Config, StorageKind};

/// Everything a front end needs, owned in one place.
pub struct App {
    pub config: Config,
    pub credentials: Arc<CredentialStore>,
    pub anti_forgery: Arc<AntiForgeryTokenManager>,
    pub pipeline: Arc<RequestPipeline>,
    pub session: SessionController,
}

impl App {
    /// Build the handle and acquire the first anti-forgery token.
    pub async fn start(config: Config) -> Result<Self> {
        let credentials = Self::open_credentials(&config);
        let app = Self::with_credentials(config, credentials)?;
        app.anti_forgery.prime().await;
        info!(
            base_url = %app.config.api_base_url,
            authenticated = app.session.is_authenticated(),
            "Client started"
        );
        Ok(app)
    }

    /// Build the handle around an existing store. Performs no network I/O.
    pub fn with_credentials(config: Config, credentials: CredentialStore) -> Result<Self> {
        let credentials = Arc::new(credentials);
        let api = ApiClient::new(&config.api_base_url, config.request_timeout())?;
        let anti_forgery = Arc::new(AntiForgeryTokenManager::new(api.clone(), credentials.clone()));
        let state = Arc::new(SessionState::hydrate(&credentials));
        let pipeline = Arc::new(RequestPipeline::new(
            api,
            credentials.clone(),
            anti_forgery.clone(),
            state.clone(),
        ));
        let session = SessionController::new(pipeline.clone(), state, config.logout_timeout());

        Ok(Self {
            config,
            credentials,
            anti_forgery,
            pipeline,
            session,
        })
    }

    fn open_credentials(config: &Config) -> CredentialStore {
        match config.storage {
            StorageKind::Memory => CredentialStore::in_memory(),
            StorageKind::File => match Config::data_dir() {
                Ok(dir) => {
                    debug!(?dir, "Using file credential storage");
                    CredentialStore::open(Box::new(FileBackend::new(dir)))
                }
                Err(e) => {
                    warn!(error = %e, "No data directory, keeping credentials in memory only");
                    CredentialStore::in_memory()
                }
            },
            StorageKind::Keyring => match KeyringBackend::new() {
                Ok(backend) => CredentialStore::open(Box::new(backend)),
                Err(e) => {
                    warn!(error = %e, "Keychain unavailable, keeping credentials in memory only");
                    CredentialStore::in_memory()
                }
            },
        }
    }
}
