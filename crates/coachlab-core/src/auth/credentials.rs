//! Durable storage for the access token, anti-forgery token and the cached
//! user/workspace snapshot.
//!
//! The store always keeps an in-memory copy; a backend adds persistence.
//! Every write replaces the whole persisted document so a reader never sees
//! a half-applied change. Backend failures are logged and otherwise ignored.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use keyring::Entry;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::models::{UserSummary, WorkspaceSummary};

/// Credentials file name in the data directory
const CREDENTIALS_FILE: &str = "credentials.json";

/// Keychain service name
const SERVICE_NAME: &str = "coachlab";

/// Keychain account holding the serialized credential document
const KEYRING_ACCOUNT: &str = "session";

/// Tokens attached to outgoing requests.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Credential {
    pub access_token: Option<String>,
    pub anti_forgery_token: Option<String>,
}

/// Everything the store persists, as one document.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PersistedCredentials {
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub csrf_token: Option<String>,
    #[serde(default)]
    pub user: Option<UserSummary>,
    #[serde(default)]
    pub workspace: Option<WorkspaceSummary>,
    #[serde(default)]
    pub saved_at: Option<DateTime<Utc>>,
}

/// Somewhere the credential document can live between process runs.
pub trait CredentialBackend: Send + Sync {
    /// Returns an empty document when nothing has been saved yet.
    fn load(&self) -> Result<PersistedCredentials>;
    fn save(&self, credentials: &PersistedCredentials) -> Result<()>;
    fn clear(&self) -> Result<()>;
}

/// JSON file backend. Writes go to a sibling temp file which is then renamed
/// over the real one.
pub struct FileBackend {
    path: PathBuf,
}

impl FileBackend {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            path: dir.as_ref().join(CREDENTIALS_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        self.path.with_extension("json.tmp")
    }
}

impl CredentialBackend for FileBackend {
    fn load(&self) -> Result<PersistedCredentials> {
        if !self.path.exists() {
            return Ok(PersistedCredentials::default());
        }
        let contents =
            std::fs::read_to_string(&self.path).context("Failed to read credentials file")?;
        serde_json::from_str(&contents).context("Failed to parse credentials file")
    }

    fn save(&self, credentials: &PersistedCredentials) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(credentials)?;
        let tmp = self.temp_path();
        std::fs::write(&tmp, contents).context("Failed to write credentials file")?;
        std::fs::rename(&tmp, &self.path).context("Failed to replace credentials file")?;
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        if self.path.exists() {
            std::fs::remove_file(&self.path).context("Failed to remove credentials file")?;
        }
        Ok(())
    }
}

/// OS keychain backend. The whole document is stored in a single entry.
pub struct KeyringBackend {
    entry: Entry,
}

impl KeyringBackend {
    pub fn new() -> Result<Self> {
        let entry =
            Entry::new(SERVICE_NAME, KEYRING_ACCOUNT).context("Failed to create keyring entry")?;
        Ok(Self { entry })
    }
}

impl CredentialBackend for KeyringBackend {
    fn load(&self) -> Result<PersistedCredentials> {
        match self.entry.get_password() {
            Ok(secret) => {
                serde_json::from_str(&secret).context("Failed to parse credentials from keychain")
            }
            Err(keyring::Error::NoEntry) => Ok(PersistedCredentials::default()),
            Err(e) => Err(e).context("Failed to read credentials from keychain"),
        }
    }

    fn save(&self, credentials: &PersistedCredentials) -> Result<()> {
        let secret = serde_json::to_string(credentials)?;
        self.entry
            .set_password(&secret)
            .context("Failed to store credentials in keychain")
    }

    fn clear(&self) -> Result<()> {
        match self.entry.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(e).context("Failed to delete credentials from keychain"),
        }
    }
}

pub struct CredentialStore {
    state: Mutex<PersistedCredentials>,
    backend: Option<Box<dyn CredentialBackend>>,
    /// Bumped, under the state lock, whenever the signed-in identity changes.
    epoch: AtomicU64,
}

impl CredentialStore {
    /// Memory-only store; nothing survives the process.
    pub fn in_memory() -> Self {
        Self {
            state: Mutex::new(PersistedCredentials::default()),
            backend: None,
            epoch: AtomicU64::new(0),
        }
    }

    /// Hydrate from `backend`. If it cannot be read the store keeps working
    /// in memory only for the rest of the process.
    pub fn open(backend: Box<dyn CredentialBackend>) -> Self {
        match backend.load() {
            Ok(persisted) => {
                debug!(
                    has_access_token = persisted.access_token.is_some(),
                    has_user = persisted.user.is_some(),
                    "Credentials loaded"
                );
                Self {
                    state: Mutex::new(persisted),
                    backend: Some(backend),
                    epoch: AtomicU64::new(0),
                }
            }
            Err(e) => {
                warn!(error = %e, "Credential storage unavailable, keeping credentials in memory only");
                Self::in_memory()
            }
        }
    }

    /// True when writes reach durable storage.
    pub fn is_durable(&self) -> bool {
        self.backend.is_some()
    }

    fn lock(&self) -> MutexGuard<'_, PersistedCredentials> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Apply `f` and persist the result while still holding the lock, so
    /// concurrent writers cannot persist out of order.
    fn update(&self, f: impl FnOnce(&mut PersistedCredentials)) {
        let mut state = self.lock();
        f(&mut state);
        self.persist(&mut state);
    }

    fn persist(&self, state: &mut PersistedCredentials) {
        state.saved_at = Some(Utc::now());
        if let Some(ref backend) = self.backend {
            if let Err(e) = backend.save(state) {
                warn!(error = %e, "Failed to persist credentials");
            }
        }
    }

    /// Session generation. Changes on every sign-in and every clear, so work
    /// started under one session can tell that it has been superseded.
    pub fn epoch(&self) -> u64 {
        let _state = self.lock();
        self.epoch.load(Ordering::SeqCst)
    }

    /// Access token together with the generation it belongs to.
    pub(crate) fn access_token_in_epoch(&self) -> (Option<String>, u64) {
        let state = self.lock();
        (state.access_token.clone(), self.epoch.load(Ordering::SeqCst))
    }

    /// Store a refreshed access token only if the session is still the one
    /// that was refreshed. Returns whether it was stored.
    pub(crate) fn set_access_token_in_epoch(&self, epoch: u64, token: String) -> bool {
        let mut state = self.lock();
        if self.epoch.load(Ordering::SeqCst) != epoch {
            return false;
        }
        state.access_token = Some(token).filter(|t| !t.is_empty());
        self.persist(&mut state);
        true
    }

    pub fn get(&self) -> Credential {
        let state = self.lock();
        Credential {
            access_token: state.access_token.clone(),
            anti_forgery_token: state.csrf_token.clone(),
        }
    }

    pub fn access_token(&self) -> Option<String> {
        self.lock().access_token.clone()
    }

    pub fn anti_forgery_token(&self) -> Option<String> {
        self.lock().csrf_token.clone()
    }

    pub fn has_access_token(&self) -> bool {
        self.lock().access_token.is_some()
    }

    /// Cached `(user, workspace)` identity.
    pub fn session_snapshot(&self) -> (Option<UserSummary>, Option<WorkspaceSummary>) {
        let state = self.lock();
        (state.user.clone(), state.workspace.clone())
    }

    /// An empty token clears the key.
    pub fn set_access_token(&self, token: impl Into<String>) {
        let token = Some(token.into()).filter(|t| !t.is_empty());
        self.update(|s| s.access_token = token);
    }

    pub fn set_anti_forgery_token(&self, token: impl Into<String>) {
        let token = Some(token.into()).filter(|t| !t.is_empty());
        self.update(|s| s.csrf_token = token);
    }

    pub fn clear_anti_forgery_token(&self) {
        self.update(|s| s.csrf_token = None);
    }

    /// Remove the cached anti-forgery token only if it is still `expected`.
    /// Returns whether anything was removed.
    pub(crate) fn clear_anti_forgery_token_if(&self, expected: &str) -> bool {
        let mut cleared = false;
        self.update(|s| {
            if s.csrf_token.as_deref() == Some(expected) {
                s.csrf_token = None;
                cleared = true;
            }
        });
        cleared
    }

    pub fn set_session_snapshot(
        &self,
        user: Option<UserSummary>,
        workspace: Option<WorkspaceSummary>,
    ) {
        self.update(|s| {
            s.user = user;
            s.workspace = workspace;
        });
    }

    pub fn set_cached_user(&self, user: UserSummary) {
        self.update(|s| s.user = Some(user));
    }

    pub fn set_cached_workspace(&self, workspace: WorkspaceSummary) {
        self.update(|s| s.workspace = Some(workspace));
    }

    /// Store the outcome of a successful sign-in in one write.
    pub(crate) fn set_authenticated(
        &self,
        access_token: String,
        user: UserSummary,
        workspace: WorkspaceSummary,
    ) {
        let mut state = self.lock();
        state.access_token = Some(access_token);
        state.user = Some(user);
        state.workspace = Some(workspace);
        self.epoch.fetch_add(1, Ordering::SeqCst);
        self.persist(&mut state);
    }

    /// Forget everything, both in memory and in the backend.
    pub fn clear(&self) {
        let mut state = self.lock();
        self.clear_locked(&mut state);
    }

    /// Clear only if no sign-in or clear happened since `epoch`. Returns
    /// whether anything was cleared.
    pub(crate) fn clear_in_epoch(&self, epoch: u64) -> bool {
        let mut state = self.lock();
        if self.epoch.load(Ordering::SeqCst) != epoch {
            return false;
        }
        self.clear_locked(&mut state);
        true
    }

    fn clear_locked(&self, state: &mut PersistedCredentials) {
        *state = PersistedCredentials::default();
        self.epoch.fetch_add(1, Ordering::SeqCst);
        if let Some(ref backend) = self.backend {
            if let Err(e) = backend.clear() {
                warn!(error = %e, "Failed to clear persisted credentials");
            }
        }
    }
}

impl Default for CredentialStore {
    fn default() -> Self {
        Self::in_memory()
    }
}
