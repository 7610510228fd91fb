//! Session-changing operations.
//!
//! Login, workspace registration and invite acceptance move the session from
//! anonymous to authenticated; logout moves it back. Only one of those may
//! run at a time. Workspace and user refreshes only update the snapshot.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

use crate::api::client::{
    ACCEPT_INVITE_PATH, CREATE_WORKSPACE_PATH, LOGIN_PATH, LOGOUT_PATH, ME_PATH,
    MY_WORKSPACE_PATH,
};
use crate::api::{ApiError, ApiRequest, RequestPipeline};
use crate::auth::{CredentialStore, ErrorDescriptor, Session, SessionPhase, SessionState};
use crate::models::{AuthPayload, NewWorkspace, UserSummary, WorkspaceSummary};

/// `/workspaces/me` answers either with the workspace or with `{ workspace }`.
#[derive(Deserialize)]
#[serde(untagged)]
enum WorkspaceReply {
    Keyed { workspace: WorkspaceSummary },
    Bare(WorkspaceSummary),
}

/// `/me` answers either with the user or with `{ user, ... }`.
#[derive(Deserialize)]
#[serde(untagged)]
enum UserReply {
    Keyed { user: UserSummary },
    Bare(UserSummary),
}

#[derive(Clone, Copy)]
enum TransitionKind {
    SignIn,
    SignOut,
}

/// Marks a state-changing operation as running. If it is dropped without
/// `finish`, the session is put back: a sign-in restores whatever the
/// credential store holds, a sign-out still ends anonymous.
struct Transition<'a> {
    state: &'a SessionState,
    credentials: &'a CredentialStore,
    kind: TransitionKind,
    finished: bool,
}

impl<'a> Transition<'a> {
    fn begin(state: &'a SessionState, credentials: &'a CredentialStore, kind: TransitionKind) -> Self {
        let phase = match kind {
            TransitionKind::SignIn => SessionPhase::Authenticating,
            TransitionKind::SignOut => SessionPhase::LoggingOut,
        };
        state.update(|s| {
            s.phase = phase;
            s.pending = true;
            s.last_error = None;
        });
        Self {
            state,
            credentials,
            kind,
            finished: false,
        }
    }

    fn finish(mut self) {
        self.finished = true;
    }
}

impl Drop for Transition<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        match self.kind {
            TransitionKind::SignIn => {
                let restored = Session::from_credentials(self.credentials);
                self.state.update(|s| {
                    let last_error = s.last_error.take();
                    *s = restored;
                    s.last_error = last_error;
                });
            }
            TransitionKind::SignOut => {
                self.credentials.clear();
                self.state.reset_anonymous(None);
            }
        }
    }
}

pub struct SessionController {
    pipeline: Arc<RequestPipeline>,
    credentials: Arc<CredentialStore>,
    state: Arc<SessionState>,
    transition: Mutex<()>,
    logout_timeout: Duration,
}

impl SessionController {
    pub fn new(
        pipeline: Arc<RequestPipeline>,
        state: Arc<SessionState>,
        logout_timeout: Duration,
    ) -> Self {
        let credentials = pipeline.credentials().clone();
        Self {
            pipeline,
            credentials,
            state,
            transition: Mutex::new(()),
            logout_timeout,
        }
    }

    pub fn session(&self) -> Session {
        self.state.snapshot()
    }

    pub fn subscribe(&self) -> watch::Receiver<Session> {
        self.state.subscribe()
    }

    pub fn is_authenticated(&self) -> bool {
        self.credentials.has_access_token()
    }

    pub fn pipeline(&self) -> &Arc<RequestPipeline> {
        &self.pipeline
    }

    pub async fn login(&self, email: &str, password: &str) -> Result<Session, ApiError> {
        if email.trim().is_empty() || password.is_empty() {
            return Err(ApiError::InvalidInput(
                "Email and password are required".into(),
            ));
        }
        let request = ApiRequest::post(LOGIN_PATH)
            .body(serde_json::json!({ "email": email.trim(), "password": password }))
            .without_refresh();
        self.authenticate(request, "Login").await
    }

    /// Create a workspace and sign straight into it as its admin.
    pub async fn register_workspace(&self, form: &NewWorkspace) -> Result<Session, ApiError> {
        form.validate()?;
        let request = ApiRequest::post(CREATE_WORKSPACE_PATH)
            .json(form)?
            .without_refresh();
        self.authenticate(request, "Workspace creation").await
    }

    /// Accept an invitation and sign in as the invited user.
    pub async fn accept_invite(&self, token: &str, password: &str) -> Result<Session, ApiError> {
        if token.is_empty() || password.is_empty() {
            return Err(ApiError::InvalidInput(
                "Invite token and password are required".into(),
            ));
        }
        let request = ApiRequest::post(ACCEPT_INVITE_PATH)
            .body(serde_json::json!({ "token": token, "password": password }))
            .without_refresh();
        self.authenticate(request, "Invite acceptance").await
    }

    async fn authenticate(&self, request: ApiRequest, action: &str) -> Result<Session, ApiError> {
        let _permit = self
            .transition
            .try_lock()
            .map_err(|_| ApiError::OperationInProgress)?;
        let transition = Transition::begin(&self.state, &self.credentials, TransitionKind::SignIn);

        let result = match self.pipeline.send(request).await {
            Ok(response) => response.data::<AuthPayload>(),
            Err(e) => Err(e),
        };

        match result {
            Ok(payload) => {
                let AuthPayload { user, workspace, auth } = payload;
                info!(user_id = %user.id, workspace_id = %workspace.id, "{} successful", action);
                self.credentials
                    .set_authenticated(auth.access_token, user.clone(), workspace.clone());
                self.state.update(|s| {
                    s.user = Some(user);
                    s.workspace = Some(workspace);
                    s.authenticated = true;
                    s.pending = false;
                    s.last_error = None;
                    s.phase = SessionPhase::Authenticated;
                });
                transition.finish();
                Ok(self.state.snapshot())
            }
            Err(e) => {
                warn!(error = %e, "{} failed", action);
                self.record_error(&e);
                drop(transition);
                Err(e)
            }
        }
    }

    /// End the session. Local credentials are cleared whether or not the
    /// server acknowledges the logout.
    pub async fn logout(&self) -> Result<(), ApiError> {
        let _permit = self
            .transition
            .try_lock()
            .map_err(|_| ApiError::OperationInProgress)?;
        let transition = Transition::begin(&self.state, &self.credentials, TransitionKind::SignOut);

        if self.credentials.has_access_token() {
            let request = ApiRequest::post(LOGOUT_PATH).without_refresh();
            match tokio::time::timeout(self.logout_timeout, self.pipeline.send(request)).await {
                Ok(Ok(_)) => debug!("Server acknowledged logout"),
                Ok(Err(e)) => warn!(error = %e, "Server logout failed, clearing local session anyway"),
                Err(_) => warn!("Server logout timed out, clearing local session anyway"),
            }
        }

        self.credentials.clear();
        self.state.reset_anonymous(None);
        transition.finish();
        info!("Logged out");
        Ok(())
    }

    /// Re-read the current workspace. A failure keeps the previous snapshot.
    pub async fn refresh_workspace(&self) -> Result<WorkspaceSummary, ApiError> {
        self.require_authenticated()?;
        let result = match self.pipeline.send(ApiRequest::get(MY_WORKSPACE_PATH)).await {
            Ok(response) => response.data::<WorkspaceReply>(),
            Err(e) => Err(e),
        };

        match result {
            Ok(reply) => {
                let workspace = match reply {
                    WorkspaceReply::Keyed { workspace } | WorkspaceReply::Bare(workspace) => workspace,
                };
                if self.credentials.has_access_token() {
                    self.credentials.set_cached_workspace(workspace.clone());
                    let cached = workspace.clone();
                    self.state.update(|s| s.workspace = Some(cached));
                }
                Ok(workspace)
            }
            Err(e) => {
                warn!(error = %e, "Workspace refresh failed");
                self.record_error(&e);
                Err(e)
            }
        }
    }

    /// Re-read the signed-in user. A failure keeps the previous snapshot.
    pub async fn refresh_user(&self) -> Result<UserSummary, ApiError> {
        self.require_authenticated()?;
        let result = match self.pipeline.send(ApiRequest::get(ME_PATH)).await {
            Ok(response) => response.data::<UserReply>(),
            Err(e) => Err(e),
        };

        match result {
            Ok(reply) => {
                let user = match reply {
                    UserReply::Keyed { user } | UserReply::Bare(user) => user,
                };
                if self.credentials.has_access_token() {
                    self.apply_user(user.clone());
                }
                Ok(user)
            }
            Err(e) => {
                warn!(error = %e, "User refresh failed");
                self.record_error(&e);
                Err(e)
            }
        }
    }

    /// Replace the cached user after a local edit (e.g. a profile save).
    pub fn update_user(&self, user: UserSummary) -> Result<(), ApiError> {
        self.require_authenticated()?;
        self.apply_user(user);
        Ok(())
    }

    pub fn clear_error(&self) {
        self.state.update(|s| s.last_error = None);
    }

    fn apply_user(&self, user: UserSummary) {
        self.credentials.set_cached_user(user.clone());
        self.state.update(|s| s.user = Some(user));
    }

    fn require_authenticated(&self) -> Result<(), ApiError> {
        if self.credentials.has_access_token() {
            Ok(())
        } else {
            Err(ApiError::Session("not signed in".into()))
        }
    }

    fn record_error(&self, err: &ApiError) {
        let descriptor = ErrorDescriptor::from(err);
        self.state.update(|s| s.last_error = Some(descriptor));
    }
}
