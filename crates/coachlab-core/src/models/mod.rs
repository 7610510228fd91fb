//! Data models for the CoachLab workspace API.
//!
//! Only the identity snapshot the session layer caches lives here:
//!
//! - `UserSummary` with its `Role` and `UserStatus`
//! - `WorkspaceSummary`
//! - `NewWorkspace`: the sign-up form sent when registering a workspace
//! - `AuthPayload`: the body returned by every authenticating endpoint

pub mod user;
pub mod workspace;

pub use user::{Role, UserStatus, UserSummary};
pub use workspace::{NewWorkspace, WorkspaceSummary};

use serde::Deserialize;

/// Access token as returned under `auth` by login, refresh and sign-up.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthTokens {
    pub access_token: String,
}

/// `data` member of a successful login / sign-up / accept-invite response.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthPayload {
    pub user: UserSummary,
    pub workspace: WorkspaceSummary,
    pub auth: AuthTokens,
}

/// `data` member of a successful refresh response.
#[derive(Debug, Clone, Deserialize)]
pub struct RefreshPayload {
    pub auth: AuthTokens,
}
