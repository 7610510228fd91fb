use serde::{Deserialize, Serialize};

use crate::api::ApiError;

/// Minimum accepted length for a new admin password.
pub const MIN_PASSWORD_LENGTH: usize = 8;

/// Snapshot of the workspace the user is signed into.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceSummary {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub industry_type: Option<String>,
    #[serde(default)]
    pub timezone: Option<String>,
    #[serde(default)]
    #[cfg_attr(feature = "ts", ts(type = "Record<string, unknown>"))]
    pub settings: serde_json::Value,
}

/// Sign-up form for a new workspace and its first admin.
///
/// `confirm_password` never leaves the process; it is checked by
/// [`NewWorkspace::validate`] and skipped when serializing.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NewWorkspace {
    pub workspace_name: String,
    pub admin_email: String,
    pub admin_password: String,
    #[serde(skip)]
    pub confirm_password: String,
    pub industry_type: String,
    pub timezone: String,
}

impl NewWorkspace {
    pub fn validate(&self) -> Result<(), ApiError> {
        if self.workspace_name.trim().is_empty() {
            return Err(ApiError::InvalidInput("Workspace name is required".into()));
        }
        if self.admin_email.trim().is_empty() {
            return Err(ApiError::InvalidInput("Email is required".into()));
        }
        if !looks_like_email(&self.admin_email) {
            return Err(ApiError::InvalidInput("Email is invalid".into()));
        }
        if self.admin_password.is_empty() {
            return Err(ApiError::InvalidInput("Password is required".into()));
        }
        if self.admin_password.chars().count() < MIN_PASSWORD_LENGTH {
            return Err(ApiError::InvalidInput(format!(
                "Password must be at least {} characters",
                MIN_PASSWORD_LENGTH
            )));
        }
        if self.admin_password != self.confirm_password {
            return Err(ApiError::InvalidInput("Passwords do not match".into()));
        }
        Ok(())
    }
}

/// `something@something.something` with no whitespace.
pub(crate) fn looks_like_email(s: &str) -> bool {
    if s.chars().any(char::is_whitespace) {
        return false;
    }
    match s.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty()
                && domain
                    .split_once('.')
                    .map(|(host, tld)| !host.is_empty() && !tld.is_empty())
                    .unwrap_or(false)
        }
        None => false,
    }
}
