use tokio::sync::watch;

use crate::api::{ApiError, ErrorKind};
use crate::auth::CredentialStore;
use crate::models::{UserSummary, WorkspaceSummary};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionPhase {
    #[default]
    Anonymous,
    Authenticating,
    Authenticated,
    LoggingOut,
}

/// Last failure of a session operation, in a form a UI can render.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorDescriptor {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&ApiError> for ErrorDescriptor {
    fn from(err: &ApiError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// What the UI renders against: who is signed in, and into which workspace.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Session {
    pub user: Option<UserSummary>,
    pub workspace: Option<WorkspaceSummary>,
    pub authenticated: bool,
    pub pending: bool,
    pub last_error: Option<ErrorDescriptor>,
    pub phase: SessionPhase,
}

impl Session {
    /// Rebuild the session from whatever the credential store holds.
    pub fn from_credentials(credentials: &CredentialStore) -> Self {
        let authenticated = credentials.has_access_token();
        let (user, workspace) = if authenticated {
            credentials.session_snapshot()
        } else {
            (None, None)
        };
        Self {
            user,
            workspace,
            authenticated,
            pending: false,
            last_error: None,
            phase: if authenticated {
                SessionPhase::Authenticated
            } else {
                SessionPhase::Anonymous
            },
        }
    }

    pub fn is_anonymous(&self) -> bool {
        !self.authenticated
    }
}

/// Owner of the live session value. Every change is broadcast to subscribers.
pub struct SessionState {
    tx: watch::Sender<Session>,
}

impl SessionState {
    pub fn new(initial: Session) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx }
    }

    pub fn hydrate(credentials: &CredentialStore) -> Self {
        Self::new(Session::from_credentials(credentials))
    }

    pub fn snapshot(&self) -> Session {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Session> {
        self.tx.subscribe()
    }

    pub(crate) fn update(&self, f: impl FnOnce(&mut Session)) {
        self.tx.send_modify(f);
    }

    /// Drop to anonymous, recording `reason` as the last error if given.
    pub(crate) fn reset_anonymous(&self, reason: Option<&ApiError>) {
        self.tx.send_replace(Session {
            last_error: reason.map(ErrorDescriptor::from),
            ..Session::default()
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hydrate_anonymous() {
        let store = CredentialStore::in_memory();
        let session = Session::from_credentials(&store);
        assert!(session.is_anonymous());
        assert_eq!(session.phase, SessionPhase::Anonymous);
    }

    #[test]
    fn test_snapshot_ignored_without_token() {
        let store = CredentialStore::in_memory();
        store.set_session_snapshot(
            None,
            Some(WorkspaceSummary {
                id: "w1".into(),
                name: "Acme".into(),
                industry_type: None,
                timezone: None,
                settings: serde_json::Value::Null,
            }),
        );
        let session = Session::from_credentials(&store);
        assert!(session.workspace.is_none());

        store.set_access_token("T1");
        let session = Session::from_credentials(&store);
        assert!(session.authenticated);
        assert_eq!(session.workspace.unwrap().name, "Acme");
        assert_eq!(session.phase, SessionPhase::Authenticated);
    }

    #[tokio::test]
    async fn test_subscribers_see_reset() {
        let store = CredentialStore::in_memory();
        store.set_access_token("T1");
        let state = SessionState::hydrate(&store);
        let mut rx = state.subscribe();

        state.reset_anonymous(Some(&ApiError::SessionExpired));
        rx.changed().await.unwrap();
        let session = rx.borrow().clone();
        assert!(!session.authenticated);
        assert_eq!(session.last_error.unwrap().kind, ErrorKind::SessionExpired);
    }
}
