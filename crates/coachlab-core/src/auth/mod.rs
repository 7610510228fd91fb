//! Authentication module for managing user sessions and credentials.
//!
//! This module provides:
//! - `CredentialStore`: durable storage for tokens and the identity snapshot,
//!   backed by a JSON file or the OS keychain
//! - `Session` / `SessionState`: the live session value and its subscribers
//! - `SessionController`: login, logout, workspace registration and refresh

pub mod controller;
pub mod credentials;
pub mod session;

pub use controller::SessionController;
pub use credentials::{
    Credential, CredentialBackend, CredentialStore, FileBackend, KeyringBackend,
    PersistedCredentials,
};
pub use session::{ErrorDescriptor, Session, SessionPhase, SessionState};
