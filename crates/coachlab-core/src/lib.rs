//! Authenticated HTTP client and session controller for the CoachLab
//! workspace API.
//!
//! Every request goes through [`RequestPipeline`], which attaches the bearer
//! and anti-forgery tokens and transparently recovers from a rejected
//! anti-forgery token or an expired access token. [`SessionController`] owns
//! the signed-in user and workspace and publishes changes to subscribers.
//!
//! Start with [`App::start`].

pub mod api;
pub mod app;
pub mod auth;
pub mod config;
pub mod models;

pub use api::{ApiError, ApiRequest, ApiResponse, ErrorKind, RequestPipeline};
pub use app::App;
pub use auth::{CredentialStore, Session, SessionController, SessionPhase};
pub use config::{Config, StorageKind};
