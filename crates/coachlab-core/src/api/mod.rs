//! HTTP layer for the CoachLab workspace API.
//!
//! - `ApiClient`: base URL, endpoints, raw transport (cookie jar included)
//! - `AntiForgeryTokenManager`: cached, single-flight CSRF token acquisition
//! - `RequestPipeline`: attaches credentials to every call and recovers from
//!   anti-forgery rejection and access token expiry
//!
//! Requests carry a JWT bearer token obtained from the login endpoints;
//! mutating requests also carry the anti-forgery token.

pub mod anti_forgery;
pub mod client;
pub mod error;
pub mod pipeline;
pub mod single_flight;

pub use anti_forgery::AntiForgeryTokenManager;
pub use client::ApiClient;
pub use error::{ApiError, ErrorKind};
pub use pipeline::{ApiRequest, ApiResponse, RequestPipeline, RetryState};
pub use reqwest::Method;
