#![allow(dead_code)]

use coachlab_core::auth::CredentialStore;
use coachlab_core::models::{Role, UserStatus, UserSummary, WorkspaceSummary};
use coachlab_core::{App, Config, StorageKind};
use serde_json::{json, Value};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

pub fn config_for(server: &MockServer) -> Config {
    Config {
        api_base_url: server.uri(),
        request_timeout_secs: 5,
        logout_timeout_secs: 1,
        storage: StorageKind::Memory,
    }
}

/// Anonymous client against `server`, nothing cached.
pub fn anonymous_app(server: &MockServer) -> App {
    App::with_credentials(config_for(server), CredentialStore::in_memory()).unwrap()
}

/// Client that already holds `token` and a user/workspace snapshot.
pub fn signed_in_app(server: &MockServer, token: &str) -> App {
    App::with_credentials(config_for(server), signed_in_store(token)).unwrap()
}

pub fn signed_in_store(token: &str) -> CredentialStore {
    let store = CredentialStore::in_memory();
    store.set_access_token(token);
    store.set_session_snapshot(Some(user("a@b.com")), Some(workspace("Acme")));
    store
}

pub fn user(email: &str) -> UserSummary {
    UserSummary {
        id: "user-1".into(),
        name: Some("Ada Admin".into()),
        email: email.into(),
        role: Role::Admin,
        status: UserStatus::Active,
    }
}

pub fn workspace(name: &str) -> WorkspaceSummary {
    WorkspaceSummary {
        id: "ws-1".into(),
        name: name.into(),
        industry_type: Some("INSURANCE".into()),
        timezone: Some("America/New_York".into()),
        settings: json!({}),
    }
}

pub fn auth_body(email: &str, token: &str) -> Value {
    json!({
        "success": true,
        "data": {
            "user": { "id": "user-1", "name": "Ada Admin", "email": email, "role": "ADMIN", "status": "ACTIVE" },
            "workspace": { "id": "ws-1", "name": "Acme", "industryType": "INSURANCE", "timezone": "America/New_York", "settings": {} },
            "auth": { "accessToken": token }
        }
    })
}

pub fn csrf_response(token: &str) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({ "success": true, "data": { "csrfToken": token } }))
}

pub fn refresh_response(token: &str) -> ResponseTemplate {
    ResponseTemplate::new(200)
        .set_body_json(json!({ "success": true, "data": { "auth": { "accessToken": token } } }))
}

pub fn csrf_rejection() -> ResponseTemplate {
    ResponseTemplate::new(403)
        .set_body_json(json!({ "success": false, "error": { "code": "CSRF", "message": "Invalid CSRF token" } }))
}

pub fn token_expired() -> ResponseTemplate {
    ResponseTemplate::new(401)
        .set_body_json(json!({ "success": false, "error": { "code": "TOKEN_EXPIRED", "message": "Access token expired" } }))
}

pub fn ok_data(data: Value) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({ "success": true, "data": data }))
}

/// Token endpoint handing out `token`, expected to be hit `times` times.
pub async fn mount_csrf(server: &MockServer, token: &str, times: u64) {
    Mock::given(method("GET"))
        .and(path("/csrf/"))
        .respond_with(csrf_response(token))
        .expect(times)
        .mount(server)
        .await;
}

/// Refresh endpoint, expected to be hit `times` times.
pub async fn mount_refresh(server: &MockServer, response: ResponseTemplate, times: u64) {
    Mock::given(method("POST"))
        .and(path("/auth/refresh"))
        .respond_with(response)
        .expect(times)
        .mount(server)
        .await;
}
