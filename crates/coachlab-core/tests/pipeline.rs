mod support;

use std::time::Duration;

use coachlab_core::{ApiRequest, ErrorKind, SessionPhase};
use futures::future::join_all;
use serde_json::json;
use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use support::{
    anonymous_app, config_for, csrf_rejection, csrf_response, mount_csrf, mount_refresh, ok_data,
    refresh_response, signed_in_app, signed_in_store, token_expired,
};

#[tokio::test]
async fn test_read_carries_bearer_but_no_anti_forgery_token() {
    let server = MockServer::start().await;
    mount_csrf(&server, "C1", 0).await;
    Mock::given(method("GET"))
        .and(path("/teams"))
        .and(header("Authorization", "Bearer T1"))
        .respond_with(ok_data(json!([{ "id": "team-1" }])))
        .expect(1)
        .mount(&server)
        .await;
    let app = signed_in_app(&server, "T1");

    let teams: Vec<serde_json::Value> = app.pipeline.get_json("/teams").await.unwrap();
    assert_eq!(teams[0]["id"], "team-1");

    let requests = server.received_requests().await.unwrap();
    assert!(requests.iter().all(|r| !r.headers.contains_key("x-csrf-token")));
}

#[tokio::test]
async fn test_anonymous_read_has_no_authorization_header() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/status"))
        .respond_with(ok_data(json!({ "up": true })))
        .expect(1)
        .mount(&server)
        .await;
    let app = anonymous_app(&server);

    app.pipeline.send(ApiRequest::get("/status")).await.unwrap();
    let requests = server.received_requests().await.unwrap();
    assert!(!requests[0].headers.contains_key("authorization"));
}

#[tokio::test]
async fn test_mutating_request_carries_both_tokens() {
    let server = MockServer::start().await;
    mount_csrf(&server, "C1", 1).await;
    Mock::given(method("POST"))
        .and(path("/teams"))
        .and(header("Authorization", "Bearer T1"))
        .and(header("X-CSRF-Token", "C1"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({ "data": { "id": "team-2" } })))
        .expect(1)
        .mount(&server)
        .await;
    let app = signed_in_app(&server, "T1");

    let created: serde_json::Value = app
        .pipeline
        .post_json("/teams", &json!({ "name": "Closers" }))
        .await
        .unwrap();
    assert_eq!(created["id"], "team-2");
}

#[tokio::test]
async fn test_concurrent_mutations_share_one_token_fetch() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/csrf/"))
        .respond_with(csrf_response("C1").set_delay(Duration::from_millis(100)))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(header("X-CSRF-Token", "C1"))
        .respond_with(ResponseTemplate::new(204))
        .expect(8)
        .mount(&server)
        .await;
    let app = signed_in_app(&server, "T1");

    let paths: Vec<String> = (0..8).map(|i| format!("/teams/{}", i)).collect();
    let results = join_all(paths.iter().map(|p| app.pipeline.delete(p))).await;
    assert!(results.iter().all(|r| r.is_ok()));
}

#[tokio::test]
async fn test_anti_forgery_rejection_retried_once_with_fresh_token() {
    let server = MockServer::start().await;
    mount_csrf(&server, "C-new", 1).await;
    Mock::given(method("PATCH"))
        .and(path("/settings"))
        .and(header("X-CSRF-Token", "C-old"))
        .respond_with(csrf_rejection())
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("PATCH"))
        .and(path("/settings"))
        .and(header("X-CSRF-Token", "C-new"))
        .respond_with(ok_data(json!({ "timezone": "UTC" })))
        .expect(1)
        .mount(&server)
        .await;
    let app = signed_in_app(&server, "T1");
    app.credentials.set_anti_forgery_token("C-old");

    let settings: serde_json::Value = app
        .pipeline
        .patch_json("/settings", &json!({ "timezone": "UTC" }))
        .await
        .unwrap();
    assert_eq!(settings["timezone"], "UTC");
    assert_eq!(app.credentials.anti_forgery_token().as_deref(), Some("C-new"));
}

#[tokio::test]
async fn test_second_anti_forgery_rejection_is_fatal() {
    let server = MockServer::start().await;
    mount_csrf(&server, "C-new", 1).await;
    Mock::given(method("POST"))
        .and(path("/teams"))
        .respond_with(csrf_rejection())
        .expect(2)
        .mount(&server)
        .await;
    let app = signed_in_app(&server, "T1");
    app.credentials.set_anti_forgery_token("C-old");

    let err = app
        .pipeline
        .send(ApiRequest::post("/teams").body(json!({ "name": "x" })))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::SessionError);
    assert!(err.requires_login());
}

#[tokio::test]
async fn test_rejected_token_not_reused_when_refetch_fails() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/csrf/"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(1)
        .expect(1)
        .mount(&server)
        .await;
    mount_csrf(&server, "C-good", 1).await;
    Mock::given(method("POST"))
        .and(path("/teams"))
        .and(header("X-CSRF-Token", "C-bad"))
        .respond_with(csrf_rejection())
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/teams"))
        .and(header("X-CSRF-Token", "C-good"))
        .respond_with(ok_data(json!({ "id": "team-3" })))
        .expect(1)
        .mount(&server)
        .await;
    let app = signed_in_app(&server, "T1");
    app.credentials.set_anti_forgery_token("C-bad");

    let err = app
        .pipeline
        .send(ApiRequest::post("/teams").body(json!({ "name": "x" })))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::SessionError);
    assert!(app.credentials.anti_forgery_token().is_none());

    app.pipeline
        .send(ApiRequest::post("/teams").body(json!({ "name": "x" })))
        .await
        .unwrap();
    assert_eq!(app.credentials.anti_forgery_token().as_deref(), Some("C-good"));
}

#[tokio::test]
async fn test_expired_token_refreshed_and_read_resent() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/teams"))
        .and(header("Authorization", "Bearer T1"))
        .respond_with(token_expired())
        .expect(1)
        .mount(&server)
        .await;
    mount_refresh(&server, refresh_response("T2"), 1).await;
    Mock::given(method("GET"))
        .and(path("/teams"))
        .and(header("Authorization", "Bearer T2"))
        .respond_with(ok_data(json!([{ "id": "team-1", "name": "Closers" }])))
        .expect(1)
        .mount(&server)
        .await;
    let app = signed_in_app(&server, "T1");

    let teams: Vec<serde_json::Value> = app.pipeline.get_json("/teams").await.unwrap();
    assert_eq!(teams[0]["name"], "Closers");
    assert_eq!(app.credentials.access_token().as_deref(), Some("T2"));
    assert!(app.session.session().authenticated);
}

#[tokio::test]
async fn test_failed_refresh_clears_credentials_and_session() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/teams"))
        .respond_with(token_expired())
        .expect(1)
        .mount(&server)
        .await;
    mount_refresh(&server, token_expired(), 1).await;
    let app = signed_in_app(&server, "T1");
    app.credentials.set_anti_forgery_token("C1");
    assert!(app.session.session().authenticated);

    let err = app.pipeline.send(ApiRequest::get("/teams")).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::SessionExpired);

    assert!(app.credentials.get().access_token.is_none());
    assert!(app.credentials.get().anti_forgery_token.is_none());
    assert_eq!(app.credentials.session_snapshot(), (None, None));

    let session = app.session.session();
    assert!(!session.authenticated);
    assert!(session.user.is_none());
    assert_eq!(session.phase, SessionPhase::Anonymous);
    assert_eq!(session.last_error.unwrap().kind, ErrorKind::SessionExpired);
}

#[tokio::test]
async fn test_rejection_after_refresh_is_not_retried_again() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/teams"))
        .respond_with(token_expired())
        .expect(2)
        .mount(&server)
        .await;
    mount_refresh(&server, refresh_response("T2"), 1).await;
    let app = signed_in_app(&server, "T1");

    let err = app.pipeline.send(ApiRequest::get("/teams")).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::SessionExpired);
    assert!(!app.session.session().authenticated);
}

#[tokio::test]
async fn test_concurrent_expiries_share_one_refresh() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(header("Authorization", "Bearer T1"))
        .respond_with(token_expired())
        .mount(&server)
        .await;
    mount_refresh(
        &server,
        refresh_response("T2").set_delay(Duration::from_millis(100)),
        1,
    )
    .await;
    Mock::given(method("GET"))
        .and(header("Authorization", "Bearer T2"))
        .respond_with(ok_data(json!({ "ok": true })))
        .expect(5)
        .mount(&server)
        .await;
    let app = signed_in_app(&server, "T1");

    let paths: Vec<String> = (0..5).map(|i| format!("/teams/{}", i)).collect();
    let results = join_all(paths.iter().map(|p| app.pipeline.send(ApiRequest::get(p.as_str())))).await;
    assert!(results.iter().all(|r| r.is_ok()));
}

#[tokio::test]
async fn test_anti_forgery_and_expiry_recovered_in_sequence() {
    let server = MockServer::start().await;
    mount_csrf(&server, "C-new", 1).await;
    Mock::given(method("POST"))
        .and(path("/teams"))
        .and(header("X-CSRF-Token", "C-old"))
        .respond_with(csrf_rejection())
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/teams"))
        .and(header("X-CSRF-Token", "C-new"))
        .and(header("Authorization", "Bearer T1"))
        .respond_with(token_expired())
        .expect(1)
        .mount(&server)
        .await;
    mount_refresh(&server, refresh_response("T2"), 1).await;
    Mock::given(method("POST"))
        .and(path("/teams"))
        .and(header("X-CSRF-Token", "C-new"))
        .and(header("Authorization", "Bearer T2"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({ "data": { "id": "team-9" } })))
        .expect(1)
        .mount(&server)
        .await;
    let app = signed_in_app(&server, "T1");
    app.credentials.set_anti_forgery_token("C-old");

    let created: serde_json::Value = app
        .pipeline
        .post_json("/teams", &json!({ "name": "Closers" }))
        .await
        .unwrap();
    assert_eq!(created["id"], "team-9");
}

#[tokio::test]
async fn test_other_failures_pass_through_unretried() {
    let server = MockServer::start().await;
    mount_csrf(&server, "C1", 1).await;
    Mock::given(method("GET"))
        .and(path("/teams/missing"))
        .respond_with(ResponseTemplate::new(404).set_body_json(json!({ "error": { "code": "NOT_FOUND", "message": "Team not found" } })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/teams"))
        .respond_with(ResponseTemplate::new(422).set_body_json(json!({
            "error": { "code": "VALIDATION", "message": "Name is required", "details": [{ "field": "name" }] }
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/settings"))
        .respond_with(ResponseTemplate::new(500))
        .expect(1)
        .mount(&server)
        .await;
    mount_refresh(&server, refresh_response("unused"), 0).await;
    let app = signed_in_app(&server, "T1");

    let err = app.pipeline.send(ApiRequest::get("/teams/missing")).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    assert_eq!(err.to_string(), "Resource not found: Team not found");

    let err = app
        .pipeline
        .send(ApiRequest::post("/teams").body(json!({})))
        .await
        .unwrap_err();
    match err {
        coachlab_core::ApiError::ValidationFailed { message, details } => {
            assert_eq!(message, "Name is required");
            assert_eq!(details.unwrap()[0]["field"], "name");
        }
        other => panic!("unexpected error: {other:?}"),
    }

    let err = app.pipeline.send(ApiRequest::get("/settings")).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ServerFault);
    assert!(app.session.session().authenticated);
}

#[tokio::test]
async fn test_slow_response_times_out_without_retry() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/slow"))
        .respond_with(ok_data(json!({})).set_delay(Duration::from_secs(3)))
        .expect(1)
        .mount(&server)
        .await;
    let config = coachlab_core::Config {
        request_timeout_secs: 1,
        ..config_for(&server)
    };
    let app = coachlab_core::App::with_credentials(config, signed_in_store("T1")).unwrap();

    let err = app.pipeline.send(ApiRequest::get("/slow")).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Timeout);
    assert!(app.session.session().authenticated);
}

#[tokio::test]
async fn test_query_parameters_forwarded() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/users"))
        .and(query_param("role", "AGENT"))
        .and(query_param("page", "2"))
        .respond_with(ok_data(json!({ "users": [], "total": 0 })))
        .expect(1)
        .mount(&server)
        .await;
    let app = signed_in_app(&server, "T1");

    let response = app
        .pipeline
        .send(ApiRequest::get("/users").query("role", "AGENT").query("page", "2"))
        .await
        .unwrap();
    assert_eq!(response.status.as_u16(), 200);
    assert_eq!(response.body["data"]["total"], 0);
}
