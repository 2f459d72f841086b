//! End-to-end flows against a local stub server.
//!
//! These tests run without network access; every endpoint is a wiremock stub.
//!
//! Run with: `cargo test --test api_flow`

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio_test::{assert_err, assert_ok};
use wiremock::matchers::{body_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use api_harness::{
    AuthState, ConfigProvider, Error, FixtureComposer, RequestOptions, ResponseValidator, User,
};

/// Provider pointing the `local` environment at `server` with demo credentials.
fn provider_for(server: &MockServer) -> ConfigProvider {
    let vars: HashMap<String, String> = [
        ("TEST_ENV", "local".to_string()),
        ("LOCAL_BASE_URL", server.uri()),
        ("LOCAL_API_USERNAME", "demo".to_string()),
        ("LOCAL_API_PASSWORD", "demo".to_string()),
        ("LOG_LEVEL", "debug".to_string()),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v))
    .collect();
    ConfigProvider::from_vars(vars)
}

async fn mount_login(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/auth/login"))
        .and(body_json(json!({"username": "demo", "password": "demo"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "token": "abc",
            "expiresIn": 3600
        })))
        .expect(1)
        .mount(server)
        .await;
}

#[tokio::test]
async fn login_then_protected_call_carries_bearer() {
    let server = MockServer::start().await;
    mount_login(&server).await;
    Mock::given(method("GET"))
        .and(path("/protected"))
        .and(header("authorization", "Bearer abc"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"secret": 42})))
        .expect(1)
        .mount(&server)
        .await;

    let composer = assert_ok!(FixtureComposer::from_provider(&provider_for(&server), "local"));

    let data = assert_ok!(
        composer
            .run(|ctx| async move {
                ctx.auth.login_with_configured_credentials().await?;
                assert_eq!(ctx.auth.state(), AuthState::Authenticated);

                let headers = ctx.auth.auth_headers().await?;
                assert_eq!(
                    headers.get("authorization").and_then(|v| v.to_str().ok()),
                    Some("Bearer abc")
                );

                let resp = ctx.api.get::<Value>("/protected", RequestOptions::new()).await?;
                ResponseValidator::validate_success(&resp)?;
                Ok(resp.body)
            })
            .await
    );

    assert_eq!(data, json!({"secret": 42}));
}

#[tokio::test]
async fn existing_user_passes_validation() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/users/1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": 1, "name": "Leanne"})))
        .mount(&server)
        .await;

    let ctx = FixtureComposer::from_provider(&provider_for(&server), "local")
        .unwrap()
        .compose()
        .unwrap();

    let resp = ctx.api.get::<Value>("/users/1", RequestOptions::new()).await.unwrap();

    assert_ok!(ResponseValidator::validate_status_code(&resp, 200));
    assert_ok!(ResponseValidator::validate_content_type(&resp, "application/json"));
    assert_ok!(ResponseValidator::validate_user(&resp.body));
}

#[tokio::test]
async fn missing_user_is_a_normal_response() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/users/999"))
        .respond_with(ResponseTemplate::new(404).set_body_json(json!({})))
        .mount(&server)
        .await;

    let ctx = FixtureComposer::from_provider(&provider_for(&server), "local")
        .unwrap()
        .compose()
        .unwrap();

    let resp = assert_ok!(ctx.api.get::<Value>("/users/999", RequestOptions::new()).await);

    assert_eq!(resp.status, 404);
    assert_ok!(ResponseValidator::validate_status_code(&resp, 404));
    assert_err!(ResponseValidator::validate_success(&resp));
}

#[tokio::test]
async fn typed_lookup_of_missing_user_keeps_status() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/users/999"))
        .respond_with(ResponseTemplate::new(404).set_body_json(json!({"error": "not found"})))
        .mount(&server)
        .await;

    let ctx = FixtureComposer::from_provider(&provider_for(&server), "local")
        .unwrap()
        .compose()
        .unwrap();

    let resp = assert_ok!(ctx.api.get::<User>("/users/999", RequestOptions::new()).await);

    assert_ok!(ResponseValidator::validate_status_code(&resp, 404));
    assert!(resp.data.is_none());
    assert_eq!(resp.body["error"], "not found");
}

#[tokio::test]
async fn generated_user_round_trips_through_create() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/users"))
        .respond_with(|req: &wiremock::Request| {
            let mut body: Value = serde_json::from_slice(&req.body).unwrap_or(Value::Null);
            body["id"] = json!(11);
            ResponseTemplate::new(201).set_body_json(body)
        })
        .mount(&server)
        .await;

    let ctx = FixtureComposer::from_provider(&provider_for(&server), "local")
        .unwrap()
        .compose()
        .unwrap();

    let user = ctx.data.generate("user", Some(json!({"name": "Fixed Name"}))).unwrap();
    let resp = ctx
        .api
        .post::<Value>("/users", RequestOptions::json(&user).unwrap())
        .await
        .unwrap();

    assert_ok!(ResponseValidator::validate_status_code(&resp, 201));
    assert_ok!(ResponseValidator::validate_user(&resp.body));
    assert_eq!(resp.body["name"], "Fixed Name");
    assert_eq!(resp.body["email"], user["email"]);
}

#[tokio::test]
async fn list_endpoint_reports_bad_items() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/users"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            {"id": 1, "name": "a"},
            {"id": 2},
            {"id": 3, "name": "c"}
        ])))
        .mount(&server)
        .await;

    let ctx = FixtureComposer::from_provider(&provider_for(&server), "local")
        .unwrap()
        .compose()
        .unwrap();
    let resp = ctx.api.get::<Value>("/users", RequestOptions::new()).await.unwrap();

    match ResponseValidator::validate_array_response(&resp.body, 1, 10, ResponseValidator::validate_user) {
        Err(Error::ValidationFailed(msg)) => assert!(msg.contains("[1] field 'name': missing")),
        other => panic!("expected validation failure, got {:?}", other),
    }
}

#[tokio::test]
async fn contexts_are_isolated() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/auth/login"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "token": "abc",
            "expiresIn": 3600
        })))
        .mount(&server)
        .await;

    let composer = FixtureComposer::from_provider(&provider_for(&server), "local").unwrap();
    let first = composer.compose().unwrap();
    let second = composer.compose().unwrap();

    first.auth.login_with_configured_credentials().await.unwrap();

    assert_ok!(first.auth.auth_headers().await);
    assert!(matches!(second.auth.auth_headers().await, Err(Error::NotAuthenticated)));
    assert!(second.auth.session().await.is_none());
}

#[tokio::test]
async fn slow_endpoint_times_out() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/slow"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
        .mount(&server)
        .await;

    let ctx = FixtureComposer::from_provider(&provider_for(&server), "local")
        .unwrap()
        .compose()
        .unwrap();

    let err = ctx
        .api
        .get::<Value>("/slow", RequestOptions::new().with_timeout(Duration::from_millis(100)))
        .await
        .unwrap_err();

    assert!(err.is_timeout(), "expected timeout, got {:?}", err);
}

#[tokio::test]
async fn unreachable_host_is_a_transport_error() {
    let vars = [("LOCAL_BASE_URL", "http://127.0.0.1:1")];
    let provider = ConfigProvider::from_vars(vars);
    let ctx = FixtureComposer::from_provider(&provider, "local")
        .unwrap()
        .compose()
        .unwrap();

    let err = ctx.api.get::<Value>("/users/1", RequestOptions::new()).await.unwrap_err();

    assert!(err.is_transport());
    assert!(err.status().is_none());
}

#[tokio::test]
async fn rejected_login_is_authentication_failure() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/auth/login"))
        .respond_with(ResponseTemplate::new(401).set_body_string("bad credentials"))
        .mount(&server)
        .await;

    let ctx = FixtureComposer::from_provider(&provider_for(&server), "local")
        .unwrap()
        .compose()
        .unwrap();

    match ctx.auth.login_with_configured_credentials().await {
        Err(Error::AuthenticationFailed { status, body }) => {
            assert_eq!(status, Some(401));
            assert!(body.contains("bad credentials"));
        }
        other => panic!("expected authentication failure, got {:?}", other),
    }
    assert_eq!(ctx.auth.state(), AuthState::Anonymous);
}

#[tokio::test]
async fn shared_config_is_read_only_across_contexts() {
    let server = MockServer::start().await;
    let composer = FixtureComposer::from_provider(&provider_for(&server), "local").unwrap();

    let a = composer.compose().unwrap();
    let b = composer.compose().unwrap();

    assert!(Arc::ptr_eq(&a.config, &b.config));
    assert_eq!(a.config.base_url, server.uri());
}
