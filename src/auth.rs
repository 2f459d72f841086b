//! Login, token caching and transparent refresh.
//!
//! State machine:
//!
//! ```text
//! Anonymous -> Authenticating -> Authenticated -> Refreshing -> Authenticated
//!                   |                                  |
//!                   +----------> Anonymous <-----------+   (on failure)
//! ```
//!
//! The session lives behind an async mutex. A refresh runs while that lock
//! is held, so at most one refresh is in flight per helper and a concurrent
//! caller waits for it and then reuses its outcome: the refreshed session, or
//! the error the refresh failed with.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::{watch, Mutex};

use crate::api::{ApiHelper, ApiResponse, RequestOptions};
use crate::backoff::RetryPolicy;
use crate::config::{Credentials, EnvironmentConfig};
use crate::error::{Error, Result};
use crate::transport::Transport;

const LOGIN_RETRY_INITIAL: Duration = Duration::from_millis(200);
const LOGIN_RETRY_MAX: Duration = Duration::from_secs(5);

/// Lifecycle state of an [`AuthHelper`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthState {
    Anonymous,
    Authenticating,
    Authenticated,
    Refreshing,
}

/// An issued access token and its expiry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Session {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: DateTime<Utc>,
}

impl Session {
    /// Returns true once the expiry has passed.
    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }

    /// Returns true if the token expires within `margin` (or already has).
    pub fn expires_within(&self, margin: Duration) -> bool {
        match (self.expires_at - Utc::now()).to_std() {
            Ok(remaining) => remaining <= margin,
            Err(_) => true,
        }
    }

    fn bearer_headers(&self) -> Result<HeaderMap> {
        let value = HeaderValue::from_str(&format!("Bearer {}", self.access_token))
            .map_err(|_| Error::AuthenticationFailed {
                status: None,
                body: "issued token is not a valid header value".to_string(),
            })?;
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, value);
        Ok(headers)
    }
}

/// Token endpoint body. Accepts camelCase and snake_case spellings.
#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(alias = "accessToken", alias = "access_token")]
    token: String,
    #[serde(default, rename = "refreshToken", alias = "refresh_token")]
    refresh_token: Option<String>,
    #[serde(default = "default_expires_in", rename = "expiresIn", alias = "expires_in")]
    expires_in: i64,
}

fn default_expires_in() -> i64 {
    3600
}

fn expiry_after(seconds: i64) -> DateTime<Utc> {
    chrono::Duration::try_seconds(seconds.max(0))
        .and_then(|d| Utc::now().checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[derive(Default)]
struct SessionSlot {
    session: Option<Session>,
    credentials: Option<Credentials>,
    /// Most recent refresh failure, tagged with its sequence number.
    failed_refresh: Option<(u32, Error)>,
}

impl SessionSlot {
    /// The refresh failure recorded after `seen`, if the session is gone.
    fn failure_since(&self, seen: u32) -> Option<Error> {
        match (&self.session, &self.failed_refresh) {
            (None, Some((sequence, error))) if *sequence > seen => Some(replay(error)),
            _ => None,
        }
    }
}

/// Rebuilds a refresh error for a caller that waited on it.
fn replay(error: &Error) -> Error {
    match error {
        Error::Transport { kind, message } => Error::transport(*kind, message.clone()),
        Error::AuthenticationFailed { status, body } => Error::AuthenticationFailed {
            status: *status,
            body: body.clone(),
        },
        Error::NotAuthenticated => Error::NotAuthenticated,
        other => Error::AuthenticationFailed {
            status: other.status(),
            body: other.to_string(),
        },
    }
}

/// Owns one auth session. Never shared across tests.
pub struct AuthHelper {
    api: ApiHelper,
    slot: Mutex<SessionSlot>,
    state: watch::Sender<AuthState>,
    refreshes: AtomicU32,
    failed_refreshes: AtomicU32,
}

impl AuthHelper {
    /// Creates a helper that talks to the auth endpoints through `api`.
    ///
    /// Any auth attached to `api` is stripped.
    pub fn new(api: &ApiHelper) -> Self {
        let (state, _) = watch::channel(AuthState::Anonymous);
        Self {
            api: api.without_auth(),
            slot: Mutex::new(SessionSlot::default()),
            state,
            refreshes: AtomicU32::new(0),
            failed_refreshes: AtomicU32::new(0),
        }
    }

    /// Creates a helper with its own auth-less [`ApiHelper`].
    pub fn for_config(config: Arc<EnvironmentConfig>, transport: Arc<dyn Transport>) -> Self {
        Self::new(&ApiHelper::new(config, transport))
    }

    fn config(&self) -> &EnvironmentConfig {
        self.api.config()
    }

    /// Current state. Never blocks.
    pub fn state(&self) -> AuthState {
        *self.state.borrow()
    }

    /// Receiver that observes every state change.
    pub fn subscribe(&self) -> watch::Receiver<AuthState> {
        self.state.subscribe()
    }

    /// Returns true if a session is held.
    pub fn is_authenticated(&self) -> bool {
        matches!(self.state(), AuthState::Authenticated | AuthState::Refreshing)
    }

    /// Number of refreshes attempted so far.
    pub fn refresh_count(&self) -> u32 {
        self.refreshes.load(Ordering::SeqCst)
    }

    /// Snapshot of the current session. Waits for an in-flight refresh.
    pub async fn session(&self) -> Option<Session> {
        self.slot.lock().await.session.clone()
    }

    /// Logs in and stores the issued token.
    ///
    /// On a non-2xx or malformed response the helper returns to `Anonymous`
    /// and fails with [`Error::AuthenticationFailed`].
    pub async fn login(&self, credentials: Credentials) -> Result<Session> {
        let mut slot = self.slot.lock().await;
        self.login_locked(&mut slot, credentials).await
    }

    /// Logs in with the credential set from the environment config.
    pub async fn login_with_configured_credentials(&self) -> Result<Session> {
        let credentials = self
            .config()
            .credentials
            .clone()
            .ok_or_else(|| Error::ConfigIncomplete {
                environment: self.config().name.clone(),
                reason: "no credentials configured".to_string(),
            })?;
        self.login(credentials).await
    }

    /// Returns `Authorization: Bearer <token>`.
    ///
    /// Refreshes first if the token is within the refresh margin. Fails with
    /// [`Error::NotAuthenticated`] when no session is held.
    pub async fn auth_headers(&self) -> Result<HeaderMap> {
        let seen = self.failed_refreshes.load(Ordering::SeqCst);
        let mut slot = self.slot.lock().await;
        if let Some(error) = slot.failure_since(seen) {
            return Err(error);
        }
        let session = self.fresh_session_locked(&mut slot).await?;
        session.bearer_headers()
    }

    /// Headers to merge into an outgoing request, if any.
    ///
    /// Unlike [`auth_headers`](Self::auth_headers), an anonymous helper
    /// yields `None` unless lazy login is enabled and credentials exist.
    pub(crate) async fn headers_for_request(&self) -> Result<Option<HeaderMap>> {
        let seen = self.failed_refreshes.load(Ordering::SeqCst);
        let mut slot = self.slot.lock().await;
        if let Some(error) = slot.failure_since(seen) {
            return Err(error);
        }
        if slot.session.is_none() {
            let auth = &self.config().auth;
            match (&self.config().credentials, auth.lazy_login) {
                (Some(credentials), true) => {
                    let credentials = credentials.clone();
                    self.login_locked(&mut slot, credentials).await?;
                }
                _ => return Ok(None),
            }
        }

        let session = self.fresh_session_locked(&mut slot).await?;
        session.bearer_headers().map(Some)
    }

    /// Marks the current session as expired so the next use refreshes it.
    pub async fn force_expiry(&self) {
        if let Some(session) = self.slot.lock().await.session.as_mut() {
            session.expires_at = Utc::now();
        }
    }

    /// Discards the session.
    pub async fn logout(&self) {
        let mut slot = self.slot.lock().await;
        slot.session = None;
        slot.credentials = None;
        slot.failed_refresh = None;
        self.state.send_replace(AuthState::Anonymous);
        tracing::debug!(environment = %self.config().name, "logged out");
    }

    async fn login_locked(&self, slot: &mut SessionSlot, credentials: Credentials) -> Result<Session> {
        self.state.send_replace(AuthState::Authenticating);

        match self.request_login(&credentials).await {
            Ok(session) => {
                tracing::info!(
                    environment = %self.config().name,
                    username = %credentials.username,
                    expires_at = %session.expires_at,
                    "logged in"
                );
                slot.session = Some(session.clone());
                slot.credentials = Some(credentials);
                slot.failed_refresh = None;
                self.state.send_replace(AuthState::Authenticated);
                Ok(session)
            }
            Err(e) => {
                tracing::warn!(environment = %self.config().name, error = %e, "login failed");
                slot.session = None;
                slot.credentials = None;
                self.state.send_replace(AuthState::Anonymous);
                Err(e)
            }
        }
    }

    async fn fresh_session_locked(&self, slot: &mut SessionSlot) -> Result<Session> {
        let margin = self.config().auth.refresh_margin;
        match &slot.session {
            None => Err(Error::NotAuthenticated),
            Some(session) if !session.expires_within(margin) => Ok(session.clone()),
            Some(_) => self.refresh_locked(slot).await,
        }
    }

    async fn refresh_locked(&self, slot: &mut SessionSlot) -> Result<Session> {
        self.state.send_replace(AuthState::Refreshing);
        self.refreshes.fetch_add(1, Ordering::SeqCst);

        let previous = slot.session.take();
        let result = match (previous.as_ref().and_then(|s| s.refresh_token.clone()), &slot.credentials) {
            (Some(refresh_token), _) => {
                let path = self.config().auth.refresh_path.clone();
                self.request_token(&path, json!({ "refreshToken": refresh_token }))
                    .await
                    .map(|mut session| {
                        // Some servers do not rotate the refresh token.
                        if session.refresh_token.is_none() {
                            session.refresh_token = Some(refresh_token);
                        }
                        session
                    })
            }
            (None, Some(credentials)) => self.request_login(credentials).await,
            (None, None) => Err(Error::NotAuthenticated),
        };

        match result {
            Ok(session) => {
                tracing::info!(
                    environment = %self.config().name,
                    expires_at = %session.expires_at,
                    "refreshed session"
                );
                slot.session = Some(session.clone());
                self.state.send_replace(AuthState::Authenticated);
                Ok(session)
            }
            Err(e) => {
                tracing::warn!(environment = %self.config().name, error = %e, "refresh failed, session dropped");
                slot.credentials = None;
                let sequence = self.failed_refreshes.fetch_add(1, Ordering::SeqCst) + 1;
                slot.failed_refresh = Some((sequence, replay(&e)));
                self.state.send_replace(AuthState::Anonymous);
                Err(e)
            }
        }
    }

    /// Posts credentials, retrying transport failures per the configured attempts.
    async fn request_login(&self, credentials: &Credentials) -> Result<Session> {
        let auth = &self.config().auth;
        let policy = RetryPolicy::new(auth.max_login_attempts, LOGIN_RETRY_INITIAL, LOGIN_RETRY_MAX);
        let body = json!({
            "username": credentials.username,
            "password": credentials.password,
        });

        let mut attempt = 1;
        loop {
            match self.request_token(&auth.login_path, body.clone()).await {
                Err(e) if e.is_transport() => match policy.delay_after(attempt) {
                    Some(delay) => {
                        tracing::warn!(attempt, error = %e, delay_ms = delay.as_millis() as u64, "login attempt failed, retrying");
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                    }
                    None => return Err(e),
                },
                other => return other,
            }
        }
    }

    async fn request_token(&self, path: &str, body: Value) -> Result<Session> {
        let options = RequestOptions::json(&body)?.without_auth();
        // Boxed: `ApiHelper::send` can reach this method through lazy login.
        let response: ApiResponse<Value> = Box::pin(self.api.post(path, options)).await?;

        if !response.is_success() {
            return Err(Error::AuthenticationFailed {
                status: Some(response.status),
                body: response.raw_body,
            });
        }

        let token: TokenResponse =
            serde_json::from_value(response.body).map_err(|e| Error::AuthenticationFailed {
                status: Some(response.status),
                body: format!("malformed token response ({}): {}", e, response.raw_body),
            })?;
        if token.token.is_empty() {
            return Err(Error::AuthenticationFailed {
                status: Some(response.status),
                body: "token response contained an empty token".to_string(),
            });
        }

        Ok(Session {
            access_token: token.token,
            refresh_token: token.refresh_token,
            expires_at: expiry_after(token.expires_in),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AuthSettings;
    use crate::error::TransportErrorKind;
    use crate::transport::{ReqwestTransport, TransportRequest, TransportResponse};
    use async_trait::async_trait;
    use tokio_test::{assert_err, assert_ok};
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    /// Answers every request the same way and counts them.
    struct CountingTransport {
        status: Option<u16>,
        sends: AtomicU32,
    }

    impl CountingTransport {
        fn refusing() -> Arc<Self> {
            Arc::new(Self { status: None, sends: AtomicU32::new(0) })
        }

        fn responding(status: u16) -> Arc<Self> {
            Arc::new(Self { status: Some(status), sends: AtomicU32::new(0) })
        }

        fn sends(&self) -> u32 {
            self.sends.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Transport for CountingTransport {
        async fn send(&self, _request: TransportRequest) -> Result<TransportResponse> {
            self.sends.fetch_add(1, Ordering::SeqCst);
            match self.status {
                None => Err(Error::transport(TransportErrorKind::Connect, "connection refused")),
                Some(status) => Ok(TransportResponse {
                    status,
                    headers: HeaderMap::new(),
                    body: b"rejected".to_vec(),
                    elapsed: Duration::from_millis(1),
                }),
            }
        }

        fn name(&self) -> &str {
            "counting"
        }
    }

    fn retrying_config(attempts: u32) -> Arc<EnvironmentConfig> {
        Arc::new(base_config().with_auth(AuthSettings {
            max_login_attempts: attempts,
            ..Default::default()
        }))
    }

    fn auth_for(server: &MockServer, config: EnvironmentConfig) -> AuthHelper {
        let config = EnvironmentConfig {
            base_url: server.uri(),
            ..config
        };
        AuthHelper::for_config(Arc::new(config), Arc::new(ReqwestTransport::new().unwrap()))
    }

    fn base_config() -> EnvironmentConfig {
        EnvironmentConfig::for_base_url("dev", "http://placeholder")
    }

    async fn mount_login(server: &MockServer, body: Value) {
        Mock::given(method("POST"))
            .and(path("/auth/login"))
            .respond_with(ResponseTemplate::new(200).set_body_json(body))
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn anonymous_headers_fail() {
        let server = MockServer::start().await;
        let auth = auth_for(&server, base_config());

        assert_eq!(auth.state(), AuthState::Anonymous);
        let err = assert_err!(auth.auth_headers().await);
        assert!(matches!(err, Error::NotAuthenticated));
    }

    #[tokio::test]
    async fn login_issues_bearer_header() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/auth/login"))
            .and(body_json(json!({"username": "demo", "password": "demo"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"token": "abc", "expiresIn": 3600})))
            .expect(1)
            .mount(&server)
            .await;

        let auth = auth_for(&server, base_config());
        let session = assert_ok!(auth.login(Credentials::new("demo", "demo")).await);

        assert_eq!(session.access_token, "abc");
        assert!(!session.is_expired());
        assert_eq!(auth.state(), AuthState::Authenticated);
        let headers = assert_ok!(auth.auth_headers().await);
        assert_eq!(headers.get(AUTHORIZATION).unwrap(), "Bearer abc");
    }

    #[tokio::test]
    async fn snake_case_token_fields_are_accepted() {
        let server = MockServer::start().await;
        mount_login(
            &server,
            json!({"access_token": "snake", "refresh_token": "r1", "expires_in": 120}),
        )
        .await;

        let auth = auth_for(&server, base_config());
        let session = auth.login(Credentials::new("demo", "demo")).await.unwrap();

        assert_eq!(session.access_token, "snake");
        assert_eq!(session.refresh_token.as_deref(), Some("r1"));
        assert!(session.expires_within(Duration::from_secs(121)));
        assert!(!session.expires_within(Duration::from_secs(100)));
    }

    #[tokio::test]
    async fn rejected_login_returns_to_anonymous() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/auth/login"))
            .respond_with(ResponseTemplate::new(401).set_body_string("invalid credentials"))
            .mount(&server)
            .await;

        let auth = auth_for(&server, base_config());
        let err = auth.login(Credentials::new("demo", "wrong")).await.unwrap_err();

        match err {
            Error::AuthenticationFailed { status, body } => {
                assert_eq!(status, Some(401));
                assert_eq!(body, "invalid credentials");
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert_eq!(auth.state(), AuthState::Anonymous);
        assert!(auth.session().await.is_none());
    }

    #[tokio::test]
    async fn malformed_token_body_fails_login() {
        let server = MockServer::start().await;
        mount_login(&server, json!({"message": "welcome"})).await;

        let auth = auth_for(&server, base_config());
        let err = auth.login(Credentials::new("demo", "demo")).await.unwrap_err();

        assert_eq!(err.status(), Some(200));
        assert!(matches!(err, Error::AuthenticationFailed { .. }));
        assert_eq!(auth.state(), AuthState::Anonymous);
    }

    #[tokio::test]
    async fn forced_expiry_triggers_exactly_one_refresh() {
        let server = MockServer::start().await;
        mount_login(&server, json!({"token": "first", "refreshToken": "r1", "expiresIn": 3600})).await;
        Mock::given(method("POST"))
            .and(path("/auth/refresh"))
            .and(body_json(json!({"refreshToken": "r1"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"token": "second", "expiresIn": 3600})))
            .expect(1)
            .mount(&server)
            .await;

        let auth = auth_for(&server, base_config());
        auth.login(Credentials::new("demo", "demo")).await.unwrap();
        auth.force_expiry().await;

        let headers = auth.auth_headers().await.unwrap();
        assert_eq!(headers.get(AUTHORIZATION).unwrap(), "Bearer second");
        let again = auth.auth_headers().await.unwrap();
        assert_eq!(again.get(AUTHORIZATION).unwrap(), "Bearer second");

        assert_eq!(auth.refresh_count(), 1);
        let session = auth.session().await.unwrap();
        assert_eq!(session.refresh_token.as_deref(), Some("r1"));
    }

    #[tokio::test]
    async fn refresh_without_refresh_token_logs_in_again() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/auth/login"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"token": "abc", "expiresIn": 3600})))
            .expect(2)
            .mount(&server)
            .await;

        let auth = auth_for(&server, base_config());
        auth.login(Credentials::new("demo", "demo")).await.unwrap();
        auth.force_expiry().await;

        assert_ok!(auth.auth_headers().await);
        assert_eq!(auth.refresh_count(), 1);
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_refresh() {
        let server = MockServer::start().await;
        mount_login(&server, json!({"token": "first", "refreshToken": "r1", "expiresIn": 3600})).await;
        Mock::given(method("POST"))
            .and(path("/auth/refresh"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"token": "second", "expiresIn": 3600}))
                    .set_delay(Duration::from_millis(100)),
            )
            .expect(1)
            .mount(&server)
            .await;

        let auth = Arc::new(auth_for(&server, base_config()));
        auth.login(Credentials::new("demo", "demo")).await.unwrap();
        auth.force_expiry().await;

        let (a, b) = tokio::join!(auth.auth_headers(), auth.auth_headers());
        assert_eq!(a.unwrap().get(AUTHORIZATION).unwrap(), "Bearer second");
        assert_eq!(b.unwrap().get(AUTHORIZATION).unwrap(), "Bearer second");
        assert_eq!(auth.refresh_count(), 1);
    }

    #[tokio::test]
    async fn failed_refresh_drops_stale_token() {
        let server = MockServer::start().await;
        mount_login(&server, json!({"token": "first", "refreshToken": "r1", "expiresIn": 3600})).await;
        Mock::given(method("POST"))
            .and(path("/auth/refresh"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let auth = auth_for(&server, base_config());
        auth.login(Credentials::new("demo", "demo")).await.unwrap();
        auth.force_expiry().await;

        let err = auth.auth_headers().await.unwrap_err();
        assert_eq!(err.status(), Some(401));
        assert_eq!(auth.state(), AuthState::Anonymous);
        assert!(auth.session().await.is_none());
        assert!(matches!(auth.auth_headers().await, Err(Error::NotAuthenticated)));
    }

    #[tokio::test]
    async fn refresh_margin_triggers_early_refresh() {
        let server = MockServer::start().await;
        // Token lives 30s but the margin is the default 60s.
        mount_login(&server, json!({"token": "short", "refreshToken": "r1", "expiresIn": 30})).await;
        Mock::given(method("POST"))
            .and(path("/auth/refresh"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"token": "long", "expiresIn": 3600})))
            .expect(1)
            .mount(&server)
            .await;

        let auth = auth_for(&server, base_config());
        auth.login(Credentials::new("demo", "demo")).await.unwrap();

        let headers = auth.auth_headers().await.unwrap();
        assert_eq!(headers.get(AUTHORIZATION).unwrap(), "Bearer long");
    }

    #[tokio::test]
    async fn logout_discards_session() {
        let server = MockServer::start().await;
        mount_login(&server, json!({"token": "abc"})).await;

        let auth = auth_for(&server, base_config());
        auth.login(Credentials::new("demo", "demo")).await.unwrap();
        assert!(auth.is_authenticated());

        auth.logout().await;
        assert!(!auth.is_authenticated());
        assert!(matches!(auth.auth_headers().await, Err(Error::NotAuthenticated)));
    }

    #[tokio::test]
    async fn configured_credentials_are_required() {
        let server = MockServer::start().await;
        let auth = auth_for(&server, base_config());

        let err = auth.login_with_configured_credentials().await.unwrap_err();
        assert!(matches!(err, Error::ConfigIncomplete { .. }));
    }

    #[tokio::test]
    async fn login_transport_failure_respects_attempt_budget() {
        // Closed port: every attempt is a connect failure.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let config = EnvironmentConfig::for_base_url("dev", format!("http://{}", addr)).with_auth(
            crate::config::AuthSettings {
                max_login_attempts: 2,
                ..Default::default()
            },
        );
        let auth = AuthHelper::for_config(Arc::new(config), Arc::new(ReqwestTransport::new().unwrap()));

        let mut states = auth.subscribe();
        let err = auth.login(Credentials::new("demo", "demo")).await.unwrap_err();

        assert!(err.is_transport());
        assert!(states.has_changed().unwrap());
        assert_eq!(*states.borrow_and_update(), AuthState::Anonymous);
    }

    #[tokio::test]
    async fn login_retries_transport_failures_up_to_budget() {
        let transport = CountingTransport::refusing();
        let auth = AuthHelper::for_config(retrying_config(3), transport.clone());

        let err = auth.login(Credentials::new("demo", "demo")).await.unwrap_err();

        assert!(err.is_transport());
        assert_eq!(transport.sends(), 3);
        assert_eq!(auth.state(), AuthState::Anonymous);
    }

    #[tokio::test]
    async fn rejected_login_is_not_retried() {
        let transport = CountingTransport::responding(401);
        let auth = AuthHelper::for_config(retrying_config(3), transport.clone());

        let err = auth.login(Credentials::new("demo", "demo")).await.unwrap_err();

        assert_eq!(err.status(), Some(401));
        assert_eq!(transport.sends(), 1);
    }

    #[tokio::test]
    async fn lazy_login_authenticates_first_request_once() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/auth/login"))
            .and(body_json(json!({"username": "demo", "password": "demo"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"token": "lz", "expiresIn": 3600})))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/users/1"))
            .and(header("authorization", "Bearer lz"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": 1})))
            .expect(2)
            .mount(&server)
            .await;

        let config = EnvironmentConfig::for_base_url("dev", server.uri())
            .with_credentials(Credentials::new("demo", "demo"))
            .with_auth(AuthSettings {
                lazy_login: true,
                ..Default::default()
            });
        let base = ApiHelper::new(Arc::new(config), Arc::new(ReqwestTransport::new().unwrap()));
        let auth = Arc::new(AuthHelper::new(&base));
        let api = base.with_auth(Arc::clone(&auth));

        assert_eq!(auth.state(), AuthState::Anonymous);
        let first: ApiResponse<Value> = api.get("/users/1", RequestOptions::new()).await.unwrap();
        let second: ApiResponse<Value> = api.get("/users/1", RequestOptions::new()).await.unwrap();

        assert_eq!(first.status, 200);
        assert_eq!(second.status, 200);
        assert_eq!(auth.state(), AuthState::Authenticated);
    }

    #[tokio::test]
    async fn anonymous_request_without_lazy_login_sends_no_auth() {
        let transport = CountingTransport::responding(200);
        let config = Arc::new(base_config().with_credentials(Credentials::new("demo", "demo")));
        let base = ApiHelper::new(config, transport.clone());
        let api = base.clone().with_auth(Arc::new(AuthHelper::new(&base)));

        let resp: ApiResponse<Value> = api.get("/users/1", RequestOptions::new()).await.unwrap();

        assert_eq!(resp.status, 200);
        assert_eq!(transport.sends(), 1);
    }

    #[tokio::test]
    async fn waiter_receives_failed_refresh_error() {
        let server = MockServer::start().await;
        mount_login(&server, json!({"token": "first", "refreshToken": "r1", "expiresIn": 3600})).await;
        Mock::given(method("POST"))
            .and(path("/auth/refresh"))
            .respond_with(
                ResponseTemplate::new(401)
                    .set_body_string("refresh token revoked")
                    .set_delay(Duration::from_millis(100)),
            )
            .expect(1)
            .mount(&server)
            .await;

        let auth = auth_for(&server, base_config());
        auth.login(Credentials::new("demo", "demo")).await.unwrap();
        auth.force_expiry().await;

        let (a, b) = tokio::join!(auth.auth_headers(), auth.auth_headers());

        for result in [a, b] {
            match result {
                Err(Error::AuthenticationFailed { status, body }) => {
                    assert_eq!(status, Some(401));
                    assert_eq!(body, "refresh token revoked");
                }
                other => panic!("expected the refresh failure, got {:?}", other),
            }
        }
        assert_eq!(auth.refresh_count(), 1);

        // A caller arriving after the failure sees a plain anonymous helper.
        assert!(matches!(auth.auth_headers().await, Err(Error::NotAuthenticated)));
    }
}
