//! Environment-aware API request wrapper.
//!
//! Applies the base URL, default headers and default timeout from the
//! resolved config, merges auth headers when an [`AuthHelper`] is attached,
//! and decodes the body into the caller's type. Non-2xx responses are
//! returned as ordinary results so negative tests can assert on them.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::auth::AuthHelper;
use crate::config::EnvironmentConfig;
use crate::error::{Error, Result};
use crate::transport::{Transport, TransportRequest, TransportResponse};

/// Per-call overrides.
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    body: Option<Vec<u8>>,
    json_body: bool,
    headers: Vec<(String, String)>,
    query: Vec<(String, String)>,
    timeout: Option<Duration>,
    skip_auth: bool,
}

impl RequestOptions {
    /// Empty options: config defaults apply.
    pub fn new() -> Self {
        Self::default()
    }

    /// Options carrying `body` serialized as JSON.
    pub fn json<B: Serialize + ?Sized>(body: &B) -> Result<Self> {
        Self::new().with_json(body)
    }

    /// Sets a JSON body. `Content-Type: application/json` is added unless overridden.
    pub fn with_json<B: Serialize + ?Sized>(mut self, body: &B) -> Result<Self> {
        self.body = Some(serde_json::to_vec(body)?);
        self.json_body = true;
        Ok(self)
    }

    /// Sets a raw body. No content type is implied.
    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = Some(body.into());
        self.json_body = false;
        self
    }

    /// Adds a header that overrides defaults and auth headers of the same name.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Appends a query parameter.
    pub fn with_query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    /// Overrides the default timeout for this call.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Sends the request without auth headers even if an auth helper is attached.
    pub fn without_auth(mut self) -> Self {
        self.skip_auth = true;
        self
    }
}

/// Snapshot of one response.
#[derive(Debug, Clone)]
pub struct ApiResponse<T = Value> {
    pub status: u16,
    pub headers: HeaderMap,
    /// Body decoded into `T`.
    ///
    /// Always `Some` for a 2xx response. `None` when a non-2xx body does not
    /// fit `T`, such as an error payload returned for a typed call.
    pub data: Option<T>,
    /// Body as JSON: `null` when empty, a string when not JSON.
    pub body: Value,
    pub raw_body: String,
    pub elapsed: Duration,
}

impl<T> ApiResponse<T> {
    /// Returns true for a 2xx status.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Returns a header value as a string, matched case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Returns the `Content-Type` header, if present.
    pub fn content_type(&self) -> Option<&str> {
        self.header(CONTENT_TYPE.as_str())
    }

    /// Re-decodes the body into another type.
    pub fn json<U: DeserializeOwned>(&self) -> Result<U> {
        decode_value(self.status, self.body.clone())
    }

    /// Takes the decoded body, failing with [`Error::Decode`] when it did not
    /// fit `T`.
    pub fn into_data(self) -> Result<T> {
        let status = self.status;
        self.data.ok_or_else(|| Error::Decode {
            status,
            message: "response body did not match the requested type".to_string(),
        })
    }
}

impl<T: DeserializeOwned> ApiResponse<T> {
    /// Builds a response. A 2xx body that does not fit `T` is an error; a
    /// non-2xx one is kept as `data: None`.
    fn from_transport(response: TransportResponse) -> Result<Self> {
        let raw_body = String::from_utf8_lossy(&response.body).into_owned();
        let body = body_value(&raw_body);
        let data = match decode_value(response.status, body.clone()) {
            Ok(data) => Some(data),
            Err(e) if (200..300).contains(&response.status) => return Err(e),
            Err(e) => {
                tracing::debug!(status = response.status, error = %e, "error body not decoded");
                None
            }
        };

        Ok(Self {
            status: response.status,
            headers: response.headers,
            data,
            body,
            raw_body,
            elapsed: response.elapsed,
        })
    }
}

/// Parses a body as JSON.
///
/// An empty body becomes `null`. A body that is not JSON becomes a JSON
/// string, so `Value` and `String` always decode.
fn body_value(raw: &str) -> Value {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        Value::Null
    } else {
        serde_json::from_str::<Value>(trimmed).unwrap_or_else(|_| Value::String(raw.to_string()))
    }
}

fn decode_value<T: DeserializeOwned>(status: u16, value: Value) -> Result<T> {
    serde_json::from_value(value).map_err(|e| Error::Decode {
        status,
        message: e.to_string(),
    })
}

/// Wraps the transport with environment defaults.
#[derive(Clone)]
pub struct ApiHelper {
    config: Arc<EnvironmentConfig>,
    transport: Arc<dyn Transport>,
    auth: Option<Arc<AuthHelper>>,
}

impl fmt::Debug for ApiHelper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiHelper")
            .field("environment", &self.config.name)
            .field("base_url", &self.config.base_url)
            .field("transport", &self.transport.name())
            .field("auth_attached", &self.auth.is_some())
            .finish()
    }
}

impl ApiHelper {
    /// Creates a helper without auth.
    pub fn new(config: Arc<EnvironmentConfig>, transport: Arc<dyn Transport>) -> Self {
        Self {
            config,
            transport,
            auth: None,
        }
    }

    /// Attaches an auth helper whose headers are merged into every request.
    pub fn with_auth(mut self, auth: Arc<AuthHelper>) -> Self {
        self.auth = Some(auth);
        self
    }

    /// Returns a copy of this helper with no auth attached.
    pub fn without_auth(&self) -> Self {
        Self {
            config: Arc::clone(&self.config),
            transport: Arc::clone(&self.transport),
            auth: None,
        }
    }

    /// The resolved environment config.
    pub fn config(&self) -> &Arc<EnvironmentConfig> {
        &self.config
    }

    /// The underlying transport.
    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// The attached auth helper, if any.
    pub fn auth(&self) -> Option<&Arc<AuthHelper>> {
        self.auth.as_ref()
    }

    pub async fn get<T: DeserializeOwned>(
        &self,
        path: &str,
        options: RequestOptions,
    ) -> Result<ApiResponse<T>> {
        self.send(Method::GET, path, options).await
    }

    pub async fn post<T: DeserializeOwned>(
        &self,
        path: &str,
        options: RequestOptions,
    ) -> Result<ApiResponse<T>> {
        self.send(Method::POST, path, options).await
    }

    pub async fn put<T: DeserializeOwned>(
        &self,
        path: &str,
        options: RequestOptions,
    ) -> Result<ApiResponse<T>> {
        self.send(Method::PUT, path, options).await
    }

    pub async fn patch<T: DeserializeOwned>(
        &self,
        path: &str,
        options: RequestOptions,
    ) -> Result<ApiResponse<T>> {
        self.send(Method::PATCH, path, options).await
    }

    pub async fn delete<T: DeserializeOwned>(
        &self,
        path: &str,
        options: RequestOptions,
    ) -> Result<ApiResponse<T>> {
        self.send(Method::DELETE, path, options).await
    }

    /// Sends a request with any method.
    ///
    /// Header precedence, lowest first: config defaults, JSON content type,
    /// auth headers, per-call overrides.
    pub async fn send<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        options: RequestOptions,
    ) -> Result<ApiResponse<T>> {
        let url = self.build_url(path, &options.query)?;

        let mut headers = HeaderMap::new();
        for (name, value) in &self.config.default_headers {
            insert_header(&mut headers, name, value)?;
        }
        if options.body.is_some() && options.json_body {
            headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        }
        if !options.skip_auth {
            if let Some(auth) = &self.auth {
                if let Some(auth_headers) = auth.headers_for_request().await? {
                    headers.extend(auth_headers);
                }
            }
        }
        for (name, value) in &options.headers {
            insert_header(&mut headers, name, value)?;
        }

        let request = TransportRequest {
            method: method.clone(),
            url: url.clone(),
            headers,
            body: options.body,
            timeout: options.timeout.unwrap_or(self.config.timeout),
        };

        let response = match self.transport.send(request).await {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(method = %method, url = %url, error = %e, "request failed");
                return Err(e);
            }
        };

        tracing::debug!(
            method = %method,
            url = %url,
            status = response.status,
            elapsed_ms = response.elapsed.as_millis() as u64,
            "request completed"
        );

        ApiResponse::from_transport(response)
    }

    fn build_url(&self, path: &str, query: &[(String, String)]) -> Result<String> {
        let joined = self.config.url_for(path);
        if query.is_empty() {
            return Ok(joined);
        }

        let mut url = reqwest::Url::parse(&joined)
            .map_err(|e| Error::InvalidRequest(format!("invalid URL '{}': {}", joined, e)))?;
        url.query_pairs_mut().extend_pairs(query.iter());
        Ok(url.into())
    }
}

fn insert_header(headers: &mut HeaderMap, name: &str, value: &str) -> Result<()> {
    let name = HeaderName::from_bytes(name.as_bytes())
        .map_err(|_| Error::InvalidRequest(format!("invalid header name '{}'", name)))?;
    let value = HeaderValue::from_str(value)
        .map_err(|_| Error::InvalidRequest(format!("invalid value for header '{}'", name)))?;
    headers.insert(name, value);
    Ok(())
}
