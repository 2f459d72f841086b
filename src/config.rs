//! Per-environment configuration resolution.
//!
//! Settings are resolved once per run into an immutable [`EnvironmentConfig`]
//! that is passed explicitly to every helper. Sources, from highest to lowest
//! precedence: environment-scoped variables (`STAGING_BASE_URL`), the
//! matching profile from an optional profiles file, generic variables
//! (`BASE_URL`), built-in defaults.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize, Serializer};

use crate::error::{Error, Result};

/// Environment names recognized without a profiles file.
pub const KNOWN_ENVIRONMENTS: &[&str] = &["local", "dev", "staging", "production"];

/// Environment used when `TEST_ENV` is not set.
pub const DEFAULT_ENVIRONMENT: &str = "dev";

/// Variable selecting the environment for a run.
pub const ENV_SELECTOR: &str = "TEST_ENV";

const DEFAULT_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_LOGIN_PATH: &str = "/auth/login";
const DEFAULT_REFRESH_PATH: &str = "/auth/refresh";
const DEFAULT_REFRESH_MARGIN_SECS: u64 = 60;

/// Username/password pair used to log in.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    #[serde(serialize_with = "redacted")]
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

fn redacted<S: Serializer>(_: &str, serializer: S) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_str("[REDACTED]")
}

/// Settings for the login and refresh flow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuthSettings {
    /// Path of the login endpoint, relative to the base URL.
    pub login_path: String,
    /// Path of the token refresh endpoint.
    pub refresh_path: String,
    /// Refresh when the token expires within this margin.
    pub refresh_margin: Duration,
    /// Attempts allowed when login hits a transport failure.
    pub max_login_attempts: u32,
    /// Log in with the configured credentials on the first authenticated call.
    pub lazy_login: bool,
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            login_path: DEFAULT_LOGIN_PATH.to_string(),
            refresh_path: DEFAULT_REFRESH_PATH.to_string(),
            refresh_margin: Duration::from_secs(DEFAULT_REFRESH_MARGIN_SECS),
            max_login_attempts: 1,
            lazy_login: false,
        }
    }
}

/// Fully resolved settings for one environment. Read-only after resolution.
#[derive(Debug, Clone, Serialize)]
pub struct EnvironmentConfig {
    /// Environment name (lowercase).
    pub name: String,
    /// Base URL that request paths are joined onto.
    pub base_url: String,
    /// Default per-request timeout.
    pub timeout: Duration,
    /// Headers applied to every request unless overridden.
    pub default_headers: BTreeMap<String, String>,
    /// Credentials for login, if configured.
    pub credentials: Option<Credentials>,
    /// Login/refresh settings.
    pub auth: AuthSettings,
    /// Log filter directive.
    pub log_level: String,
}

impl EnvironmentConfig {
    /// Creates a config pointing at `base_url` with default settings.
    pub fn for_base_url(name: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            base_url: base_url.into(),
            timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
            default_headers: default_headers(),
            credentials: None,
            auth: AuthSettings::default(),
            log_level: DEFAULT_LOG_LEVEL.to_string(),
        }
    }

    /// Sets the credential set.
    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    /// Sets the default timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Adds a default header.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.default_headers.insert(name.into(), value.into());
        self
    }

    /// Replaces the auth settings.
    pub fn with_auth(mut self, auth: AuthSettings) -> Self {
        self.auth = auth;
        self
    }

    /// Joins `path` onto the base URL, keeping any base path prefix.
    ///
    /// Absolute `http(s)://` URLs are returned unchanged.
    pub fn url_for(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            return path.to_string();
        }

        let base = self.base_url.trim_end_matches('/');
        let path = path.trim_start_matches('/');
        if path.is_empty() {
            base.to_string()
        } else {
            format!("{}/{}", base, path)
        }
    }
}

fn default_headers() -> BTreeMap<String, String> {
    BTreeMap::from([("Accept".to_string(), "application/json".to_string())])
}

/// One profile in a profiles file. Every field is optional.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProfileSpec {
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub credentials: Option<Credentials>,
}

/// Named environment profiles loaded from TOML or YAML.
///
/// ```toml
/// [environments.staging]
/// base_url = "https://staging.example.com/api"
/// timeout_ms = 10000
///
/// [environments.staging.headers]
/// X-Client = "api-tests"
/// ```
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProfilesFile {
    #[serde(default)]
    pub environments: BTreeMap<String, ProfileSpec>,
}

impl ProfilesFile {
    /// Loads profiles from a `.toml`, `.yaml` or `.yml` file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;

        match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => Self::from_toml_str(&content),
            Some("yaml") | Some("yml") => Self::from_yaml_str(&content),
            _ => Err(Error::Config(format!(
                "unsupported profiles file extension: {}",
                path.display()
            ))),
        }
    }

    /// Parses profiles from TOML.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let file: ProfilesFile = toml::from_str(content)
            .map_err(|e| Error::Config(format!("failed to parse profiles: {}", e)))?;
        Ok(file.normalized())
    }

    /// Parses profiles from YAML.
    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let file: ProfilesFile = serde_yaml::from_str(content)
            .map_err(|e| Error::Config(format!("failed to parse profiles: {}", e)))?;
        Ok(file.normalized())
    }

    fn normalized(self) -> Self {
        Self {
            environments: self
                .environments
                .into_iter()
                .map(|(name, spec)| (normalize_name(&name), spec))
                .collect(),
        }
    }
}

/// Resolves environment names into [`EnvironmentConfig`]s.
#[derive(Debug, Clone, Default)]
pub struct ConfigProvider {
    vars: HashMap<String, String>,
    profiles: ProfilesFile,
}

impl ConfigProvider {
    /// Snapshots the process environment.
    pub fn from_env() -> Self {
        Self::from_vars(std::env::vars())
    }

    /// Uses the given key/value map instead of the process environment.
    pub fn from_vars<I, K, V>(vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            vars: vars.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
            profiles: ProfilesFile::default(),
        }
    }

    /// Adds profiles; their names join the recognized set.
    pub fn with_profiles(mut self, profiles: ProfilesFile) -> Self {
        self.profiles = profiles;
        self
    }

    /// Loads profiles from a file.
    pub fn with_profiles_file(self, path: impl AsRef<Path>) -> Result<Self> {
        let profiles = ProfilesFile::load(path)?;
        Ok(self.with_profiles(profiles))
    }

    /// Returns every recognized environment name.
    pub fn recognized_environments(&self) -> Vec<String> {
        let mut names: Vec<String> = KNOWN_ENVIRONMENTS.iter().map(|n| n.to_string()).collect();
        for name in self.profiles.environments.keys() {
            if !names.contains(name) {
                names.push(name.clone());
            }
        }
        names
    }

    /// Returns true if `name` is a recognized environment.
    pub fn is_recognized(&self, name: &str) -> bool {
        let name = normalize_name(name);
        KNOWN_ENVIRONMENTS.contains(&name.as_str()) || self.profiles.environments.contains_key(&name)
    }

    /// Environment name selected by `TEST_ENV`, or the default.
    pub fn selected_environment(&self) -> String {
        self.var(ENV_SELECTOR)
            .map(normalize_name)
            .unwrap_or_else(|| DEFAULT_ENVIRONMENT.to_string())
    }

    /// Resolves the environment selected by `TEST_ENV`.
    pub fn resolve_selected(&self) -> Result<Arc<EnvironmentConfig>> {
        self.resolve(&self.selected_environment())
    }

    /// Resolves a named environment into a complete config.
    pub fn resolve(&self, name: &str) -> Result<Arc<EnvironmentConfig>> {
        let name = normalize_name(name);
        if !self.is_recognized(&name) {
            return Err(Error::ConfigNotFound(name));
        }

        let profile = self
            .profiles
            .environments
            .get(&name)
            .cloned()
            .unwrap_or_default();
        let prefix = env_prefix(&name);
        let incomplete = |reason: String| Error::ConfigIncomplete {
            environment: name.clone(),
            reason,
        };

        let base_url = self
            .var(&format!("{}_BASE_URL", prefix))
            .map(str::to_string)
            .or(profile.base_url)
            .or_else(|| self.var("BASE_URL").map(str::to_string))
            .ok_or_else(|| incomplete("BASE_URL is not set".to_string()))?;
        validate_base_url(&base_url).map_err(incomplete)?;

        let timeout_ms = if let Some(raw) = self.var(&format!("{}_TIMEOUT_MS", prefix)) {
            parse_positive(raw, "timeout").map_err(incomplete)?
        } else if let Some(ms) = profile.timeout_ms {
            ms
        } else if let Some(raw) = self.var("API_TIMEOUT_MS") {
            parse_positive(raw, "timeout").map_err(incomplete)?
        } else {
            DEFAULT_TIMEOUT_MS
        };
        if timeout_ms == 0 {
            return Err(incomplete("timeout must be a positive integer".to_string()));
        }

        let credentials = match self.scoped_credentials(&prefix).map_err(incomplete)? {
            Some(credentials) => Some(credentials),
            None => match profile.credentials {
                Some(credentials) => Some(credentials),
                None => self.generic_credentials().map_err(incomplete)?,
            },
        };

        let auth = self.auth_settings().map_err(incomplete)?;

        let mut default_headers = default_headers();
        default_headers.extend(profile.headers);

        let log_level = self
            .var("LOG_LEVEL")
            .unwrap_or(DEFAULT_LOG_LEVEL)
            .to_string();

        tracing::debug!(environment = %name, base_url = %base_url, "resolved environment config");

        Ok(Arc::new(EnvironmentConfig {
            name,
            base_url,
            timeout: Duration::from_millis(timeout_ms),
            default_headers,
            credentials,
            auth,
            log_level,
        }))
    }

    fn var(&self, key: &str) -> Option<&str> {
        self.vars
            .get(key)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }

    fn scoped_credentials(&self, prefix: &str) -> std::result::Result<Option<Credentials>, String> {
        self.credential_pair(
            &format!("{}_API_USERNAME", prefix),
            &format!("{}_API_PASSWORD", prefix),
        )
    }

    fn generic_credentials(&self) -> std::result::Result<Option<Credentials>, String> {
        self.credential_pair("API_USERNAME", "API_PASSWORD")
    }

    fn credential_pair(
        &self,
        user_key: &str,
        pass_key: &str,
    ) -> std::result::Result<Option<Credentials>, String> {
        match (self.var(user_key), self.var(pass_key)) {
            (Some(username), Some(password)) => Ok(Some(Credentials::new(username, password))),
            (None, None) => Ok(None),
            (Some(_), None) => Err(format!("{} is set but {} is missing", user_key, pass_key)),
            (None, Some(_)) => Err(format!("{} is set but {} is missing", pass_key, user_key)),
        }
    }

    fn auth_settings(&self) -> std::result::Result<AuthSettings, String> {
        let defaults = AuthSettings::default();

        let refresh_margin = match self.var("AUTH_REFRESH_MARGIN_SECS") {
            Some(raw) => Duration::from_secs(
                raw.parse::<u64>()
                    .map_err(|_| format!("AUTH_REFRESH_MARGIN_SECS is not a number: '{}'", raw))?,
            ),
            None => defaults.refresh_margin,
        };

        let max_login_attempts = match self.var("AUTH_MAX_LOGIN_ATTEMPTS") {
            Some(raw) => parse_positive(raw, "AUTH_MAX_LOGIN_ATTEMPTS")?
                .try_into()
                .map_err(|_| format!("AUTH_MAX_LOGIN_ATTEMPTS is too large: '{}'", raw))?,
            None => defaults.max_login_attempts,
        };

        let lazy_login = match self.var("AUTH_LAZY_LOGIN") {
            Some(raw) => parse_bool(raw)
                .ok_or_else(|| format!("AUTH_LAZY_LOGIN is not a boolean: '{}'", raw))?,
            None => defaults.lazy_login,
        };

        Ok(AuthSettings {
            login_path: self
                .var("AUTH_LOGIN_PATH")
                .map(str::to_string)
                .unwrap_or(defaults.login_path),
            refresh_path: self
                .var("AUTH_REFRESH_PATH")
                .map(str::to_string)
                .unwrap_or(defaults.refresh_path),
            refresh_margin,
            max_login_attempts,
            lazy_login,
        })
    }
}

fn normalize_name(name: &str) -> String {
    name.trim().to_ascii_lowercase()
}

fn env_prefix(name: &str) -> String {
    name.to_ascii_uppercase().replace('-', "_")
}

fn validate_base_url(raw: &str) -> std::result::Result<(), String> {
    let url = reqwest::Url::parse(raw).map_err(|e| format!("invalid base URL '{}': {}", raw, e))?;
    match url.scheme() {
        "http" | "https" => Ok(()),
        other => Err(format!("base URL must be http or https, got '{}'", other)),
    }
}

fn parse_positive(raw: &str, what: &str) -> std::result::Result<u64, String> {
    match raw.parse::<u64>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(format!("{} must be a positive integer, got '{}'", what, raw)),
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
