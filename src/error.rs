//! Error types for the api-harness helpers.

use std::fmt;

use thiserror::Error;

/// Category of a transport-level failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    /// The request did not complete within its timeout.
    Timeout,
    /// The connection could not be established.
    Connect,
    /// Any other failure while sending or reading.
    Other,
}

impl fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportErrorKind::Timeout => write!(f, "timeout"),
            TransportErrorKind::Connect => write!(f, "connect"),
            TransportErrorKind::Other => write!(f, "other"),
        }
    }
}

/// Top-level error type for helper operations.
#[derive(Error, Debug)]
pub enum Error {
    /// The environment name is not one of the recognized profiles.
    #[error("no configuration for environment '{0}'")]
    ConfigNotFound(String),

    /// The environment is recognized but a required value is missing or invalid.
    #[error("configuration for environment '{environment}' is incomplete: {reason}")]
    ConfigIncomplete { environment: String, reason: String },

    /// A profiles file could not be read or parsed.
    #[error("configuration error: {0}")]
    Config(String),

    /// Network or timeout failure. Distinct from a non-2xx response.
    #[error("transport error ({kind}): {message}")]
    Transport {
        kind: TransportErrorKind,
        message: String,
    },

    /// Login or refresh was rejected, or returned a malformed body.
    #[error("authentication failed (status {}): {body}", display_status(status))]
    AuthenticationFailed { status: Option<u16>, body: String },

    /// Auth headers were requested without a session.
    #[error("not authenticated: call login first")]
    NotAuthenticated,

    /// An assertion on a response did not hold.
    #[error("validation failed: {0}")]
    ValidationFailed(String),

    /// The response body could not be decoded into the requested type.
    #[error("failed to decode response body (status {status}): {message}")]
    Decode { status: u16, message: String },

    /// A header or URL could not be turned into a valid request.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// A request body could not be serialized.
    #[error("failed to serialize request body: {0}")]
    Serialization(#[from] serde_json::Error),

    /// No generator schema is registered for the requested kind.
    #[error("unknown entity kind '{0}'")]
    UnknownEntityKind(String),

    /// Overrides passed to the generator were not a JSON object.
    #[error("overrides must be a JSON object, got {0}")]
    InvalidOverrides(String),

    /// IO error while reading configuration.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Creates a transport error of the given kind.
    pub fn transport(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Error::Transport {
            kind,
            message: message.into(),
        }
    }

    /// Returns true if this is a transport timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Error::Transport {
                kind: TransportErrorKind::Timeout,
                ..
            }
        )
    }

    /// Returns true if this is any transport failure.
    pub fn is_transport(&self) -> bool {
        matches!(self, Error::Transport { .. })
    }

    /// HTTP status carried by the error, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            Error::AuthenticationFailed { status, .. } => *status,
            Error::Decode { status, .. } => Some(*status),
            _ => None,
        }
    }
}

fn display_status(status: &Option<u16>) -> String {
    match status {
        Some(code) => code.to_string(),
        None => "none".to_string(),
    }
}

/// Result type alias for helper operations.
pub type Result<T> = std::result::Result<T, Error>;
