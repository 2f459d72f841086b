//! api-harness - helpers for writing HTTP API tests
//!
//! This library resolves per-environment configuration, sends requests through
//! a pluggable transport, manages an auth session with token refresh, generates
//! randomized test entities and validates responses. A [`FixtureComposer`]
//! wires these together into an isolated [`TestContext`] per test.

pub mod api;
pub mod auth;
pub mod backoff;
pub mod config;
pub mod error;
pub mod fixture;
pub mod generator;
pub mod logging;
pub mod transport;
pub mod validator;

pub use error::{Error, Result, TransportErrorKind};

pub use api::{ApiHelper, ApiResponse, RequestOptions};
pub use auth::{AuthHelper, AuthState, Session};
pub use backoff::RetryPolicy;
pub use config::{
    AuthSettings, ConfigProvider, Credentials, EnvironmentConfig, ProfileSpec, ProfilesFile,
    DEFAULT_ENVIRONMENT, ENV_SELECTOR, KNOWN_ENVIRONMENTS,
};
pub use fixture::{FixtureComposer, TestContext};
pub use generator::{DataGenerator, EntitySchema, FieldFormat, FieldSpec, Post, User};
pub use transport::{ReqwestTransport, Transport, TransportRequest, TransportResponse};
pub use validator::{EntityRules, FieldRule, JsonKind, ResponseValidator};
