//! Per-test composition of the helpers.
//!
//! A [`FixtureComposer`] holds the resolved configuration and builds a fresh
//! [`TestContext`] on every [`compose`](FixtureComposer::compose) call, so no
//! session or generator state leaks from one test into another.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use crate::api::ApiHelper;
use crate::auth::AuthHelper;
use crate::config::{ConfigProvider, EnvironmentConfig};
use crate::error::Result;
use crate::generator::DataGenerator;
use crate::logging;
use crate::transport::{ReqwestTransport, Transport};

/// Everything a single test needs.
#[derive(Clone)]
pub struct TestContext {
    /// Shared read-only configuration.
    pub config: Arc<EnvironmentConfig>,
    /// Raw transport, for requests that bypass the helpers.
    pub transport: Arc<dyn Transport>,
    /// API helper with `auth` attached.
    pub api: ApiHelper,
    /// Session owner for this context only.
    pub auth: Arc<AuthHelper>,
    pub data: Arc<DataGenerator>,
}

impl TestContext {
    /// Helper that never sends auth headers.
    pub fn anonymous_api(&self) -> ApiHelper {
        self.api.without_auth()
    }
}

impl fmt::Debug for TestContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TestContext")
            .field("environment", &self.config.name)
            .field("base_url", &self.config.base_url)
            .field("transport", &self.transport.name())
            .field("auth_state", &self.auth.state())
            .finish()
    }
}

/// Builds isolated [`TestContext`]s for one environment.
pub struct FixtureComposer {
    config: Arc<EnvironmentConfig>,
    transport: Option<Arc<dyn Transport>>,
}

impl FixtureComposer {
    pub fn new(config: Arc<EnvironmentConfig>) -> Self {
        Self {
            config,
            transport: None,
        }
    }

    /// Resolves `environment` through `provider`.
    pub fn from_provider(provider: &ConfigProvider, environment: &str) -> Result<Self> {
        Ok(Self::new(provider.resolve(environment)?))
    }

    /// Uses `transport` for every composed context instead of a fresh
    /// reqwest client.
    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn config(&self) -> &Arc<EnvironmentConfig> {
        &self.config
    }

    /// Builds a new context. Auth starts anonymous.
    pub fn compose(&self) -> Result<TestContext> {
        let transport: Arc<dyn Transport> = match &self.transport {
            Some(transport) => Arc::clone(transport),
            None => Arc::new(ReqwestTransport::new()?),
        };

        let base = ApiHelper::new(Arc::clone(&self.config), Arc::clone(&transport));
        let auth = Arc::new(AuthHelper::new(&base));
        let api = base.with_auth(Arc::clone(&auth));

        tracing::debug!(
            environment = %self.config.name,
            transport = transport.name(),
            "Composed test context"
        );

        Ok(TestContext {
            config: Arc::clone(&self.config),
            transport,
            api,
            auth,
            data: Arc::new(DataGenerator::new()),
        })
    }

    /// Composes a context, initializes logging and runs `body` with it.
    ///
    /// The session is ended when `body` returns, whatever its outcome.
    pub async fn run<F, Fut, T>(&self, body: F) -> Result<T>
    where
        F: FnOnce(TestContext) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        logging::init(&self.config.log_level);

        let ctx = self.compose()?;
        let auth = Arc::clone(&ctx.auth);
        let result = body(ctx).await;
        auth.logout().await;

        if let Err(e) = &result {
            tracing::warn!(environment = %self.config.name, error = %e, "Test body failed");
        }
        result
    }
}
