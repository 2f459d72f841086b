//! api-harness CLI
//!
//! Smoke-test tool for checking environment configuration and reachability.

use std::sync::Arc;

use api_harness::{
    ApiHelper, AuthHelper, ConfigProvider, EnvironmentConfig, Error, ReqwestTransport,
    RequestOptions, Transport,
};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().collect();
    let provider = ConfigProvider::from_env();

    let outcome = match args.get(1).map(String::as_str) {
        Some("config") => show_config(&provider, args.get(2)),
        Some("get") => match args.get(2) {
            Some(path) => get(&provider, path, args.get(3)).await,
            None => {
                usage(&args[0]);
                std::process::exit(2);
            }
        },
        _ => {
            usage(&args[0]);
            std::process::exit(2);
        }
    };

    if let Err(e) = outcome {
        eprintln!("error: {}", e);
        std::process::exit(1);
    }
}

fn usage(program: &str) {
    eprintln!("Usage:");
    eprintln!("  {} config [ENV]      Print the resolved configuration", program);
    eprintln!("  {} get PATH [ENV]    Send a GET request and print the response", program);
    eprintln!("\nEnvironment variables:");
    eprintln!("  TEST_ENV=local|dev|staging|production  Select environment (default: dev)");
    eprintln!("  <ENV>_BASE_URL or BASE_URL               Base URL for the environment");
    eprintln!("  <ENV>_API_USERNAME / <ENV>_API_PASSWORD  Credentials for login");
}

fn resolve(provider: &ConfigProvider, env: Option<&String>) -> Result<Arc<EnvironmentConfig>, Error> {
    match env {
        Some(name) => provider.resolve(name),
        None => provider.resolve_selected(),
    }
}

fn show_config(provider: &ConfigProvider, env: Option<&String>) -> Result<(), Error> {
    let config = resolve(provider, env)?;
    println!("{}", serde_json::to_string_pretty(config.as_ref())?);
    Ok(())
}

async fn get(provider: &ConfigProvider, path: &str, env: Option<&String>) -> Result<(), Error> {
    let config = resolve(provider, env)?;
    let transport: Arc<dyn Transport> = Arc::new(ReqwestTransport::new()?);
    let base = ApiHelper::new(Arc::clone(&config), transport);

    let api = if config.credentials.is_some() {
        let auth = Arc::new(AuthHelper::new(&base));
        match auth.login_with_configured_credentials().await {
            Ok(_) => tracing::info!(environment = %config.name, "Logged in"),
            Err(e) if e.is_transport() => return Err(e),
            Err(e) => tracing::warn!(error = %e, "Login failed, continuing without auth"),
        }
        base.with_auth(auth)
    } else {
        base
    };

    let response = match api.get::<serde_json::Value>(path, RequestOptions::new()).await {
        Ok(response) => response,
        Err(e) if e.is_transport() => return Err(e),
        Err(e) => {
            eprintln!("warning: {}", e);
            return Ok(());
        }
    };

    println!("{} {} ({} ms)", response.status, config.url_for(path), response.elapsed.as_millis());
    println!("{}", serde_json::to_string_pretty(&response.body)?);
    Ok(())
}
