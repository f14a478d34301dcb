use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::env;
use std::path::Path;
use thiserror::Error;
use tracing::info;
use validator::Validate;

const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_ENV: &str = "development";
const DEFAULT_PORT: u16 = 8080;
const CONFIG_DIR: &str = "config";

/// Application configuration.
///
/// Loaded from optional `config/{default,<env>}.toml` files overridden by
/// `APP__`-prefixed environment variables (e.g. `APP__STRIPE_SECRET_KEY`).
#[derive(Clone, Debug, Deserialize, Validate)]
pub struct AppConfig {
    /// Database connection URL
    pub database_url: String,

    /// Server host address
    pub host: String,

    /// Server port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Application environment
    pub environment: String,

    /// Logging level
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Log in JSON format (structured logging)
    #[serde(default)]
    pub log_json: bool,

    /// Whether to provision the database schema on startup
    #[serde(default)]
    pub auto_migrate: bool,

    /// Payment gateway secret key
    #[validate(length(min = 1))]
    pub stripe_secret_key: String,

    /// Payment gateway API base URL (overridable for tests)
    #[serde(default = "default_stripe_api_base")]
    pub stripe_api_base: String,

    /// Shared secret used to verify inbound webhook signatures
    #[validate(length(min = 1))]
    pub webhook_secret: String,

    /// Maximum accepted age of a webhook signature timestamp, in seconds
    #[serde(default = "default_webhook_tolerance")]
    pub webhook_tolerance_secs: u64,

    /// ISO currency code charged at the gateway
    #[serde(default = "default_currency")]
    pub currency: String,

    /// Minor units per major currency unit (100 for cents)
    #[serde(default = "default_minor_units")]
    pub currency_minor_units: u32,

    /// Bounded timeout for outbound gateway calls, in seconds
    #[serde(default = "default_gateway_timeout")]
    pub gateway_timeout_secs: u64,

    /// Maximum retry attempts for idempotent gateway calls
    #[serde(default = "default_gateway_retries")]
    pub gateway_max_retries: u32,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}
fn default_stripe_api_base() -> String {
    "https://api.stripe.com".to_string()
}
fn default_webhook_tolerance() -> u64 {
    300
}
fn default_currency() -> String {
    "usd".to_string()
}
fn default_minor_units() -> u32 {
    100
}
fn default_gateway_timeout() -> u64 {
    10
}
fn default_gateway_retries() -> u32 {
    3
}

impl AppConfig {
    /// Construct a configuration directly, primarily for tests.
    pub fn new(
        database_url: String,
        host: String,
        port: u16,
        environment: String,
        stripe_secret_key: String,
        webhook_secret: String,
    ) -> Self {
        Self {
            database_url,
            host,
            port,
            environment,
            log_level: default_log_level(),
            log_json: false,
            auto_migrate: false,
            stripe_secret_key,
            stripe_api_base: default_stripe_api_base(),
            webhook_secret,
            webhook_tolerance_secs: default_webhook_tolerance(),
            currency: default_currency(),
            currency_minor_units: default_minor_units(),
            gateway_timeout_secs: default_gateway_timeout(),
            gateway_max_retries: default_gateway_retries(),
        }
    }

    pub fn log_level(&self) -> &str {
        &self.log_level
    }

    pub fn is_production(&self) -> bool {
        self.environment == "production"
    }
}

#[derive(Debug, Error)]
pub enum AppConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] ConfigError),
    #[error("Configuration validation failed: {0}")]
    Validation(#[from] validator::ValidationErrors),
}

/// Load configuration from files and environment.
///
/// Gateway secrets have no defaults on purpose; they must come from the
/// environment or a config file.
pub fn load_config() -> Result<AppConfig, AppConfigError> {
    let run_env = env::var("RUN_ENV")
        .or_else(|_| env::var("APP_ENV"))
        .unwrap_or_else(|_| DEFAULT_ENV.to_string());
    info!("Loading configuration for environment: {}", run_env);

    if !Path::new(CONFIG_DIR).exists() {
        info!(
            "Config directory '{}' not found; relying on built-in defaults and environment variables",
            CONFIG_DIR
        );
    }

    let config = Config::builder()
        .set_default("database_url", "sqlite://storefront.db?mode=rwc")?
        .set_default("host", "0.0.0.0")?
        .set_default("port", DEFAULT_PORT as i64)?
        .set_default("environment", DEFAULT_ENV)?
        .set_default("log_level", DEFAULT_LOG_LEVEL)?
        .set_default("log_json", false)?
        .add_source(File::with_name(&format!("{}/default", CONFIG_DIR)).required(false))
        .add_source(File::with_name(&format!("{}/{}", CONFIG_DIR, run_env)).required(false))
        .add_source(Environment::with_prefix("APP").separator("__"))
        .build()?;

    let app_config: AppConfig = config.try_deserialize()?;
    app_config.validate()?;

    Ok(app_config)
}

/// Initialize the global tracing subscriber.
pub fn init_tracing(level: &str, json: bool) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let default_directive = format!("storefront_api={},tower_http=info", level);
    let filter_directive = env::var("RUST_LOG")
        .ok()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or(default_directive);

    let filter = EnvFilter::try_new(filter_directive)
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_LEVEL));

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer())
            .init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> AppConfig {
        AppConfig::new(
            "sqlite::memory:".to_string(),
            "127.0.0.1".to_string(),
            18080,
            "test".to_string(),
            "sk_test_abc".to_string(),
            "whsec_test".to_string(),
        )
    }

    #[test]
    fn defaults_are_applied() {
        let cfg = test_config();
        assert_eq!(cfg.currency, "usd");
        assert_eq!(cfg.currency_minor_units, 100);
        assert_eq!(cfg.webhook_tolerance_secs, 300);
        assert_eq!(cfg.gateway_max_retries, 3);
        assert!(!cfg.is_production());
    }

    #[test]
    fn validation_rejects_empty_secrets() {
        let mut cfg = test_config();
        cfg.stripe_secret_key = String::new();
        assert!(cfg.validate().is_err());
    }
}
