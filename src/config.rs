use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::env;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::info;
use validator::{Validate, ValidationError};

use crate::db::transaction::RetryPolicy;

const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_ENV: &str = "development";
const CONFIG_DIR: &str = "config";

/// Warehouse locations the ledger falls back to.
#[derive(Clone, Debug, Deserialize, Validate)]
pub struct WarehouseConfig {
    /// Target of a lot release when no previous home is known.
    #[validate(range(min = 1))]
    pub default_location_id: i64,
    /// Location lots are moved to on quarantine. When unset, the first
    /// location flagged as quarantine is used.
    pub quarantine_location_id: Option<i64>,
}

/// Document number prefixes.
#[derive(Clone, Debug, Deserialize, Validate)]
pub struct NumberingConfig {
    #[validate(length(min = 1, max = 8))]
    pub order_prefix: String,
    #[validate(length(min = 1, max = 8))]
    pub invoice_prefix: String,
    #[validate(length(min = 1, max = 8))]
    pub credit_note_prefix: String,
}

/// Replay of units of work that failed on transient storage errors.
#[derive(Clone, Debug, Deserialize, Validate)]
pub struct RetryConfig {
    #[validate(range(min = 1, max = 10))]
    pub max_attempts: u32,
    pub backoff_ms: u64,
}

/// Application configuration
#[derive(Clone, Debug, Deserialize, Validate)]
pub struct AppConfig {
    #[validate(length(min = 1))]
    pub database_url: String,

    pub environment: String,

    #[validate(custom = "validate_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub log_json: bool,

    #[serde(default)]
    pub auto_migrate: bool,

    #[validate(range(min = 1, max = 100))]
    pub db_max_connections: u32,

    #[validate(range(min = 0, max = 100))]
    pub db_min_connections: u32,

    pub db_acquire_timeout_secs: u64,

    /// Deadline for operations started without an explicit one.
    #[validate(range(min = 1))]
    pub operation_timeout_secs: u64,

    #[validate(range(min = 1))]
    pub event_channel_capacity: usize,

    #[validate(range(min = 0, max = 365))]
    pub default_payment_terms_days: i32,

    #[validate]
    pub warehouse: WarehouseConfig,

    #[validate]
    pub numbering: NumberingConfig,

    #[validate]
    pub retry: RetryConfig,
}

impl AppConfig {
    /// Configuration with built-in defaults for the given database.
    pub fn with_database_url(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            environment: DEFAULT_ENV.to_string(),
            log_level: DEFAULT_LOG_LEVEL.to_string(),
            log_json: false,
            auto_migrate: true,
            db_max_connections: 10,
            db_min_connections: 1,
            db_acquire_timeout_secs: 8,
            operation_timeout_secs: 30,
            event_channel_capacity: 256,
            default_payment_terms_days: 14,
            warehouse: WarehouseConfig {
                default_location_id: 1,
                quarantine_location_id: None,
            },
            numbering: NumberingConfig {
                order_prefix: "AU".to_string(),
                invoice_prefix: "RE".to_string(),
                credit_note_prefix: "GS".to_string(),
            },
            retry: RetryConfig {
                max_attempts: 3,
                backoff_ms: 50,
            },
        }
    }

    pub fn is_development(&self) -> bool {
        self.environment.eq_ignore_ascii_case("development")
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry.max_attempts,
            backoff: Duration::from_millis(self.retry.backoff_ms),
        }
    }
}

/// Ledger-wide settings handed to every service.
#[derive(Clone, Debug)]
pub struct LedgerSettings {
    pub default_location_id: i64,
    pub quarantine_location_id: Option<i64>,
    pub order_prefix: String,
    pub invoice_prefix: String,
    pub credit_note_prefix: String,
    pub default_payment_terms_days: i32,
    pub retry: RetryPolicy,
    pub operation_timeout: Duration,
}

impl From<&AppConfig> for LedgerSettings {
    fn from(config: &AppConfig) -> Self {
        Self {
            default_location_id: config.warehouse.default_location_id,
            quarantine_location_id: config.warehouse.quarantine_location_id,
            order_prefix: config.numbering.order_prefix.clone(),
            invoice_prefix: config.numbering.invoice_prefix.clone(),
            credit_note_prefix: config.numbering.credit_note_prefix.clone(),
            default_payment_terms_days: config.default_payment_terms_days,
            retry: config.retry_policy(),
            operation_timeout: Duration::from_secs(config.operation_timeout_secs),
        }
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum AppConfigError {
    #[error("Configuration loading failed: {0}")]
    Load(#[from] ConfigError),

    #[error("Configuration validation failed: {0}")]
    Validation(#[from] validator::ValidationErrors),
}

/// Validates log level values
fn validate_log_level(level: &str) -> Result<(), ValidationError> {
    let valid_levels = ["trace", "debug", "info", "warn", "error"];
    if valid_levels.contains(&level.to_lowercase().as_str()) {
        Ok(())
    } else {
        let mut err = ValidationError::new("log_level");
        err.message = Some("Must be one of: trace, debug, info, warn, error".into());
        Err(err)
    }
}

/// Initializes the global tracing subscriber. `RUST_LOG` wins over `level`.
pub fn init_tracing(level: &str, json: bool) {
    use tracing_subscriber::{fmt, EnvFilter};

    let default_directive = format!("erp_fulfillment={},fulfillment_cli={},sea_orm=warn", level, level);
    let filter_directive = env::var("RUST_LOG")
        .ok()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or(default_directive);

    if json {
        let _ = fmt()
            .with_env_filter(EnvFilter::new(filter_directive))
            .json()
            .try_init();
    } else {
        let _ = fmt()
            .with_env_filter(EnvFilter::new(filter_directive))
            .try_init();
    }
}

/// Loads application configuration from `./config`.
///
/// Layers configuration sources in this order:
/// 1. Built-in defaults
/// 2. Default config (config/default.toml)
/// 3. Environment-specific config (config/{env}.toml)
/// 4. Environment variables (APP__*)
pub fn load_config() -> Result<AppConfig, AppConfigError> {
    load_config_from(Path::new(CONFIG_DIR))
}

pub fn load_config_from(config_dir: &Path) -> Result<AppConfig, AppConfigError> {
    let run_env = env::var("RUN_ENV")
        .or_else(|_| env::var("APP_ENV"))
        .unwrap_or_else(|_| DEFAULT_ENV.to_string());
    info!("Loading configuration for environment: {}", run_env);

    if !config_dir.exists() {
        info!(
            "Config directory '{}' not found; relying on built-in defaults and environment variables",
            config_dir.display()
        );
    }

    let config = Config::builder()
        .set_default("database_url", "sqlite://fulfillment.db?mode=rwc")?
        .set_default("environment", run_env.as_str())?
        .set_default("log_level", DEFAULT_LOG_LEVEL)?
        .set_default("log_json", false)?
        .set_default("auto_migrate", false)?
        .set_default("db_max_connections", 10)?
        .set_default("db_min_connections", 1)?
        .set_default("db_acquire_timeout_secs", 8)?
        .set_default("operation_timeout_secs", 30)?
        .set_default("event_channel_capacity", 256)?
        .set_default("default_payment_terms_days", 14)?
        .set_default("warehouse.default_location_id", 1)?
        .set_default("numbering.order_prefix", "AU")?
        .set_default("numbering.invoice_prefix", "RE")?
        .set_default("numbering.credit_note_prefix", "GS")?
        .set_default("retry.max_attempts", 3)?
        .set_default("retry.backoff_ms", 50)?
        .add_source(File::from(config_dir.join("default")).required(false))
        .add_source(File::from(config_dir.join(&run_env)).required(false))
        .add_source(Environment::with_prefix("APP").separator("__"))
        .build()?;

    let app_config: AppConfig = config.try_deserialize()?;
    app_config.validate()?;

    info!(
        environment = %app_config.environment,
        max_connections = app_config.db_max_connections,
        "Configuration loaded"
    );
    Ok(app_config)
}
