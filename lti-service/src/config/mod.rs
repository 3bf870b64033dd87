use service_core::config as core_config;
use service_core::error::AppError;
use service_core::utils::signature::normalize_url;
use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::models::Consumer;

#[derive(Debug, Clone)]
pub struct LtiConfig {
    pub common: core_config::Config,
    pub environment: Environment,
    pub service_name: String,
    pub service_version: String,
    pub log_level: String,
    pub otlp_endpoint: Option<String>,
    /// Public base URL, no trailing slash. Launch signatures are checked
    /// against this origin.
    pub site_url: String,
    pub cookie_domain: Option<String>,
    pub database: Option<DatabaseConfig>,
    pub redis: Option<RedisConfig>,
    pub lti: LtiSettings,
    pub rate_limit: RateLimitConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Dev,
    Prod,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

#[derive(Debug, Clone)]
pub struct RedisConfig {
    pub url: String,
}

#[derive(Debug, Clone)]
pub struct LtiSettings {
    pub enabled: bool,
    pub consumers: Vec<Consumer>,
    pub freshness_window_seconds: i64,
    pub launch_timeout_ms: u64,
    /// Create local accounts for unknown launchers instead of sending them
    /// to signup.
    pub auto_provision_users: bool,
    pub nonce_cache_capacity: usize,
}

impl Default for LtiSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            consumers: Vec::new(),
            freshness_window_seconds: 300,
            launch_timeout_ms: 5000,
            auto_provision_users: false,
            nonce_cache_capacity: 100_000,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub launch_attempts: u32,
    pub launch_window_seconds: u64,
    /// Key launches on the first `x-forwarded-for` hop. Only safe behind a
    /// proxy that overwrites the header.
    pub trust_forwarded_for: bool,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            launch_attempts: 30,
            launch_window_seconds: 60,
            trust_forwarded_for: false,
        }
    }
}

impl LtiConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let common_config = core_config::Config::load()?;

        let env_str = env::var("ENVIRONMENT").unwrap_or_else(|_| "dev".to_string());
        let environment: Environment = env_str
            .parse()
            .map_err(|e: String| AppError::ConfigError(anyhow::anyhow!(e)))?;

        let is_prod = environment == Environment::Prod;

        let database = match env::var("DATABASE_URL") {
            Ok(url) => Some(DatabaseConfig {
                url,
                max_connections: parse_env("DATABASE_MAX_CONNECTIONS", "10")?,
                min_connections: parse_env("DATABASE_MIN_CONNECTIONS", "1")?,
            }),
            Err(_) => None,
        };

        let config = LtiConfig {
            common: common_config,
            environment,
            service_name: get_env("SERVICE_NAME", Some("lti-service"), is_prod)?,
            service_version: get_env("SERVICE_VERSION", Some(env!("CARGO_PKG_VERSION")), is_prod)?,
            log_level: get_env("LOG_LEVEL", Some("info"), is_prod)?,
            otlp_endpoint: env::var("OTLP_ENDPOINT").ok().filter(|v| !v.is_empty()),
            site_url: get_env("SITE_URL", Some("http://localhost:8080"), is_prod)?
                .trim_end_matches('/')
                .to_string(),
            cookie_domain: env::var("COOKIE_DOMAIN").ok().filter(|v| !v.is_empty()),
            database,
            redis: env::var("REDIS_URL")
                .ok()
                .filter(|v| !v.is_empty())
                .map(|url| RedisConfig { url }),
            lti: LtiSettings {
                enabled: parse_env("LTI_ENABLE", "false")?,
                consumers: load_consumers()?,
                freshness_window_seconds: parse_env("LTI_FRESHNESS_WINDOW_SECONDS", "300")?,
                launch_timeout_ms: parse_env("LTI_LAUNCH_TIMEOUT_MS", "5000")?,
                auto_provision_users: parse_env("LTI_AUTO_PROVISION_USERS", "false")?,
                nonce_cache_capacity: parse_env("LTI_NONCE_CACHE_CAPACITY", "100000")?,
            },
            rate_limit: RateLimitConfig {
                launch_attempts: parse_env("RATE_LIMIT_LAUNCH_ATTEMPTS", "30")?,
                launch_window_seconds: parse_env("RATE_LIMIT_LAUNCH_WINDOW_SECONDS", "60")?,
                trust_forwarded_for: parse_env("RATE_LIMIT_TRUST_FORWARDED_FOR", "false")?,
            },
        };

        config.validate()?;
        Ok(config)
    }

    /// Development settings with LTI enabled for the given consumers.
    pub fn development(site_url: &str, consumers: Vec<Consumer>) -> Self {
        Self {
            common: core_config::Config::default(),
            environment: Environment::Dev,
            service_name: "lti-service".to_string(),
            service_version: env!("CARGO_PKG_VERSION").to_string(),
            log_level: "info".to_string(),
            otlp_endpoint: None,
            site_url: site_url.trim_end_matches('/').to_string(),
            cookie_domain: None,
            database: None,
            redis: None,
            lti: LtiSettings {
                enabled: true,
                consumers,
                ..LtiSettings::default()
            },
            rate_limit: RateLimitConfig::default(),
        }
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if self.common.port == 0 {
            return Err(config_error("PORT must be greater than 0"));
        }

        normalize_url(&self.site_url)
            .map_err(|e| AppError::ConfigError(anyhow::anyhow!("SITE_URL is invalid: {}", e)))?;

        if self.lti.enabled && self.lti.consumers.is_empty() {
            return Err(config_error(
                "LTI_ENABLE is set but no consumers are configured (LTI_CONSUMERS or LTI_CONSUMERS_FILE)",
            ));
        }

        if self.lti.freshness_window_seconds <= 0 {
            return Err(config_error("LTI_FRESHNESS_WINDOW_SECONDS must be positive"));
        }

        if self.lti.launch_timeout_ms == 0 {
            return Err(config_error("LTI_LAUNCH_TIMEOUT_MS must be positive"));
        }

        if self.lti.nonce_cache_capacity == 0 {
            return Err(config_error("LTI_NONCE_CACHE_CAPACITY must be positive"));
        }

        if self.rate_limit.launch_attempts == 0 || self.rate_limit.launch_window_seconds == 0 {
            return Err(config_error("RATE_LIMIT_LAUNCH_* values must be positive"));
        }

        if self.environment == Environment::Prod {
            if self.database.is_none() {
                return Err(config_error("DATABASE_URL is required in production"));
            }

            if !self.site_url.starts_with("https://") {
                return Err(config_error("SITE_URL must use https in production"));
            }

            if self.redis.is_none() {
                tracing::warn!("REDIS_URL not set: nonce replay cache is local to this replica");
            }
        }

        Ok(())
    }

    pub fn launch_timeout(&self) -> Duration {
        Duration::from_millis(self.lti.launch_timeout_ms)
    }

    pub fn secure_cookies(&self) -> bool {
        self.site_url.starts_with("https://")
    }
}

/// Consumers from `LTI_CONSUMERS` (inline JSON) or `LTI_CONSUMERS_FILE`.
fn load_consumers() -> Result<Vec<Consumer>, AppError> {
    if let Ok(raw) = env::var("LTI_CONSUMERS") {
        return parse_consumers(&raw);
    }
    match env::var("LTI_CONSUMERS_FILE") {
        Ok(path) => parse_consumers(&std::fs::read_to_string(&path)?),
        Err(_) => Ok(Vec::new()),
    }
}

pub fn parse_consumers(raw: &str) -> Result<Vec<Consumer>, AppError> {
    serde_json::from_str(raw).map_err(|e| {
        AppError::ConfigError(anyhow::anyhow!("Invalid LTI consumer configuration: {}", e))
    })
}

fn config_error(message: &str) -> AppError {
    AppError::ConfigError(anyhow::anyhow!(message.to_string()))
}

fn parse_env<T>(key: &str, default: &str) -> Result<T, AppError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let raw = env::var(key).unwrap_or_else(|_| default.to_string());
    raw.trim()
        .parse()
        .map_err(|e: T::Err| AppError::ConfigError(anyhow::anyhow!("{} is invalid: {}", key, e)))
}

fn get_env(key: &str, default: Option<&str>, is_prod: bool) -> Result<String, AppError> {
    match env::var(key) {
        Ok(val) => Ok(val),
        Err(_) => {
            if is_prod {
                Err(AppError::ConfigError(anyhow::anyhow!(format!(
                    "{} is required in production but not set",
                    key
                ))))
            } else if let Some(def) = default {
                Ok(def.to_string())
            } else {
                Err(AppError::ConfigError(anyhow::anyhow!(format!(
                    "{} is required but not set",
                    key
                ))))
            }
        }
    }
}

impl FromStr for Environment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "dev" => Ok(Environment::Dev),
            "prod" => Ok(Environment::Prod),
            _ => Err(format!("Invalid environment: {}", s)),
        }
    }
}
