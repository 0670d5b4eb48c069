//! Configuration management
//!
//! Loads configuration from:
//! 1. Default values
//! 2. Configuration file (config/local.toml)
//! 3. Environment variables (override)
//!
//! The loaded `AppConfig` is immutable and passed into constructors at
//! startup; nothing reads configuration from a global.

use serde::Deserialize;
use std::path::PathBuf;

/// The maximum number of local accounts an instance may provision.
pub const MAX_LOCAL_ACCOUNTS: usize = 2;

/// Main application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub federation: FederationConfig,
    /// Local accounts to provision at startup (at most two).
    #[serde(default)]
    pub accounts: Vec<LocalAccountConfig>,
    pub logging: LoggingConfig,
}

/// Server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Bind address (e.g., "0.0.0.0")
    pub host: String,
    /// Port number (e.g., 8080)
    pub port: u16,
    /// Public domain (e.g., "social.example.com")
    pub domain: String,
    /// Protocol ("http" or "https")
    pub protocol: String,
}

impl ServerConfig {
    /// Get the base URL for the instance
    ///
    /// # Returns
    /// Full URL like "https://social.example.com"
    pub fn base_url(&self) -> String {
        format!("{}://{}", self.protocol, self.domain)
    }
}

/// Database configuration (SQLite only)
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Path to SQLite database file
    pub path: PathBuf,
}

/// Federation behavior configuration
#[derive(Debug, Clone, Deserialize)]
pub struct FederationConfig {
    /// Automatically accept inbound follow requests
    #[serde(default = "default_auto_accept_follows")]
    pub auto_accept_follows: bool,
    /// Allowed clock skew for the signed Date header, in seconds
    #[serde(default = "default_signature_clock_skew")]
    pub signature_clock_skew_seconds: i64,
    /// Remote actor rows older than this are refetched when
    /// signature verification fails against the cached key
    #[serde(default = "default_actor_staleness")]
    pub actor_staleness_seconds: i64,
    /// Timeout for remote actor/WebFinger/object fetches
    #[serde(default = "default_fetch_timeout")]
    pub fetch_timeout_seconds: u64,
    /// Timeout for outbound inbox POSTs
    #[serde(default = "default_deliver_timeout")]
    pub deliver_timeout_seconds: u64,
    /// Delivery attempts before a job is dropped
    #[serde(default = "default_delivery_max_attempts")]
    pub delivery_max_attempts: u32,
    /// Base delay for exponential delivery backoff, in seconds
    #[serde(default = "default_delivery_backoff")]
    pub delivery_backoff_seconds: u64,
    /// Consecutive relay delivery failures before auto-disable
    #[serde(default = "default_relay_failure_threshold")]
    pub relay_failure_threshold: i64,
}

fn default_auto_accept_follows() -> bool {
    true
}

fn default_signature_clock_skew() -> i64 {
    3600
}

fn default_actor_staleness() -> i64 {
    86400
}

fn default_fetch_timeout() -> u64 {
    15
}

fn default_deliver_timeout() -> u64 {
    10
}

fn default_delivery_max_attempts() -> u32 {
    3
}

fn default_delivery_backoff() -> u64 {
    30
}

fn default_relay_failure_threshold() -> i64 {
    3
}

/// A local account to provision at startup
#[derive(Debug, Clone, Deserialize)]
pub struct LocalAccountConfig {
    pub username: String,
    #[serde(default)]
    pub display_name: Option<String>,
    /// Bio/summary text
    #[serde(default)]
    pub summary: Option<String>,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    pub level: String,
    /// Log format: "pretty" or "json"
    pub format: String,
}

impl AppConfig {
    /// Load configuration from file and environment
    ///
    /// # Loading Order
    /// 1. Default values
    /// 2. config/default.toml (if exists)
    /// 3. config/local.toml (if exists)
    /// 4. Environment variables (DRIFTWAY_*)
    ///
    /// # Errors
    /// Returns error if configuration is invalid
    pub fn load() -> Result<Self, crate::error::AppError> {
        use config::{Config, Environment, File};

        let config = Config::builder()
            // Start with default values
            .set_default("server.host", "127.0.0.1")?
            .set_default("server.port", 8080)?
            .set_default("server.protocol", "http")?
            .set_default("federation.auto_accept_follows", true)?
            .set_default("federation.signature_clock_skew_seconds", 3600)?
            .set_default("federation.actor_staleness_seconds", 86400)?
            .set_default("federation.fetch_timeout_seconds", 15)?
            .set_default("federation.deliver_timeout_seconds", 10)?
            .set_default("federation.delivery_max_attempts", 3)?
            .set_default("federation.delivery_backoff_seconds", 30)?
            .set_default("federation.relay_failure_threshold", 3)?
            .set_default("logging.level", "info")?
            .set_default("logging.format", "pretty")?
            // Load from config/default.toml if it exists
            .add_source(File::with_name("config/default").required(false))
            // Load from config/local.toml if it exists (overrides default)
            .add_source(File::with_name("config/local").required(false))
            // Load from environment variables (DRIFTWAY_*)
            .add_source(
                Environment::with_prefix("DRIFTWAY")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| crate::error::AppError::Config(e.to_string()))?;

        let app_config: Self = config
            .try_deserialize()
            .map_err(|e| crate::error::AppError::Config(e.to_string()))?;
        app_config.validate()?;
        Ok(app_config)
    }

    fn validate(&self) -> Result<(), crate::error::AppError> {
        if self.server.domain.trim().is_empty() {
            return Err(crate::error::AppError::Config(
                "server.domain must not be empty".to_string(),
            ));
        }

        if !matches!(self.server.protocol.as_str(), "http" | "https") {
            return Err(crate::error::AppError::Config(format!(
                "server.protocol must be http or https, got: {}",
                self.server.protocol
            )));
        }

        if self.accounts.len() > MAX_LOCAL_ACCOUNTS {
            return Err(crate::error::AppError::Config(format!(
                "at most {} local accounts are supported, {} configured",
                MAX_LOCAL_ACCOUNTS,
                self.accounts.len()
            )));
        }

        let mut seen = std::collections::HashSet::new();
        for account in &self.accounts {
            if account.username.trim().is_empty() {
                return Err(crate::error::AppError::Config(
                    "accounts[].username must not be empty".to_string(),
                ));
            }
            if !seen.insert(account.username.to_ascii_lowercase()) {
                return Err(crate::error::AppError::Config(format!(
                    "duplicate local account username: {}",
                    account.username
                )));
            }
        }

        if self.federation.signature_clock_skew_seconds <= 0 {
            return Err(crate::error::AppError::Config(
                "federation.signature_clock_skew_seconds must be positive".to_string(),
            ));
        }

        Ok(())
    }
}
