//! Configuration management
//!
//! Loads configuration from:
//! 1. Default values
//! 2. Configuration file (config/local.toml)
//! 3. Environment variables (override)

use serde::Deserialize;
use std::path::PathBuf;

/// Main application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub federation: FederationConfig,
    pub delivery: DeliveryConfig,
    pub admin: AdminConfig,
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
    pub primary_domain: String,
    /// Protocol ("http" or "https")
    pub protocol: String,
    /// Human-readable instance name
    pub server_name: String,
    /// Path prefix all ActivityPub routes are mounted under ("" for root)
    #[serde(default)]
    pub route_prefix: String,
}

impl ServerConfig {
    /// Get the base URL for the instance
    ///
    /// # Returns
    /// Full URL like "https://social.example.com"
    pub fn base_url(&self) -> String {
        format!("{}://{}", self.protocol, self.primary_domain)
    }

    /// Base URL joined with the route prefix.
    ///
    /// All persistent identifiers (actor ids, activity ids, object ids)
    /// are rooted here.
    pub fn prefixed_base_url(&self) -> String {
        format!("{}{}", self.base_url(), self.route_prefix)
    }
}

/// Database configuration (SQLite only)
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Path to SQLite database file
    pub path: PathBuf,
}

/// Federation configuration
#[derive(Debug, Clone, Deserialize)]
pub struct FederationConfig {
    /// Username of the server's own actor, used to sign
    /// server-originated requests (default: "sys")
    #[serde(default = "default_system_actor_username")]
    pub system_actor_username: String,
    /// Whether the delivery worker runs (default: true)
    #[serde(default = "default_true")]
    pub enable_activity_delivery: bool,
    /// Whether inbound activities must carry a valid HTTP signature
    /// (default: true)
    #[serde(default = "default_true")]
    pub require_http_signatures: bool,
    /// TTL for cached remote public keys, in seconds (default: 3600)
    #[serde(default = "default_public_key_cache_ttl")]
    pub public_key_cache_ttl_seconds: u64,
    /// Sub-deadline for public key fetches, in seconds (default: 10)
    #[serde(default = "default_key_fetch_timeout")]
    pub key_fetch_timeout_seconds: u64,
    /// Overall deadline for outbound federation requests, in seconds
    /// (default: 30)
    #[serde(default = "default_request_timeout")]
    pub request_timeout_seconds: u64,
    /// Per-attachment deadline for inbox media mirroring, in seconds
    /// (default: 10)
    #[serde(default = "default_key_fetch_timeout")]
    pub attachment_timeout_seconds: u64,
}

fn default_system_actor_username() -> String {
    "sys".to_string()
}

fn default_true() -> bool {
    true
}

fn default_public_key_cache_ttl() -> u64 {
    3600
}

fn default_key_fetch_timeout() -> u64 {
    10
}

fn default_request_timeout() -> u64 {
    30
}

/// Delivery worker configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DeliveryConfig {
    /// Seconds between worker ticks (default: 5)
    #[serde(default = "default_processing_interval")]
    pub processing_interval_seconds: u64,
    /// Max queue items claimed per tick (default: 100)
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,
    /// Max in-flight deliveries within a tick (default: 10)
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Attempts before an item goes DEAD (default: 5)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Days DELIVERED/DEAD items are kept before purge (default: 7)
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
    /// Seconds between retention purges (default: 3600)
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_seconds: u64,
    /// Seconds a PROCESSING lease is honored before the item reverts
    /// to PENDING (default: 600)
    #[serde(default = "default_lease_seconds")]
    pub lease_seconds: u64,
}

fn default_processing_interval() -> u64 {
    5
}

fn default_batch_size() -> u32 {
    100
}

fn default_concurrency() -> usize {
    10
}

fn default_max_attempts() -> u32 {
    5
}

fn default_retention_days() -> u32 {
    7
}

fn default_cleanup_interval() -> u64 {
    3600
}

fn default_lease_seconds() -> u64 {
    600
}

/// Admin operations configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AdminConfig {
    /// Whether admin operations through the system inbox are enabled
    /// (default: false)
    #[serde(default)]
    pub enable_admin_operations: bool,
    /// Bearer token accepted for administrative requests
    pub api_token: Option<String>,
    /// Remote actor ids whose signed requests may perform admin
    /// operations
    #[serde(default)]
    pub authorized_actors: Vec<String>,
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
    /// 4. Environment variables (BROCA_*)
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
            .set_default("server.server_name", "Broca")?
            .set_default("server.route_prefix", "")?
            .set_default("federation.system_actor_username", "sys")?
            .set_default("federation.enable_activity_delivery", true)?
            .set_default("federation.require_http_signatures", true)?
            .set_default("federation.public_key_cache_ttl_seconds", 3600)?
            .set_default("federation.key_fetch_timeout_seconds", 10)?
            .set_default("federation.request_timeout_seconds", 30)?
            .set_default("federation.attachment_timeout_seconds", 10)?
            .set_default("delivery.processing_interval_seconds", 5)?
            .set_default("delivery.batch_size", 100)?
            .set_default("delivery.concurrency", 10)?
            .set_default("delivery.max_attempts", 5)?
            .set_default("delivery.retention_days", 7)?
            .set_default("delivery.cleanup_interval_seconds", 3600)?
            .set_default("delivery.lease_seconds", 600)?
            .set_default("admin.enable_admin_operations", false)?
            .set_default("logging.level", "info")?
            .set_default("logging.format", "pretty")?
            // Load from config/default.toml if it exists
            .add_source(File::with_name("config/default").required(false))
            // Load from config/local.toml if it exists (overrides default)
            .add_source(File::with_name("config/local").required(false))
            // Load from environment variables (BROCA_*)
            .add_source(
                Environment::with_prefix("BROCA")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| crate::error::AppError::Config(e.to_string()))?;

        config
            .try_deserialize()
            .map_err(|e| crate::error::AppError::Config(e.to_string()))
    }
}
