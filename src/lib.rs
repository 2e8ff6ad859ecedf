//! Broca - a federated ActivityPub server
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      API Layer (Axum)                       │
//! │  - ActivityPub endpoints (actors, inbox, outbox)            │
//! │  - Custom collection endpoints                              │
//! │  - WebFinger / Admin / Metrics                              │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    Federation Layer                         │
//! │  - Inbox/Outbox processing                                  │
//! │  - HTTP signatures + public key cache                       │
//! │  - Durable delivery queue + worker                          │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Data Layer                             │
//! │  - SQLite (sqlx): actors, streams, relations,               │
//! │    delivery queue, collections, blobs                       │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - `api`: HTTP handlers for ActivityPub and operator endpoints
//! - `federation`: signing, verification, inbox/outbox, delivery
//! - `collections`: custom collection engine
//! - `data`: database layer
//! - `storage`: blob mirroring for remote attachments
//! - `identity`: key pairs and actor provisioning
//! - `config`: configuration management
//! - `error`: error types

pub mod api;
pub mod collections;
pub mod config;
pub mod data;
pub mod error;
pub mod federation;
pub mod identity;
pub mod metrics;
pub mod storage;

use std::sync::Arc;
use std::time::Duration;

use federation::{DeliveryEngine, DeliveryWorker, InboxProcessor, OutboxProcessor, PublicKeyCache};
use identity::SystemIdentity;
use storage::MediaStore;

/// Application state shared across all handlers
///
/// This struct is cloned for each request and contains
/// shared resources like the database pool, the public key cache,
/// and the HTTP client.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration (read-only after startup)
    pub config: Arc<config::AppConfig>,

    /// Database connection pool
    pub db: Arc<data::Database>,

    /// Remote public key cache
    pub key_cache: Arc<PublicKeyCache>,

    /// HTTP client for federation
    pub http_client: Arc<reqwest::Client>,

    /// System actor signing identity, loaded once at startup
    pub system: Arc<SystemIdentity>,
}

impl AppState {
    /// Initialize application state
    ///
    /// # Steps
    /// 1. Connect to the SQLite database
    /// 2. Build the federation HTTP client
    /// 3. Provision the system actor
    /// 4. Initialize the public key cache
    ///
    /// # Errors
    /// Returns error if any initialization step fails
    pub async fn new(config: config::AppConfig) -> Result<Self, error::AppError> {
        tracing::info!("Initializing application state...");

        // 1. Connect to SQLite database
        let db = Arc::new(data::Database::connect(&config.database.path).await?);
        tracing::info!("Database connected");

        // 2. Initialize HTTP client
        let http_client = Arc::new(
            reqwest::Client::builder()
                .user_agent(format!("Broca/{}", env!("CARGO_PKG_VERSION")))
                .timeout(Duration::from_secs(config.federation.request_timeout_seconds))
                .build()
                .map_err(|e| error::AppError::Internal(e.into()))?,
        );

        // 3. Provision the system actor
        let system = Arc::new(identity::ensure_system_actor(&db, &config).await?);
        tracing::info!(actor = %system.actor_id, "System actor ready");

        // 4. Initialize public key cache
        let key_cache = Arc::new(PublicKeyCache::new(
            Arc::clone(&http_client),
            Arc::clone(&system),
            Duration::from_secs(config.federation.public_key_cache_ttl_seconds),
            Duration::from_secs(config.federation.key_fetch_timeout_seconds),
        ));

        tracing::info!("Application state initialized successfully");

        Ok(Self {
            config: Arc::new(config),
            db,
            key_cache,
            http_client,
            system,
        })
    }

    /// Blob store facade for attachment mirroring
    pub fn media_store(&self) -> MediaStore {
        MediaStore::new(
            Arc::clone(&self.db),
            Arc::clone(&self.http_client),
            self.config.server.prefixed_base_url(),
            Duration::from_secs(self.config.federation.attachment_timeout_seconds),
        )
    }

    /// Delivery engine for outbound fan-out
    pub fn delivery_engine(&self) -> DeliveryEngine {
        DeliveryEngine::new(
            Arc::clone(&self.db),
            Arc::clone(&self.http_client),
            Arc::clone(&self.system),
            self.config.server.prefixed_base_url(),
            &self.config.federation,
            &self.config.delivery,
        )
    }

    /// Inbox processor for one incoming request
    pub fn inbox_processor(&self) -> InboxProcessor {
        InboxProcessor::new(
            Arc::clone(&self.db),
            self.media_store(),
            Arc::clone(&self.config),
        )
    }

    /// Outbox processor for one publish request
    pub fn outbox_processor(&self) -> OutboxProcessor {
        let delivery = self
            .config
            .federation
            .enable_activity_delivery
            .then(|| self.delivery_engine());

        OutboxProcessor::new(Arc::clone(&self.db), Arc::clone(&self.config), delivery)
    }

    /// Background delivery worker
    pub fn delivery_worker(&self) -> DeliveryWorker {
        DeliveryWorker::new(
            Arc::clone(&self.db),
            Arc::clone(&self.http_client),
            self.config.delivery.clone(),
            &self.config.federation,
        )
    }
}
