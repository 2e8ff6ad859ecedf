//! Common test utilities for E2E tests

use broca::config::{
    AdminConfig, AppConfig, DatabaseConfig, DeliveryConfig, FederationConfig, LoggingConfig,
    ServerConfig,
};
use broca::data::{Actor, ActorKind};
use broca::{identity, AppState};
use tempfile::TempDir;
use tokio::net::TcpListener;

/// Bearer token accepted by test servers
pub const ADMIN_TOKEN: &str = "test-admin-token";

/// Test server instance
pub struct TestServer {
    pub addr: String,
    pub state: AppState,
    pub _temp_dir: TempDir,
    pub client: reqwest::Client,
}

impl TestServer {
    /// Create a new test server with default configuration
    pub async fn new() -> Self {
        Self::with_config(|_| {}).await
    }

    /// Create a new test server, customizing the configuration first
    pub async fn with_config(customize: impl FnOnce(&mut AppConfig)) -> Self {
        // Create temporary directory for the test database
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("test.db");

        let mut config = AppConfig {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 0, // Let OS assign port
                primary_domain: "test.example.com".to_string(),
                protocol: "https".to_string(),
                server_name: "Broca Test".to_string(),
                route_prefix: String::new(),
            },
            database: DatabaseConfig { path: db_path },
            federation: FederationConfig {
                system_actor_username: "sys".to_string(),
                // Most tests exercise the HTTP surface without a worker
                enable_activity_delivery: false,
                require_http_signatures: true,
                public_key_cache_ttl_seconds: 3600,
                key_fetch_timeout_seconds: 2,
                request_timeout_seconds: 5,
                attachment_timeout_seconds: 2,
            },
            delivery: DeliveryConfig {
                processing_interval_seconds: 1,
                batch_size: 100,
                concurrency: 10,
                max_attempts: 5,
                retention_days: 7,
                cleanup_interval_seconds: 3600,
                lease_seconds: 600,
            },
            admin: AdminConfig {
                enable_admin_operations: true,
                api_token: Some(ADMIN_TOKEN.to_string()),
                authorized_actors: Vec::new(),
            },
            logging: LoggingConfig {
                level: "info".to_string(),
                format: "pretty".to_string(),
            },
        };
        customize(&mut config);

        // Initialize app state
        let state = AppState::new(config).await.unwrap();

        // Create HTTP client
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .unwrap();

        // Bind to random port
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let addr_str = format!("http://{}", addr);

        // Build router
        let app = build_test_router(state.clone());

        // Spawn server in background
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        // Wait a bit for server to start
        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;

        Self {
            addr: addr_str,
            state,
            _temp_dir: temp_dir,
            client,
        }
    }

    /// Get base URL for API requests
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.addr, path)
    }

    /// Create a local actor with a real key pair
    pub async fn create_actor(&self, username: &str) -> Actor {
        let actor = identity::build_local_actor(
            &self.state.config,
            username,
            ActorKind::Person,
            Some(format!("{username} display")),
            Some("Test actor".to_string()),
            serde_json::Map::new(),
        )
        .unwrap();

        self.state.db.insert_actor(&actor).await.unwrap();
        actor
    }

    /// POST an activity to a local inbox, signed with the sender's key.
    ///
    /// The sender's public key is seeded into the key cache so
    /// verification does not go to the network.
    pub async fn signed_inbox_post(
        &self,
        sender: &Actor,
        recipient_username: &str,
        activity: &serde_json::Value,
    ) -> reqwest::Response {
        let body = serde_json::to_vec(activity).unwrap();
        self.signed_inbox_post_raw(sender, recipient_username, &body, &body)
            .await
    }

    /// Sign `signed_body` but transmit `sent_body` (digest-mismatch
    /// tests pass different values).
    pub async fn signed_inbox_post_raw(
        &self,
        sender: &Actor,
        recipient_username: &str,
        signed_body: &[u8],
        sent_body: &[u8],
    ) -> reqwest::Response {
        self.state
            .key_cache
            .put(&sender.key_id(), sender.public_key_pem.clone())
            .await;

        let inbox_url = self.url(&format!("/users/{recipient_username}/inbox"));
        let sig = broca::federation::sign_request(
            "POST",
            &inbox_url,
            Some(signed_body),
            sender.private_key_pem.as_deref().unwrap(),
            &sender.key_id(),
        )
        .unwrap();

        let mut request = self
            .client
            .post(&inbox_url)
            .header("Content-Type", "application/activity+json")
            .header("Date", sig.date)
            .header("Signature", sig.signature);
        if let Some(digest) = sig.digest {
            request = request.header("Digest", digest);
        }

        request.body(sent_body.to_vec()).send().await.unwrap()
    }

    /// POST an activity to a local outbox with the admin bearer token
    pub async fn outbox_post(
        &self,
        username: &str,
        activity: &serde_json::Value,
    ) -> reqwest::Response {
        self.client
            .post(self.url(&format!("/users/{username}/outbox")))
            .header("Content-Type", "application/activity+json")
            .bearer_auth(ADMIN_TOKEN)
            .json(activity)
            .send()
            .await
            .unwrap()
    }

    /// POST an admin activity to the system inbox with the bearer token
    pub async fn admin_inbox_post(&self, activity: &serde_json::Value) -> reqwest::Response {
        self.client
            .post(self.url("/users/sys/inbox"))
            .header("Content-Type", "application/activity+json")
            .bearer_auth(ADMIN_TOKEN)
            .json(activity)
            .send()
            .await
            .unwrap()
    }
}

/// Build router for testing (mirrors the binary's router)
fn build_test_router(state: AppState) -> axum::Router {
    use axum::Router;
    use tower_http::{compression::CompressionLayer, cors::CorsLayer, trace::TraceLayer};

    Router::new()
        .route("/health", axum::routing::get(health_check))
        .merge(broca::api::wellknown_router())
        .merge(broca::api::activitypub_router())
        .merge(broca::api::collections_router())
        .merge(broca::api::admin_router())
        .layer(CompressionLayer::new())
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health_check() -> &'static str {
    "OK"
}
