//! Broca binary entry point

use broca::{config, AppState};
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Application entry point
///
/// # Setup
/// 1. Initialize tracing/logging
/// 2. Load configuration from file and environment
/// 3. Initialize AppState (database, system actor, key cache)
/// 4. Build Axum router
/// 5. Start the delivery worker
/// 6. Serve until shutdown, then drain the worker
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 1. Initialize tracing/logging
    let log_format =
        std::env::var("BROCA__LOGGING__FORMAT").unwrap_or_else(|_| "pretty".to_string());

    if log_format == "json" {
        tracing_subscriber::registry()
            .with(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "broca=info,tower_http=debug".into()),
            )
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "broca=info,tower_http=debug".into()),
            )
            .with(tracing_subscriber::fmt::layer().pretty())
            .init();
    }

    tracing::info!("Starting Broca...");

    // 2. Initialize metrics
    broca::metrics::init_metrics();

    // 3. Load configuration
    let config = config::AppConfig::load()?;
    tracing::info!(
        domain = %config.server.primary_domain,
        protocol = %config.server.protocol,
        "Configuration loaded"
    );

    // 4. Initialize application state
    let state = AppState::new(config.clone()).await?;

    // 5. Build Axum router
    let app = build_router(state.clone());

    // 6. Start HTTP server
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!("Server listening on {}", addr);
    tracing::info!("Public URL: {}", config.server.base_url());

    // 7. Start the delivery worker
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let worker_handle = if config.federation.enable_activity_delivery {
        Some(state.delivery_worker().spawn(shutdown_rx))
    } else {
        tracing::info!("Activity delivery is disabled");
        None
    };

    // Serve until interrupted; in-flight requests drain first
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutdown signal received");
        })
        .await?;

    // Stop claiming new deliveries and let in-flight ones finish
    let _ = shutdown_tx.send(true);
    if let Some(handle) = worker_handle {
        let _ = handle.await;
    }

    tracing::info!("Shutdown complete");
    Ok(())
}

/// Build the Axum router with all routes
fn build_router(state: AppState) -> axum::Router {
    use axum::Router;
    use tower_http::{compression::CompressionLayer, cors::CorsLayer, trace::TraceLayer};

    let federated = broca::api::activitypub_router().merge(broca::api::collections_router());

    // ActivityPub routes live under the configured route prefix
    let prefix = state.config.server.route_prefix.clone();
    let mounted = if prefix.is_empty() {
        Router::new().merge(federated)
    } else {
        Router::new().nest(&prefix, federated)
    };

    Router::new()
        // Health check endpoint
        .route("/health", axum::routing::get(health_check))
        // Well-known endpoints
        .merge(broca::api::wellknown_router())
        // ActivityPub + collections
        .merge(mounted)
        // Admin API
        .merge(broca::api::admin_router())
        // Middleware
        .layer(CompressionLayer::new())
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        // State
        .with_state(state)
        // Metrics endpoint (Prometheus format) - stateless, added after state
        .merge(broca::api::metrics_router())
}

/// Health check endpoint
async fn health_check() -> &'static str {
    "OK"
}
