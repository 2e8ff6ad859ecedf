//! API layer
//!
//! HTTP handlers for:
//! - ActivityPub (federation)
//! - Custom collections
//! - Well-known endpoints (WebFinger)
//! - Admin API (queue statistics)
//! - Metrics (Prometheus)

mod activitypub;
mod admin;
mod collections;
mod wellknown;

pub use activitypub::activitypub_router;
pub use admin::admin_router;
pub use collections::collections_router;
pub use wellknown::wellknown_router;

use axum::response::{IntoResponse, Response};

use crate::identity::{admin_token_matches, bearer_token};
use crate::AppState;

/// JSON response carrying the ActivityPub media type
pub struct ActivityJson(pub serde_json::Value);

impl IntoResponse for ActivityJson {
    fn into_response(self) -> Response {
        (
            [(
                axum::http::header::CONTENT_TYPE,
                "application/activity+json",
            )],
            axum::Json(self.0),
        )
            .into_response()
    }
}

/// Whether a request presents the admin bearer token.
///
/// The comparison is constant-time; a missing configured token
/// disables the administrative path entirely.
pub fn is_admin_request(state: &AppState, headers: &http::HeaderMap) -> bool {
    admin_token_matches(state.config.admin.api_token.as_deref(), bearer_token(headers))
}

/// Page query parameters shared by all paginated endpoints
#[derive(Debug, Clone, Copy, Default, serde::Deserialize)]
pub struct PageParams {
    pub page: Option<u32>,
    pub limit: Option<u32>,
}

/// Create metrics router
///
/// Serves the `broca_*` instrument registry from [`crate::metrics`]
/// in Prometheus text exposition format. Stateless, mounted outside
/// the ActivityPub route prefix.
pub fn metrics_router() -> axum::Router {
    axum::Router::new().route("/metrics", axum::routing::get(serve_metrics))
}

async fn serve_metrics() -> Response {
    use prometheus::Encoder;

    let encoder = prometheus::TextEncoder::new();
    let mut body = String::new();

    if let Err(error) = encoder.encode_utf8(&crate::metrics::REGISTRY.gather(), &mut body) {
        tracing::error!(%error, "Failed to encode metric registry");
        return (
            axum::http::StatusCode::INTERNAL_SERVER_ERROR,
            "metric encoding failed",
        )
            .into_response();
    }

    (
        [(
            axum::http::header::CONTENT_TYPE,
            encoder.format_type().to_string(),
        )],
        body,
    )
        .into_response()
}
