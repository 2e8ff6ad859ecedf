//! Admin API endpoints
//!
//! Operator-facing observability for the delivery engine.
//! All routes require the admin bearer token.

use axum::extract::State;
use axum::response::Json;
use axum::routing::get;
use axum::Router;
use http::HeaderMap;

use crate::error::AppError;
use crate::AppState;

use super::is_admin_request;

/// Create admin router
///
/// Routes:
/// - GET /admin/queue - Delivery queue statistics
pub fn admin_router() -> Router<AppState> {
    Router::new().route("/admin/queue", get(queue_stats))
}

/// GET /admin/queue
///
/// Delivery queue counts per status plus public key cache state.
/// This is how operators observe DEAD items.
async fn queue_stats(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, AppError> {
    if !is_admin_request(&state, &headers) {
        return Err(AppError::Unauthorized);
    }

    let queue = state.db.delivery_queue_stats().await?;
    let key_cache = state.key_cache.stats().await;

    Ok(Json(serde_json::json!({
        "queue": queue,
        "key_cache": {
            "total_entries": key_cache.total_entries,
            "valid_entries": key_cache.valid_entries,
            "expired_entries": key_cache.expired_entries,
        },
    })))
}
