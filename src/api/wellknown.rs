//! Well-known endpoints
//!
//! - /.well-known/webfinger

use axum::extract::{Query, State};
use axum::response::Json;
use axum::routing::get;
use axum::Router;
use serde::Deserialize;

use crate::error::AppError;
use crate::AppState;

/// Create well-known router
///
/// Routes:
/// - GET /.well-known/webfinger
pub fn wellknown_router() -> Router<AppState> {
    Router::new().route("/.well-known/webfinger", get(webfinger))
}

/// WebFinger query parameters
#[derive(Debug, Deserialize)]
struct WebFingerQuery {
    resource: String,
}

/// GET /.well-known/webfinger
///
/// Responds to WebFinger queries for local actors.
///
/// Query: ?resource=acct:user@domain
async fn webfinger(
    State(state): State<AppState>,
    Query(query): Query<WebFingerQuery>,
) -> Result<Json<serde_json::Value>, AppError> {
    let resource = &query.resource;

    let acct = resource.strip_prefix("acct:").ok_or_else(|| {
        AppError::Validation("Resource must start with 'acct:'".to_string())
    })?;

    let (username, domain) = acct
        .split_once('@')
        .ok_or_else(|| AppError::Validation("Invalid acct format".to_string()))?;

    // Verify domain matches this server
    if domain != state.config.server.primary_domain {
        return Err(AppError::NotFound);
    }

    let actor = state
        .db
        .get_actor_by_username(username)
        .await?
        .ok_or(AppError::NotFound)?;

    Ok(Json(serde_json::json!({
        "subject": resource,
        "aliases": [actor.id],
        "links": [
            {
                "rel": "self",
                "type": "application/activity+json",
                "href": actor.id
            },
            {
                "rel": "http://webfinger.net/rel/profile-page",
                "type": "text/html",
                "href": actor.id
            }
        ]
    })))
}
