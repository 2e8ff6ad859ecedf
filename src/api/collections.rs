//! Custom collection endpoints
//!
//! - Per-actor collection catalog
//! - Paginated collection reads with visibility enforcement

use axum::extract::{Path, Query, State};
use axum::routing::get;
use axum::Router;
use http::HeaderMap;

use crate::collections::{
    clamp_limit, collection_url, ordered_collection, ordered_collection_page, resolve_items,
};
use crate::data::CollectionVisibility;
use crate::error::AppError;
use crate::AppState;

use super::{is_admin_request, ActivityJson, PageParams};

/// Create collections router
///
/// Routes:
/// - GET /users/:username/collections - Catalog
/// - GET /users/:username/collections/:cid - Collection page
pub fn collections_router() -> Router<AppState> {
    Router::new()
        .route("/users/:username/collections", get(catalog))
        .route("/users/:username/collections/:cid", get(collection))
}

/// GET /users/:username/collections
///
/// Catalog of the actor's custom collections. PUBLIC collections are
/// always listed; the admin bearer token additionally reveals UNLISTED
/// and PRIVATE ones.
async fn catalog(
    State(state): State<AppState>,
    Path(username): Path<String>,
    headers: HeaderMap,
) -> Result<ActivityJson, AppError> {
    state
        .db
        .get_actor_by_username(&username)
        .await?
        .ok_or(AppError::NotFound)?;

    let is_admin = is_admin_request(&state, &headers);
    let base = state.config.server.prefixed_base_url();

    let items: Vec<serde_json::Value> = state
        .db
        .list_collections(&username)
        .await?
        .into_iter()
        .filter(|definition| is_admin || definition.visibility == CollectionVisibility::Public)
        .map(|definition| {
            serde_json::json!({
                "type": "Collection",
                "id": collection_url(&base, &username, &definition.id),
                "name": definition.name,
                "broca:visibility": definition.visibility.as_str(),
            })
        })
        .collect();

    Ok(ActivityJson(serde_json::json!({
        "@context": [
            "https://www.w3.org/ns/activitystreams",
            {"broca": "https://broca-activitypub.org/ns#"}
        ],
        "type": "OrderedCollection",
        "id": format!("{base}/users/{username}/collections"),
        "totalItems": items.len(),
        "orderedItems": items,
    })))
}

/// GET /users/:username/collections/:cid
///
/// Two-tier read: without page params the collection metadata is
/// returned; with them, one OrderedCollectionPage. PRIVATE collections
/// require the admin bearer token.
async fn collection(
    State(state): State<AppState>,
    Path((username, cid)): Path<(String, String)>,
    Query(params): Query<PageParams>,
    headers: HeaderMap,
) -> Result<ActivityJson, AppError> {
    let definition = state
        .db
        .get_collection(&username, &cid)
        .await?
        .ok_or(AppError::NotFound)?;

    if definition.visibility == CollectionVisibility::Private
        && !is_admin_request(&state, &headers)
    {
        return Err(AppError::Unauthorized);
    }

    let base = state.config.server.prefixed_base_url();
    let url = collection_url(&base, &username, &cid);

    let items = resolve_items(&state.db, &definition).await?;
    let total = items.len();

    let Some(page) = params.page else {
        let mut metadata = ordered_collection(&url, total);
        metadata["name"] = serde_json::Value::String(definition.name.clone());
        if let Some(description) = &definition.description {
            metadata["summary"] = serde_json::Value::String(description.clone());
        }
        return Ok(ActivityJson(metadata));
    };

    let limit = clamp_limit(params.limit);
    let start = (page as usize).saturating_mul(limit as usize);
    let page_items: Vec<serde_json::Value> =
        items.into_iter().skip(start).take(limit as usize).collect();

    Ok(ActivityJson(ordered_collection_page(
        &url, total, page_items, page, limit,
    )))
}
