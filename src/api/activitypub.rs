//! ActivityPub endpoints
//!
//! - Actor profile
//! - Inbox (activity receiving)
//! - Outbox (activity publishing)
//! - Relation collections (followers/following/liked/shared)
//! - Objects and their relation collections
//! - Media blobs

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use http::HeaderMap;

use crate::collections::{clamp_limit, ordered_collection, ordered_collection_page};
use crate::data::{Actor, CollectionVisibility, StreamKind};
use crate::error::AppError;
use crate::federation;
use crate::metrics::SIGNATURE_VERIFICATIONS_TOTAL;
use crate::AppState;

use super::{is_admin_request, ActivityJson, PageParams};

/// Create ActivityPub router
///
/// Routes:
/// - GET  /users/:username - Actor profile
/// - POST /users/:username/inbox - Receive activity
/// - GET  /users/:username/inbox - List inbox (auth-gated)
/// - POST /users/:username/outbox - Publish activity
/// - GET  /users/:username/outbox - List outbox
/// - GET  /users/:username/{followers,following,liked,shared}
/// - GET  /users/:username/objects/:oid[/{replies,likes,shares}]
/// - GET  /users/:username/media/:blob_id
pub fn activitypub_router() -> Router<AppState> {
    Router::new()
        .route("/users/:username", get(actor))
        .route("/users/:username/inbox", post(inbox_post).get(inbox_get))
        .route("/users/:username/outbox", post(outbox_post).get(outbox_get))
        .route("/users/:username/followers", get(followers))
        .route("/users/:username/following", get(following))
        .route("/users/:username/liked", get(liked))
        .route("/users/:username/shared", get(shared))
        .route("/users/:username/objects/:oid", get(object))
        .route("/users/:username/objects/:oid/replies", get(object_replies))
        .route("/users/:username/objects/:oid/likes", get(object_likes))
        .route("/users/:username/objects/:oid/shares", get(object_shares))
        .route("/users/:username/media/:blob_id", get(media_blob))
}

async fn load_actor(state: &AppState, username: &str) -> Result<Actor, AppError> {
    state
        .db
        .get_actor_by_username(username)
        .await?
        .ok_or(AppError::NotFound)
}

/// Build the wire-form actor document.
///
/// PUBLIC custom collections are advertised under `broca:collections`;
/// the private key is emitted only under the admin bearer token.
async fn actor_document(
    state: &AppState,
    actor: &Actor,
    include_private_key: bool,
) -> Result<serde_json::Value, AppError> {
    let mut document = serde_json::json!({
        "@context": [
            "https://www.w3.org/ns/activitystreams",
            "https://w3id.org/security/v1",
            {"broca": "https://broca-activitypub.org/ns#"}
        ],
        "type": actor.kind.as_str(),
        "id": actor.id,
        "preferredUsername": actor.username,
        "name": actor.display_name.clone().unwrap_or_else(|| actor.username.clone()),
        "summary": actor.summary.clone().unwrap_or_default(),
        "inbox": actor.inbox,
        "outbox": actor.outbox,
        "followers": actor.followers_url,
        "following": actor.following_url,
        "url": actor.id,
        "publicKey": {
            "id": actor.key_id(),
            "owner": actor.id,
            "publicKeyPem": actor.public_key_pem,
        }
    });

    if let Some(shared_inbox) = &actor.shared_inbox {
        document["endpoints"] = serde_json::json!({ "sharedInbox": shared_inbox });
    }

    // Extension bag rides along verbatim, without clobbering the core
    for (key, value) in &actor.extensions {
        if document.get(key).is_none() {
            document[key.as_str()] = value.clone();
        }
    }

    // Advertise PUBLIC collections
    let mut advertised = serde_json::Map::new();
    for definition in state.db.list_collections(&actor.username).await? {
        if definition.visibility == CollectionVisibility::Public {
            advertised.insert(
                definition.id.clone(),
                serde_json::Value::String(crate::collections::collection_url(
                    &state.config.server.prefixed_base_url(),
                    &actor.username,
                    &definition.id,
                )),
            );
        }
    }
    if !advertised.is_empty() {
        document["broca:collections"] = serde_json::Value::Object(advertised);
    }

    // The system actor advertises the admin capability when enabled
    if state.config.admin.enable_admin_operations
        && actor.username == state.config.federation.system_actor_username
    {
        document["broca:adminOperations"] = serde_json::json!({
            "enabled": true,
            "authMethods": ["bearer"],
        });
    }

    if include_private_key {
        if let Some(private_key_pem) = &actor.private_key_pem {
            document["privateKeyPem"] = serde_json::Value::String(private_key_pem.clone());
        }
    }

    Ok(document)
}

/// GET /users/:username
///
/// Returns the ActivityPub actor document.
async fn actor(
    State(state): State<AppState>,
    Path(username): Path<String>,
    headers: HeaderMap,
) -> Result<ActivityJson, AppError> {
    let actor = load_actor(&state, &username).await?;
    let include_private_key = is_admin_request(&state, &headers);
    let document = actor_document(&state, &actor, include_private_key).await?;
    Ok(ActivityJson(document))
}

/// POST /users/:username/inbox
///
/// Receives an incoming activity.
///
/// # Authentication
/// 1. System inbox + valid admin bearer token: accepted as
///    administrative, signature verification skipped.
/// 2. Otherwise HTTP signature verification is mandatory while
///    `require_http_signatures` is on.
async fn inbox_post(
    State(state): State<AppState>,
    Path(username): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, AppError> {
    let _actor = load_actor(&state, &username).await?;

    let is_system_inbox = username == state.config.federation.system_actor_username;
    let admin_bearer = is_admin_request(&state, &headers);

    let mut admin_authorized = is_system_inbox && admin_bearer;

    if !admin_authorized && state.config.federation.require_http_signatures {
        // Reject unsigned requests before touching the body
        let key_id = federation::extract_signature_key_id(&headers)?;

        // The signature's keyId must belong to the claimed actor;
        // the admin path bypasses this actor-id validation
        let claimed_actor = serde_json::from_slice::<serde_json::Value>(&body)
            .ok()
            .and_then(|activity| {
                activity
                    .get("actor")
                    .and_then(|a| a.as_str())
                    .map(str::to_string)
            })
            .ok_or_else(|| AppError::Validation("Missing actor field".to_string()))?;

        if !federation::key_id_matches_actor(&key_id, &claimed_actor) {
            SIGNATURE_VERIFICATIONS_TOTAL
                .with_label_values(&["rejected"])
                .inc();
            return Err(AppError::InvalidSignature(
                "Signature keyId does not match actor".to_string(),
            ));
        }

        let public_key_pem = state.key_cache.get(&key_id).await?;
        let path = format!(
            "{}/users/{}/inbox",
            state.config.server.route_prefix, username
        );

        if let Err(error) =
            federation::verify_signature("POST", &path, &headers, Some(&body), &public_key_pem)
        {
            SIGNATURE_VERIFICATIONS_TOTAL
                .with_label_values(&["rejected"])
                .inc();
            return Err(error);
        }
        SIGNATURE_VERIFICATIONS_TOTAL
            .with_label_values(&["verified"])
            .inc();

        // Signed requests from explicitly authorized actors may also
        // perform admin operations, with the same scope as the bearer
        // path: the system inbox only
        if is_system_inbox
            && state
                .config
                .admin
                .authorized_actors
                .iter()
                .any(|authorized| authorized == &claimed_actor)
        {
            admin_authorized = true;
        }
    }

    let activity: serde_json::Value = serde_json::from_slice(&body)
        .map_err(|e| AppError::Validation(format!("Invalid JSON: {}", e)))?;

    state
        .inbox_processor()
        .process(&username, activity, admin_authorized)
        .await?;

    Ok(StatusCode::ACCEPTED)
}

/// GET /users/:username/inbox
///
/// Lists the inbox stream. Gated behind the admin bearer token when
/// one is configured.
async fn inbox_get(
    State(state): State<AppState>,
    Path(username): Path<String>,
    Query(params): Query<PageParams>,
    headers: HeaderMap,
) -> Result<ActivityJson, AppError> {
    let actor = load_actor(&state, &username).await?;

    if state.config.admin.api_token.is_some() && !is_admin_request(&state, &headers) {
        return Err(AppError::Unauthorized);
    }

    stream_collection(&state, &actor, StreamKind::Inbox, &actor.inbox, params).await
}

/// POST /users/:username/outbox
///
/// Publishes an activity from a local actor. Returns 201 with the
/// activity id in the Location header once persisted; delivery is
/// asynchronous.
async fn outbox_post(
    State(state): State<AppState>,
    Path(username): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, AppError> {
    let actor = load_actor(&state, &username).await?;

    // Publishing is an authenticated client operation when a token is
    // configured; deployments without one front the outbox themselves
    if state.config.admin.api_token.is_some() && !is_admin_request(&state, &headers) {
        return Err(AppError::Unauthorized);
    }

    let activity: serde_json::Value = serde_json::from_slice(&body)
        .map_err(|e| AppError::Validation(format!("Invalid JSON: {}", e)))?;

    let activity_id = state.outbox_processor().publish(&actor, activity).await?;

    Ok((
        StatusCode::CREATED,
        [(axum::http::header::LOCATION, activity_id)],
    )
        .into_response())
}

/// GET /users/:username/outbox
async fn outbox_get(
    State(state): State<AppState>,
    Path(username): Path<String>,
    Query(params): Query<PageParams>,
) -> Result<ActivityJson, AppError> {
    let actor = load_actor(&state, &username).await?;
    stream_collection(&state, &actor, StreamKind::Outbox, &actor.outbox, params).await
}

/// Two-tier paginated view over a stream
async fn stream_collection(
    state: &AppState,
    actor: &Actor,
    stream: StreamKind,
    collection_id: &str,
    params: PageParams,
) -> Result<ActivityJson, AppError> {
    let total = state.db.count_stream(&actor.username, stream).await? as usize;

    let Some(page) = params.page else {
        return Ok(ActivityJson(ordered_collection(collection_id, total)));
    };

    let limit = clamp_limit(params.limit);
    let records = state
        .db
        .get_stream_page(&actor.username, stream, limit, page.saturating_mul(limit))
        .await?;
    let items = records.into_iter().map(|record| record.payload).collect();

    Ok(ActivityJson(ordered_collection_page(
        collection_id,
        total,
        items,
        page,
        limit,
    )))
}

/// Two-tier paginated view over an in-memory id list
fn id_collection(
    collection_id: &str,
    ids: Vec<String>,
    params: PageParams,
) -> ActivityJson {
    let total = ids.len();

    let Some(page) = params.page else {
        return ActivityJson(ordered_collection(collection_id, total));
    };

    let limit = clamp_limit(params.limit);
    let start = (page as usize).saturating_mul(limit as usize);
    let items = ids
        .into_iter()
        .skip(start)
        .take(limit as usize)
        .map(serde_json::Value::String)
        .collect();

    ActivityJson(ordered_collection_page(collection_id, total, items, page, limit))
}

/// GET /users/:username/followers
async fn followers(
    State(state): State<AppState>,
    Path(username): Path<String>,
    Query(params): Query<PageParams>,
) -> Result<ActivityJson, AppError> {
    let actor = load_actor(&state, &username).await?;
    let ids = state.db.get_followers(&username).await?;
    Ok(id_collection(&actor.followers_url, ids, params))
}

/// GET /users/:username/following
async fn following(
    State(state): State<AppState>,
    Path(username): Path<String>,
    Query(params): Query<PageParams>,
) -> Result<ActivityJson, AppError> {
    let actor = load_actor(&state, &username).await?;
    let ids = state.db.get_following(&username).await?;
    Ok(id_collection(&actor.following_url, ids, params))
}

/// GET /users/:username/liked
///
/// Objects this actor has published Like activities for.
async fn liked(
    State(state): State<AppState>,
    Path(username): Path<String>,
    Query(params): Query<PageParams>,
) -> Result<ActivityJson, AppError> {
    let actor = load_actor(&state, &username).await?;
    let ids = outbox_object_ids(&state, &username, "Like").await?;
    Ok(id_collection(&format!("{}/liked", actor.id), ids, params))
}

/// GET /users/:username/shared
///
/// Objects this actor has announced.
async fn shared(
    State(state): State<AppState>,
    Path(username): Path<String>,
    Query(params): Query<PageParams>,
) -> Result<ActivityJson, AppError> {
    let actor = load_actor(&state, &username).await?;
    let ids = outbox_object_ids(&state, &username, "Announce").await?;
    Ok(id_collection(&format!("{}/shared", actor.id), ids, params))
}

async fn outbox_object_ids(
    state: &AppState,
    username: &str,
    activity_type: &str,
) -> Result<Vec<String>, AppError> {
    let records = state
        .db
        .get_outbox_by_type(username, activity_type, 10_000, 0)
        .await?;
    Ok(records
        .into_iter()
        .filter_map(|record| record.object_id)
        .collect())
}

fn object_uri(state: &AppState, username: &str, oid: &str) -> String {
    format!(
        "{}/users/{}/objects/{}",
        state.config.server.prefixed_base_url(),
        username,
        oid
    )
}

/// GET /users/:username/objects/:oid
///
/// Returns the object by id, unwrapped from its Create envelope.
async fn object(
    State(state): State<AppState>,
    Path((username, oid)): Path<(String, String)>,
) -> Result<ActivityJson, AppError> {
    load_actor(&state, &username).await?;
    let uri = object_uri(&state, &username, &oid);

    let record = state
        .db
        .find_outbox_activity_for_object(&username, &uri)
        .await?
        .ok_or(AppError::NotFound)?;

    Ok(ActivityJson(crate::collections::unwrap_create(
        &record.payload,
    )))
}

/// GET /users/:username/objects/:oid/replies
async fn object_replies(
    State(state): State<AppState>,
    Path((username, oid)): Path<(String, String)>,
) -> Result<ActivityJson, AppError> {
    load_actor(&state, &username).await?;
    let uri = object_uri(&state, &username, &oid);

    let items: Vec<serde_json::Value> = state
        .db
        .find_replies(&uri)
        .await?
        .into_iter()
        .map(|record| crate::collections::unwrap_create(&record.payload))
        .collect();

    Ok(ActivityJson(inline_collection(
        &format!("{uri}/replies"),
        items,
    )))
}

/// GET /users/:username/objects/:oid/likes
async fn object_likes(
    State(state): State<AppState>,
    Path((username, oid)): Path<(String, String)>,
) -> Result<ActivityJson, AppError> {
    object_relation(&state, &username, &oid, "Like", "likes").await
}

/// GET /users/:username/objects/:oid/shares
async fn object_shares(
    State(state): State<AppState>,
    Path((username, oid)): Path<(String, String)>,
) -> Result<ActivityJson, AppError> {
    object_relation(&state, &username, &oid, "Announce", "shares").await
}

async fn object_relation(
    state: &AppState,
    username: &str,
    oid: &str,
    activity_type: &str,
    suffix: &str,
) -> Result<ActivityJson, AppError> {
    load_actor(state, username).await?;
    let uri = object_uri(state, username, oid);

    let items: Vec<serde_json::Value> = state
        .db
        .find_activities_for_object(activity_type, &uri)
        .await?
        .into_iter()
        .map(|record| record.payload)
        .collect();

    Ok(ActivityJson(inline_collection(
        &format!("{uri}/{suffix}"),
        items,
    )))
}

fn inline_collection(id: &str, items: Vec<serde_json::Value>) -> serde_json::Value {
    serde_json::json!({
        "@context": "https://www.w3.org/ns/activitystreams",
        "type": "OrderedCollection",
        "id": id,
        "totalItems": items.len(),
        "orderedItems": items,
    })
}

/// GET /users/:username/media/:blob_id
///
/// Serves a mirrored media blob.
async fn media_blob(
    State(state): State<AppState>,
    Path((username, blob_id)): Path<(String, String)>,
) -> Result<Response, AppError> {
    let blob = state
        .db
        .get_blob(&username, &blob_id)
        .await?
        .ok_or(AppError::NotFound)?;

    Ok((
        [(axum::http::header::CONTENT_TYPE, blob.content_type)],
        blob.data,
    )
        .into_response())
}
