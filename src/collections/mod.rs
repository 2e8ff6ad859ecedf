//! Custom collection engine
//!
//! Per-actor user-defined collections advertised alongside the
//! standard ActivityPub collections. MANUAL collections carry an
//! ordered member list; QUERY collections evaluate a declarative
//! filter over the owner's outbox at read time.

mod query;

pub use query::{evaluate_query, matches_filter, unwrap_create};

use chrono::Utc;

use crate::data::{
    CollectionDefinition, CollectionSortOrder, CollectionType, CollectionVisibility, Database,
    QueryFilter,
};
use crate::error::AppError;

/// Collection ids that collide with standard actor endpoints
pub const RESERVED_IDS: [&str; 8] = [
    "inbox",
    "outbox",
    "followers",
    "following",
    "liked",
    "shares",
    "collections",
    "endpoints",
];

/// Default page size when none is requested
pub const DEFAULT_PAGE_LIMIT: u32 = 20;
/// Server-side cap on the requested page size
pub const MAX_PAGE_LIMIT: u32 = 100;

/// Validate a collection id (slug).
///
/// Ids are 1-64 characters of `[a-z0-9_-]`, starting with an
/// alphanumeric, and must not collide with the reserved endpoint names.
pub fn validate_collection_id(id: &str) -> Result<(), AppError> {
    let mut chars = id.chars();

    let valid = match chars.next() {
        Some(first) if first.is_ascii_lowercase() || first.is_ascii_digit() => {
            id.len() <= 64
                && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-')
        }
        _ => false,
    };

    if !valid {
        return Err(AppError::Unprocessable(format!(
            "invalid collection id: {id:?}"
        )));
    }

    if RESERVED_IDS.contains(&id) {
        return Err(AppError::Unprocessable(format!(
            "collection id {id:?} is reserved"
        )));
    }

    Ok(())
}

/// Validate a full collection definition.
///
/// MANUAL collections may not carry a filter; QUERY collections must.
pub fn validate_definition(definition: &CollectionDefinition) -> Result<(), AppError> {
    validate_collection_id(&definition.id)?;

    if definition.name.trim().is_empty() {
        return Err(AppError::Unprocessable(
            "collection name must not be empty".to_string(),
        ));
    }

    match definition.collection_type {
        CollectionType::Manual => {
            if definition.query_filter.is_some() {
                return Err(AppError::Unprocessable(
                    "MANUAL collections may not carry a query filter".to_string(),
                ));
            }
        }
        CollectionType::Query => {
            if definition.query_filter.is_none() {
                return Err(AppError::Unprocessable(
                    "QUERY collections must carry a query filter".to_string(),
                ));
            }
        }
    }

    Ok(())
}

/// Parse a `broca:collectionDefinition` wire value into a definition
/// owned by the given actor.
///
/// # Returns
/// The definition plus any initial MANUAL member ids.
pub fn definition_from_wire(
    username: &str,
    value: &serde_json::Value,
) -> Result<(CollectionDefinition, Vec<String>), AppError> {
    let id = value
        .get("id")
        .and_then(|v| v.as_str())
        .ok_or_else(|| AppError::Unprocessable("collection definition missing id".to_string()))?
        .to_string();

    let name = value
        .get("name")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();

    let collection_type = value
        .get("type")
        .and_then(|v| v.as_str())
        .and_then(CollectionType::parse)
        .ok_or_else(|| {
            AppError::Unprocessable("collection type must be MANUAL or QUERY".to_string())
        })?;

    let visibility = match value.get("visibility").and_then(|v| v.as_str()) {
        Some(s) => CollectionVisibility::parse(s).ok_or_else(|| {
            AppError::Unprocessable(format!("unknown collection visibility: {s}"))
        })?,
        None => CollectionVisibility::Unlisted,
    };

    let sort_order = match value.get("sortOrder").and_then(|v| v.as_str()) {
        Some(s) => CollectionSortOrder::parse(s)
            .ok_or_else(|| AppError::Unprocessable(format!("unknown sort order: {s}")))?,
        None => CollectionSortOrder::ReverseChrono,
    };

    let max_items = value
        .get("maxItems")
        .and_then(|v| v.as_u64())
        .map(|n| n as u32);

    let query_filter: Option<QueryFilter> = match value.get("queryFilter") {
        Some(raw) if !raw.is_null() => Some(
            serde_json::from_value(raw.clone())
                .map_err(|e| AppError::Unprocessable(format!("invalid query filter: {e}")))?,
        ),
        _ => None,
    };

    let items: Vec<String> = value
        .get("items")
        .and_then(|v| v.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default();

    if collection_type == CollectionType::Query && !items.is_empty() {
        return Err(AppError::Unprocessable(
            "QUERY collections may not carry items".to_string(),
        ));
    }

    let now = Utc::now();
    let definition = CollectionDefinition {
        id,
        username: username.to_string(),
        name,
        description: value
            .get("description")
            .and_then(|v| v.as_str())
            .map(str::to_string),
        collection_type,
        visibility,
        sort_order,
        max_items,
        query_filter,
        created_at: now,
        updated_at: now,
    };

    validate_definition(&definition)?;

    Ok((definition, items))
}

/// URL a collection is served under
pub fn collection_url(prefixed_base_url: &str, username: &str, collection_id: &str) -> String {
    format!("{prefixed_base_url}/users/{username}/collections/{collection_id}")
}

/// Parse a collection target URL of the form
/// `{base}/users/{username}/collections/{id}`.
///
/// # Returns
/// `(username, collection_id)` when the URL is in this server's
/// collection space.
pub fn parse_collection_url(
    prefixed_base_url: &str,
    url: &str,
) -> Option<(String, String)> {
    let rest = url.strip_prefix(prefixed_base_url)?;
    let rest = rest.strip_prefix("/users/")?;
    let (username, rest) = rest.split_once("/collections/")?;
    let collection_id = rest.trim_end_matches('/');

    if username.is_empty() || collection_id.is_empty() || collection_id.contains('/') {
        return None;
    }

    Some((username.to_string(), collection_id.to_string()))
}

/// Materialize the items of a collection, fully sorted.
///
/// MANUAL member ids are resolved against the owner's outbox with
/// Create envelopes unwrapped; QUERY filters are evaluated over the
/// full outbox. Pagination happens at the API layer over this list.
pub async fn resolve_items(
    db: &Database,
    definition: &CollectionDefinition,
) -> Result<Vec<serde_json::Value>, AppError> {
    match definition.collection_type {
        CollectionType::Manual => {
            let members = db
                .get_collection_items(&definition.username, &definition.id)
                .await?;

            let mut resolved: Vec<(chrono::DateTime<Utc>, serde_json::Value)> =
                Vec::with_capacity(members.len());

            for member in &members {
                let value = match db
                    .find_outbox_activity_for_object(&definition.username, &member.item_id)
                    .await?
                {
                    Some(record) => unwrap_create(&record.payload),
                    // Members that resolve to nothing are surfaced as
                    // bare IRIs rather than dropped
                    None => serde_json::Value::String(member.item_id.clone()),
                };
                resolved.push((member.added_at, value));
            }

            match definition.sort_order {
                CollectionSortOrder::Manual => {}
                CollectionSortOrder::Chrono => resolved.sort_by_key(|(added_at, _)| *added_at),
                CollectionSortOrder::ReverseChrono => {
                    resolved.sort_by_key(|(added_at, _)| std::cmp::Reverse(*added_at))
                }
            }

            Ok(resolved.into_iter().map(|(_, value)| value).collect())
        }
        CollectionType::Query => {
            let filter = definition.query_filter.clone().unwrap_or_default();
            let outbox = db.get_full_outbox(&definition.username).await?;
            let mut items = evaluate_query(&filter, &outbox, definition.sort_order);

            if let Some(max) = definition.max_items {
                items.truncate(max as usize);
            }

            Ok(items)
        }
    }
}

/// Wire form of an OrderedCollection without page params:
/// metadata plus a `first` page link.
pub fn ordered_collection(id: &str, total_items: usize) -> serde_json::Value {
    serde_json::json!({
        "@context": "https://www.w3.org/ns/activitystreams",
        "type": "OrderedCollection",
        "id": id,
        "totalItems": total_items,
        "first": format!("{id}?page=0&limit={DEFAULT_PAGE_LIMIT}"),
    })
}

/// Wire form of one OrderedCollectionPage.
pub fn ordered_collection_page(
    collection_id: &str,
    total_items: usize,
    items: Vec<serde_json::Value>,
    page: u32,
    limit: u32,
) -> serde_json::Value {
    let mut value = serde_json::json!({
        "@context": "https://www.w3.org/ns/activitystreams",
        "type": "OrderedCollectionPage",
        "id": format!("{collection_id}?page={page}&limit={limit}"),
        "partOf": collection_id,
        "totalItems": total_items,
        "orderedItems": items,
    });

    let start = (page as usize).saturating_mul(limit as usize);
    if start + (limit as usize) < total_items {
        value["next"] = serde_json::Value::String(format!(
            "{collection_id}?page={}&limit={limit}",
            page + 1
        ));
    }
    if page > 0 {
        value["prev"] = serde_json::Value::String(format!(
            "{collection_id}?page={}&limit={limit}",
            page - 1
        ));
    }

    value
}

/// Clamp a requested page size to the server cap
pub fn clamp_limit(limit: Option<u32>) -> u32 {
    limit.unwrap_or(DEFAULT_PAGE_LIMIT).clamp(1, MAX_PAGE_LIMIT)
}
