//! Query collection evaluation
//!
//! Declarative filters over an actor's outbox. Create envelopes are
//! unwrapped so filters and results see the underlying object;
//! other activity types pass through as-is.

use chrono::{DateTime, Utc};

use crate::data::{ActivityRecord, CollectionSortOrder, QueryFilter};

/// Surface the underlying object of a Create envelope.
///
/// Non-Create activities are retained as-is.
pub fn unwrap_create(activity: &serde_json::Value) -> serde_json::Value {
    let is_create = activity
        .get("type")
        .and_then(|t| t.as_str())
        .is_some_and(|t| t == "Create");

    if is_create {
        if let Some(object) = activity.get("object") {
            if object.is_object() {
                return object.clone();
            }
        }
    }

    activity.clone()
}

fn object_published(object: &serde_json::Value) -> Option<DateTime<Utc>> {
    object
        .get("published")
        .and_then(|p| p.as_str())
        .and_then(|p| DateTime::parse_from_rfc3339(p).ok())
        .map(|p| p.with_timezone(&Utc))
}

fn has_attachment(object: &serde_json::Value) -> bool {
    match object.get("attachment") {
        Some(serde_json::Value::Array(items)) => !items.is_empty(),
        Some(serde_json::Value::Null) | None => false,
        Some(_) => true,
    }
}

fn is_reply(object: &serde_json::Value) -> bool {
    object.get("inReplyTo").is_some_and(|v| !v.is_null())
}

fn tag_names(object: &serde_json::Value) -> Vec<String> {
    let Some(tags) = object.get("tag") else {
        return Vec::new();
    };

    let entries: Vec<&serde_json::Value> = match tags {
        serde_json::Value::Array(items) => items.iter().collect(),
        other => vec![other],
    };

    entries
        .into_iter()
        .filter_map(|tag| tag.get("name").and_then(|n| n.as_str()))
        .map(str::to_string)
        .collect()
}

fn text_fields_contain(object: &serde_json::Value, needle: &str) -> bool {
    let needle = needle.to_lowercase();
    ["content", "name", "summary"].iter().any(|field| {
        object
            .get(*field)
            .and_then(|v| v.as_str())
            .is_some_and(|text| text.to_lowercase().contains(&needle))
    })
}

/// Whether one activity matches a filter. All present clauses are
/// ANDed; `envelope_type` is the stored activity's outer type and
/// `object` the unwrapped item.
pub fn matches_filter(
    filter: &QueryFilter,
    envelope_type: &str,
    object: &serde_json::Value,
) -> bool {
    if let Some(activity_types) = &filter.activity_types {
        if !activity_types.iter().any(|t| t == envelope_type) {
            return false;
        }
    }

    if let Some(object_types) = &filter.object_types {
        let object_type = object.get("type").and_then(|t| t.as_str()).unwrap_or("");
        if !object_types.iter().any(|t| t == object_type) {
            return false;
        }
    }

    if let Some(tags) = &filter.tags {
        let names = tag_names(object);
        if !tags.iter().any(|wanted| names.iter().any(|n| n == wanted)) {
            return false;
        }
    }

    if filter.after_date.is_some() || filter.before_date.is_some() {
        let Some(published) = object_published(object) else {
            return false;
        };
        if let Some(after) = filter.after_date {
            if published <= after {
                return false;
            }
        }
        if let Some(before) = filter.before_date {
            if published > before {
                return false;
            }
        }
    }

    if let Some(wanted) = filter.has_attachment {
        if has_attachment(object) != wanted {
            return false;
        }
    }

    if let Some(wanted) = filter.is_reply {
        if is_reply(object) != wanted {
            return false;
        }
    }

    if let Some(needle) = &filter.search_query {
        if !text_fields_contain(object, needle) {
            return false;
        }
    }

    true
}

/// Evaluate a filter over an outbox scan and sort the matches.
///
/// MANUAL sort has no meaning for a computed result and falls back to
/// chronological order.
pub fn evaluate_query(
    filter: &QueryFilter,
    outbox: &[ActivityRecord],
    sort_order: CollectionSortOrder,
) -> Vec<serde_json::Value> {
    let mut matched: Vec<(DateTime<Utc>, serde_json::Value)> = Vec::new();

    for record in outbox {
        let object = unwrap_create(&record.payload);
        if matches_filter(filter, &record.activity_type, &object) {
            let published = object_published(&object).unwrap_or(record.published);
            matched.push((published, object));
        }
    }

    match sort_order {
        CollectionSortOrder::ReverseChrono => {
            matched.sort_by_key(|(published, _)| std::cmp::Reverse(*published))
        }
        CollectionSortOrder::Chrono | CollectionSortOrder::Manual => {
            matched.sort_by_key(|(published, _)| *published)
        }
    }

    matched.into_iter().map(|(_, object)| object).collect()
}
