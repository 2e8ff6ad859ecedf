//! ActivityPub federation module
//!
//! Handles:
//! - Inbox processing (incoming activities and their side effects)
//! - Outbox processing (publishing and delivery fan-out)
//! - Durable activity delivery with retries
//! - HTTP Signatures
//! - Public key caching
//! - WebFinger

mod delivery;
mod inbox;
mod outbox;
mod signature;
mod webfinger;

pub mod key_cache;

pub use delivery::{
    explicit_recipients, fetch_remote_actor, retry_backoff, target_actor_id, DeliveryEngine,
    DeliveryWorker, RoutingMode, PUBLIC_AUDIENCE,
};
pub use inbox::InboxProcessor;
pub use key_cache::{CacheStats, PublicKeyCache};
pub use outbox::OutboxProcessor;
pub use signature::{
    extract_signature_key_id, fetch_public_key, generate_digest, key_id_matches_actor,
    parse_signature_header, sign_request, verify_signature, SignatureHeaders,
};
pub use webfinger::{resolve_webfinger, WebFingerResult};

use chrono::{DateTime, Utc};

use crate::data::{ActivityRecord, EntityId, StreamKind};
use crate::error::AppError;

/// Build a stream record from a verbatim activity payload.
///
/// The payload must already carry an `id` and a string `type`;
/// the typed columns are extracted here for stream scans and
/// reverse lookup.
pub fn build_activity_record(
    username: &str,
    stream: StreamKind,
    activity: &serde_json::Value,
) -> Result<ActivityRecord, AppError> {
    let activity_id = activity
        .get("id")
        .and_then(|v| v.as_str())
        .ok_or_else(|| AppError::Validation("Activity is missing an id".to_string()))?
        .to_string();

    let activity_type = activity
        .get("type")
        .and_then(|v| v.as_str())
        .ok_or_else(|| AppError::Validation("Activity is missing a type".to_string()))?
        .to_string();

    let actor_id = activity
        .get("actor")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();

    let object = activity.get("object");
    let object_id = object.and_then(|o| match o {
        serde_json::Value::String(s) => Some(s.clone()),
        other => other
            .get("id")
            .and_then(|id| id.as_str())
            .map(str::to_string),
    });

    let in_reply_to = object
        .and_then(|o| o.get("inReplyTo"))
        .or_else(|| activity.get("inReplyTo"))
        .and_then(|v| v.as_str())
        .map(str::to_string);

    let published: DateTime<Utc> = activity
        .get("published")
        .and_then(|p| p.as_str())
        .and_then(|p| DateTime::parse_from_rfc3339(p).ok())
        .map(|p| p.with_timezone(&Utc))
        .unwrap_or_else(Utc::now);

    Ok(ActivityRecord {
        id: EntityId::new(),
        username: username.to_string(),
        stream,
        activity_id,
        activity_type,
        actor_id,
        object_id,
        in_reply_to,
        published,
        payload: activity.clone(),
    })
}
