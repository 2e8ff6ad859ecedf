//! Data models
//!
//! Rust structs representing database entities.
//! All models use ULID for row IDs and chrono for timestamps.
//! ActivityPub payloads are kept verbatim as `serde_json::Value`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// =============================================================================
// ID Types
// =============================================================================

/// Entity ID wrapper (ULID format, 26 characters)
///
/// Example: "01ARZ3NDEKTSV4RRFFQ69G5FAV"
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(pub String);

impl EntityId {
    /// Generate a new ULID
    pub fn new() -> Self {
        Self(ulid::Ulid::new().to_string())
    }

    /// Create from existing string
    pub fn from_string(s: String) -> Self {
        Self(s)
    }
}

impl Default for EntityId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for EntityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

// =============================================================================
// Actor
// =============================================================================

/// Concrete actor variant, dispatched on the `type` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActorKind {
    Person,
    Service,
    Application,
    Organization,
    Group,
}

impl ActorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Person => "Person",
            Self::Service => "Service",
            Self::Application => "Application",
            Self::Organization => "Organization",
            Self::Group => "Group",
        }
    }

    /// Parse actor kind from the wire `type` field
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Person" => Some(Self::Person),
            "Service" => Some(Self::Service),
            "Application" => Some(Self::Application),
            "Organization" => Some(Self::Organization),
            "Group" => Some(Self::Group),
            _ => None,
        }
    }
}

/// A local principal with inbox, outbox, relation collections,
/// and an RSA-2048 key pair.
///
/// Remote actors are never persisted here; their profiles are fetched
/// on demand and only their public keys are cached.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Actor {
    /// Actor URI (globally unique)
    pub id: String,
    /// Username, unique on this server, URL-safe
    pub username: String,
    pub kind: ActorKind,
    pub display_name: Option<String>,
    pub summary: Option<String>,
    pub inbox: String,
    pub outbox: String,
    pub followers_url: String,
    pub following_url: String,
    pub shared_inbox: Option<String>,
    /// RSA public key (PEM format)
    pub public_key_pem: String,
    /// RSA private key (PEM format); never emitted on the wire
    /// except under the admin bearer token
    pub private_key_pem: Option<String>,
    /// Extension key/value pairs preserved verbatim
    pub extensions: serde_json::Map<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Actor {
    /// URI of the actor's public key (`{id}#main-key`)
    pub fn key_id(&self) -> String {
        format!("{}#main-key", self.id)
    }
}

// =============================================================================
// Activity streams
// =============================================================================

/// Which per-actor stream an activity was written to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Inbox,
    Outbox,
}

impl StreamKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Inbox => "inbox",
            Self::Outbox => "outbox",
        }
    }
}

/// A stored activity envelope.
///
/// The payload is kept verbatim; the typed columns exist for stream
/// scans and reverse lookup (replies, likes, shares).
#[derive(Debug, Clone)]
pub struct ActivityRecord {
    /// Row ID (ULID, monotonic within a stream)
    pub id: EntityId,
    pub username: String,
    pub stream: StreamKind,
    /// ActivityPub id URI, unique within (username, stream)
    pub activity_id: String,
    pub activity_type: String,
    pub actor_id: String,
    /// Unwrapped object id, if the activity carries one
    pub object_id: Option<String>,
    /// Unwrapped object `inReplyTo`, if present
    pub in_reply_to: Option<String>,
    pub published: DateTime<Utc>,
    /// Verbatim activity JSON
    pub payload: serde_json::Value,
}

// =============================================================================
// Follow relations
// =============================================================================

/// A follower or following edge between a local actor and a remote one
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FollowRelation {
    pub id: String,
    /// Local username owning the relation
    pub username: String,
    /// Remote actor URI
    pub remote_actor_id: String,
    pub created_at: DateTime<Utc>,
}

// =============================================================================
// Delivery queue
// =============================================================================

/// Delivery queue item status.
///
/// ```text
/// PENDING -(worker claims)-> PROCESSING
/// PROCESSING -(2xx)-> DELIVERED
/// PROCESSING -(other)-> FAILED
/// FAILED -(attempt<max)-> PENDING
/// FAILED -(attempt>=max)-> DEAD
/// PROCESSING -(lease expires)-> PENDING
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryStatus {
    Pending,
    Processing,
    Delivered,
    Failed,
    Dead,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Processing => "PROCESSING",
            Self::Delivered => "DELIVERED",
            Self::Failed => "FAILED",
            Self::Dead => "DEAD",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(Self::Pending),
            "PROCESSING" => Some(Self::Processing),
            "DELIVERED" => Some(Self::Delivered),
            "FAILED" => Some(Self::Failed),
            "DEAD" => Some(Self::Dead),
            _ => None,
        }
    }

    /// Terminal states are never claimed again
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Delivered | Self::Dead)
    }
}

/// One pending delivery of an activity to one target inbox URL.
///
/// Items are produced per unique inbox URL, not per recipient;
/// recipients sharing a `sharedInbox` collapse into a single item.
#[derive(Debug, Clone)]
pub struct DeliveryItem {
    /// ULID, monotonic
    pub id: EntityId,
    pub sender_username: String,
    pub sender_actor_id: String,
    /// Target inbox URL
    pub target_inbox: String,
    /// Verbatim activity JSON
    pub activity: serde_json::Value,
    pub status: DeliveryStatus,
    pub attempt_count: u32,
    pub max_attempts: u32,
    pub created_at: DateTime<Utc>,
    pub next_attempt_at: DateTime<Utc>,
    /// Set while PROCESSING; a stale lease reverts the item to PENDING
    pub leased_until: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

/// Queue item counts per status, for operator observability
#[derive(Debug, Clone, Default, Serialize)]
pub struct DeliveryQueueStats {
    pub pending: i64,
    pub processing: i64,
    pub delivered: i64,
    pub failed: i64,
    pub dead: i64,
}

// =============================================================================
// Custom collections
// =============================================================================

/// MANUAL collections carry an ordered member list;
/// QUERY collections carry a filter evaluated over the owner's outbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CollectionType {
    Manual,
    Query,
}

impl CollectionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Manual => "MANUAL",
            Self::Query => "QUERY",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "MANUAL" => Some(Self::Manual),
            "QUERY" => Some(Self::Query),
            _ => None,
        }
    }
}

/// Collection visibility.
///
/// PUBLIC collections are advertised in the owner's profile,
/// UNLISTED ones are served only by direct URL, PRIVATE ones
/// require administrative authorization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CollectionVisibility {
    Public,
    Unlisted,
    Private,
}

impl CollectionVisibility {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Public => "PUBLIC",
            Self::Unlisted => "UNLISTED",
            Self::Private => "PRIVATE",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PUBLIC" => Some(Self::Public),
            "UNLISTED" => Some(Self::Unlisted),
            "PRIVATE" => Some(Self::Private),
            _ => None,
        }
    }
}

/// Sort order applied when a collection page is read
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CollectionSortOrder {
    Chrono,
    ReverseChrono,
    Manual,
}

impl CollectionSortOrder {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Chrono => "CHRONO",
            Self::ReverseChrono => "REVERSE_CHRONO",
            Self::Manual => "MANUAL",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "CHRONO" => Some(Self::Chrono),
            "REVERSE_CHRONO" => Some(Self::ReverseChrono),
            "MANUAL" => Some(Self::Manual),
            _ => None,
        }
    }
}

/// Declarative filter for QUERY collections.
///
/// All present filters are ANDed. Field names follow the wire form
/// carried inside `broca:collectionDefinition`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct QueryFilter {
    /// Envelope type is one of these
    #[serde(skip_serializing_if = "Option::is_none")]
    pub activity_types: Option<Vec<String>>,
    /// Wrapped object type is one of these
    #[serde(skip_serializing_if = "Option::is_none")]
    pub object_types: Option<Vec<String>>,
    /// Object has a tag whose name is one of these
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
    /// Object `published` strictly after this instant
    #[serde(skip_serializing_if = "Option::is_none")]
    pub after_date: Option<DateTime<Utc>>,
    /// Object `published` at or before this instant
    #[serde(skip_serializing_if = "Option::is_none")]
    pub before_date: Option<DateTime<Utc>>,
    /// Object has at least one attachment iff true
    #[serde(skip_serializing_if = "Option::is_none")]
    pub has_attachment: Option<bool>,
    /// Object has `inReplyTo` iff true
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_reply: Option<bool>,
    /// Case-insensitive substring match over content, name, summary
    #[serde(skip_serializing_if = "Option::is_none")]
    pub search_query: Option<String>,
}

impl QueryFilter {
    /// A filter with no clauses matches everything
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// An actor-owned custom collection definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionDefinition {
    /// URL-safe slug, unique per actor
    pub id: String,
    /// Owning local username
    pub username: String,
    pub name: String,
    pub description: Option<String>,
    pub collection_type: CollectionType,
    pub visibility: CollectionVisibility,
    pub sort_order: CollectionSortOrder,
    pub max_items: Option<u32>,
    /// Present iff `collection_type` is QUERY
    pub query_filter: Option<QueryFilter>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A member of a MANUAL collection
#[derive(Debug, Clone)]
pub struct CollectionItem {
    pub username: String,
    pub collection_id: String,
    /// Insertion order
    pub position: i64,
    /// Object URI
    pub item_id: String,
    pub added_at: DateTime<Utc>,
}

// =============================================================================
// Blobs
// =============================================================================

/// A media blob mirrored into local storage
#[derive(Debug, Clone)]
pub struct Blob {
    pub username: String,
    /// ULID
    pub id: String,
    /// MIME type (e.g., "image/webp")
    pub content_type: String,
    pub data: Vec<u8>,
    /// Remote URL this blob mirrors, if any
    pub source_url: Option<String>,
    pub created_at: DateTime<Utc>,
}
