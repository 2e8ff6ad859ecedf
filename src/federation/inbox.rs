//! Inbox processing
//!
//! Applies incoming ActivityPub activities to local state: persists
//! them to the recipient's inbox stream and dispatches side effects
//! by activity type. Acceptance is decoupled from side-effect
//! success; handlers log and keep going.

use std::sync::Arc;

use crate::collections;
use crate::config::AppConfig;
use crate::data::{ActorKind, Database, StreamKind};
use crate::error::AppError;
use crate::identity;
use crate::metrics::ACTIVITIES_RECEIVED_TOTAL;
use crate::storage::MediaStore;

/// Object keys that are part of the core actor document rather than
/// the extension bag.
const ACTOR_CORE_KEYS: [&str; 13] = [
    "@context",
    "id",
    "type",
    "preferredUsername",
    "name",
    "summary",
    "inbox",
    "outbox",
    "followers",
    "following",
    "endpoints",
    "publicKey",
    "url",
];

/// Inbox processor
///
/// Processes incoming ActivityPub activities for one local recipient.
pub struct InboxProcessor {
    db: Arc<Database>,
    media: MediaStore,
    config: Arc<AppConfig>,
}

impl InboxProcessor {
    pub fn new(db: Arc<Database>, media: MediaStore, config: Arc<AppConfig>) -> Self {
        Self { db, media, config }
    }

    fn prefixed_base_url(&self) -> String {
        self.config.server.prefixed_base_url()
    }

    /// Process an incoming activity.
    ///
    /// # Arguments
    /// * `username` - Local recipient
    /// * `activity` - Raw activity JSON (already authenticated)
    /// * `admin_authorized` - Request passed the administrative gate
    ///
    /// # Side Effects
    /// Persists the activity to the inbox stream, mirrors remote
    /// attachments, and mutates follower/actor/collection state per
    /// activity type. Federated side-effect failures are logged, not
    /// surfaced; administrative failures are returned to the caller.
    pub async fn process(
        &self,
        username: &str,
        mut activity: serde_json::Value,
        admin_authorized: bool,
    ) -> Result<(), AppError> {
        let activity_type = activity
            .get("type")
            .and_then(|t| t.as_str())
            .ok_or_else(|| AppError::Validation("Missing activity type".to_string()))?
            .to_string();

        ACTIVITIES_RECEIVED_TOTAL
            .with_label_values(&[activity_type.as_str()])
            .inc();

        // Generate an id when the sender omitted one so the stream
        // write stays keyed
        if activity.get("id").and_then(|v| v.as_str()).is_none() {
            let minted = format!(
                "{}/activities/{}",
                self.prefixed_base_url(),
                uuid::Uuid::new_v4()
            );
            activity["id"] = serde_json::Value::String(minted);
        }

        // Mirror remote attachments before the payload is persisted;
        // failures keep the original URL
        if let Err(error) = self.mirror_attachments(username, &mut activity).await {
            tracing::warn!(%error, "Attachment mirroring failed, keeping original URLs");
        }

        // Persist to the inbox stream; duplicate ids are no-ops
        let record = super::build_activity_record(username, StreamKind::Inbox, &activity)?;
        let inserted = self.db.insert_activity(&record).await?;
        if !inserted {
            tracing::debug!(
                activity_id = %record.activity_id,
                username = %username,
                "Duplicate inbox delivery ignored"
            );
        }

        // Dispatch side effects. Federated acceptance is decoupled
        // from side-effect success; administrative callers are the
        // operator and do want the failure.
        if let Err(error) = self
            .apply_side_effects(username, &activity_type, &activity, admin_authorized)
            .await
        {
            if admin_authorized {
                return Err(error);
            }
            tracing::warn!(
                %error,
                activity_type = %activity_type,
                username = %username,
                "Inbox side effect failed"
            );
        }

        Ok(())
    }

    /// Apply the per-type side effect table
    async fn apply_side_effects(
        &self,
        username: &str,
        activity_type: &str,
        activity: &serde_json::Value,
        admin_authorized: bool,
    ) -> Result<(), AppError> {
        match activity_type {
            "Follow" => self.handle_follow(username, activity).await,
            "Undo" => self.handle_undo(username, activity).await,
            "Accept" | "Reject" => {
                tracing::debug!(username = %username, "Received {activity_type}, no state change");
                Ok(())
            }
            "Create" => self.handle_create(username, activity, admin_authorized).await,
            "Update" => self.handle_update(username, activity, admin_authorized).await,
            "Delete" => self.handle_delete(username, activity, admin_authorized).await,
            // Indexed for reverse lookup at write time; nothing else to do
            "Like" | "Announce" => Ok(()),
            "Add" => self.handle_add_remove(username, activity, true).await,
            "Remove" => self.handle_add_remove(username, activity, false).await,
            other => {
                tracing::debug!(activity_type = %other, "Unknown activity type accepted as no-op");
                Ok(())
            }
        }
    }

    /// Follow: record the follower relation. Idempotent.
    ///
    /// No Accept is issued automatically; the relation is recorded
    /// unconditionally.
    async fn handle_follow(
        &self,
        username: &str,
        activity: &serde_json::Value,
    ) -> Result<(), AppError> {
        let follower = activity
            .get("actor")
            .and_then(|a| a.as_str())
            .ok_or_else(|| AppError::Validation("Follow is missing an actor".to_string()))?;

        let added = self.db.add_follower(username, follower).await?;
        if added {
            tracing::info!(username = %username, follower = %follower, "Follower added");
        }
        Ok(())
    }

    /// Undo(Follow): remove the follower relation. Other undone types
    /// are informational.
    async fn handle_undo(
        &self,
        username: &str,
        activity: &serde_json::Value,
    ) -> Result<(), AppError> {
        let actor = activity
            .get("actor")
            .and_then(|a| a.as_str())
            .ok_or_else(|| AppError::Validation("Undo is missing an actor".to_string()))?;

        let undone_type = match activity.get("object") {
            Some(serde_json::Value::Object(object)) => object
                .get("type")
                .and_then(|t| t.as_str())
                .map(str::to_string),
            // A bare URI: look the referenced activity up in this inbox
            Some(serde_json::Value::String(activity_id)) => self
                .db
                .get_activity(username, StreamKind::Inbox, activity_id)
                .await?
                .map(|record| record.activity_type),
            _ => None,
        };

        if undone_type.as_deref() == Some("Follow") {
            let removed = self.db.remove_follower(username, actor).await?;
            if removed {
                tracing::info!(username = %username, follower = %actor, "Follower removed");
            }
        }

        Ok(())
    }

    /// Create: administrative creates route to the admin handlers,
    /// everything else is already stored.
    async fn handle_create(
        &self,
        username: &str,
        activity: &serde_json::Value,
        admin_authorized: bool,
    ) -> Result<(), AppError> {
        let is_system_inbox = username == self.config.federation.system_actor_username;
        if !is_system_inbox || !admin_authorized || !self.config.admin.enable_admin_operations {
            return Ok(());
        }

        let object = activity
            .get("object")
            .ok_or_else(|| AppError::Validation("Create is missing an object".to_string()))?;
        let object_type = object.get("type").and_then(|t| t.as_str()).unwrap_or("");

        if let Some(kind) = ActorKind::parse(object_type) {
            return self.admin_create_actor(object, kind).await;
        }

        if object_type == "Collection" {
            return self.admin_create_collection(object).await;
        }

        tracing::debug!(object_type = %object_type, "Admin Create for unsupported object type ignored");
        Ok(())
    }

    /// Admin: materialize a new local actor with a fresh key pair
    async fn admin_create_actor(
        &self,
        object: &serde_json::Value,
        kind: ActorKind,
    ) -> Result<(), AppError> {
        let username = object
            .get("preferredUsername")
            .and_then(|u| u.as_str())
            .ok_or_else(|| {
                AppError::Unprocessable("actor create requires preferredUsername".to_string())
            })?;

        if self.db.get_actor_by_username(username).await?.is_some() {
            return Err(AppError::Unprocessable(format!(
                "username {username} is already taken"
            )));
        }

        let display_name = object
            .get("name")
            .and_then(|n| n.as_str())
            .map(str::to_string);
        let summary = object
            .get("summary")
            .and_then(|s| s.as_str())
            .map(str::to_string);

        // Everything outside the core document is preserved verbatim
        let mut extensions = serde_json::Map::new();
        if let Some(map) = object.as_object() {
            for (key, value) in map {
                if !ACTOR_CORE_KEYS.contains(&key.as_str()) {
                    extensions.insert(key.clone(), value.clone());
                }
            }
        }

        let actor = identity::build_local_actor(
            &self.config,
            username,
            kind,
            display_name,
            summary,
            extensions,
        )?;
        self.db.insert_actor(&actor).await?;

        tracing::info!(username = %username, kind = %kind.as_str(), "Actor created by admin");
        Ok(())
    }

    /// Admin: create a custom collection from the attached definition
    async fn admin_create_collection(&self, object: &serde_json::Value) -> Result<(), AppError> {
        let owner_id = object
            .get("attributedTo")
            .and_then(|a| a.as_str())
            .ok_or_else(|| {
                AppError::Unprocessable("collection create requires attributedTo".to_string())
            })?;

        let owner = self
            .db
            .get_actor_by_id(owner_id)
            .await?
            .ok_or_else(|| AppError::Unprocessable(format!("unknown owner actor: {owner_id}")))?;

        let definition_value = object
            .get("broca:collectionDefinition")
            .ok_or_else(|| {
                AppError::Unprocessable(
                    "collection create requires broca:collectionDefinition".to_string(),
                )
            })?;

        let (definition, items) =
            collections::definition_from_wire(&owner.username, definition_value)?;

        if self
            .db
            .get_collection(&owner.username, &definition.id)
            .await?
            .is_some()
        {
            return Err(AppError::Unprocessable(format!(
                "collection {} already exists",
                definition.id
            )));
        }

        self.db.insert_collection(&definition).await?;
        for item in items {
            self.db
                .add_collection_item(&owner.username, &definition.id, &item, definition.max_items)
                .await?;
        }

        tracing::info!(
            owner = %owner.username,
            collection = %definition.id,
            "Collection created by admin"
        );
        Ok(())
    }

    /// Admin Update: mutate an actor's profile fields (preserving
    /// identity, endpoints, and key material) or a collection
    /// definition. System inbox only.
    async fn handle_update(
        &self,
        username: &str,
        activity: &serde_json::Value,
        admin_authorized: bool,
    ) -> Result<(), AppError> {
        let is_system_inbox = username == self.config.federation.system_actor_username;
        if !is_system_inbox || !admin_authorized || !self.config.admin.enable_admin_operations {
            return Ok(());
        }

        let object = activity
            .get("object")
            .ok_or_else(|| AppError::Validation("Update is missing an object".to_string()))?;

        let Some(kind) = object.get("type").and_then(|t| t.as_str()) else {
            return Ok(());
        };
        if kind == "Collection" {
            return self.admin_update_collection(object).await;
        }
        if ActorKind::parse(kind).is_none() {
            return Ok(());
        }

        let actor_id = object
            .get("id")
            .and_then(|id| id.as_str())
            .ok_or_else(|| AppError::Unprocessable("actor update requires an id".to_string()))?;

        let existing = self
            .db
            .get_actor_by_id(actor_id)
            .await?
            .ok_or(AppError::NotFound)?;

        let display_name = object.get("name").and_then(|n| n.as_str());
        let summary = object.get("summary").and_then(|s| s.as_str());

        let mut extensions = existing.extensions.clone();
        if let Some(map) = object.as_object() {
            for (key, value) in map {
                if !ACTOR_CORE_KEYS.contains(&key.as_str()) {
                    extensions.insert(key.clone(), value.clone());
                }
            }
        }

        self.db
            .update_actor_profile(&existing.username, display_name, summary, &extensions)
            .await?;

        tracing::info!(username = %existing.username, "Actor updated by admin");
        Ok(())
    }

    /// Admin Update(Collection): replace the mutable fields of an
    /// existing definition. The collection's type stays fixed.
    async fn admin_update_collection(&self, object: &serde_json::Value) -> Result<(), AppError> {
        let owner_id = object
            .get("attributedTo")
            .and_then(|a| a.as_str())
            .ok_or_else(|| {
                AppError::Unprocessable("collection update requires attributedTo".to_string())
            })?;

        let owner = self
            .db
            .get_actor_by_id(owner_id)
            .await?
            .ok_or_else(|| AppError::Unprocessable(format!("unknown owner actor: {owner_id}")))?;

        let definition_value = object.get("broca:collectionDefinition").ok_or_else(|| {
            AppError::Unprocessable(
                "collection update requires broca:collectionDefinition".to_string(),
            )
        })?;

        let (incoming, items) =
            collections::definition_from_wire(&owner.username, definition_value)?;

        let existing = self
            .db
            .get_collection(&owner.username, &incoming.id)
            .await?
            .ok_or(AppError::NotFound)?;

        if incoming.collection_type != existing.collection_type {
            return Err(AppError::Unprocessable(
                "collection type cannot be changed".to_string(),
            ));
        }
        if !items.is_empty() {
            return Err(AppError::Unprocessable(
                "collection update does not replace items; use Add/Remove".to_string(),
            ));
        }

        let mut updated = incoming;
        updated.created_at = existing.created_at;
        self.db.update_collection(&updated).await?;

        tracing::info!(
            owner = %owner.username,
            collection = %updated.id,
            "Collection updated by admin"
        );
        Ok(())
    }

    /// Admin Delete: remove an actor (the system actor is never
    /// deletable) or a custom collection named by its URL.
    /// System inbox only.
    async fn handle_delete(
        &self,
        username: &str,
        activity: &serde_json::Value,
        admin_authorized: bool,
    ) -> Result<(), AppError> {
        let is_system_inbox = username == self.config.federation.system_actor_username;
        if !is_system_inbox || !admin_authorized || !self.config.admin.enable_admin_operations {
            return Ok(());
        }

        let target = match activity.get("object") {
            Some(serde_json::Value::String(id)) => id.clone(),
            Some(object) => object
                .get("id")
                .and_then(|id| id.as_str())
                .map(str::to_string)
                .ok_or_else(|| {
                    AppError::Unprocessable("delete requires an object id".to_string())
                })?,
            None => {
                return Err(AppError::Validation("Delete is missing an object".to_string()));
            }
        };

        // A collection URL deletes the collection
        if let Some((owner, collection_id)) =
            collections::parse_collection_url(&self.prefixed_base_url(), &target)
        {
            self.db.delete_collection(&owner, &collection_id).await?;
            tracing::info!(
                owner = %owner,
                collection = %collection_id,
                "Collection deleted by admin"
            );
            return Ok(());
        }

        let actor = self
            .db
            .get_actor_by_id(&target)
            .await?
            .ok_or(AppError::NotFound)?;

        if actor.username == self.config.federation.system_actor_username {
            return Err(AppError::Forbidden);
        }

        self.db.delete_actor(&actor.username).await?;
        tracing::info!(username = %actor.username, "Actor deleted by admin");
        Ok(())
    }

    /// Add/Remove: mutate a custom collection iff the target URL names
    /// a collection owned by the receiving actor.
    async fn handle_add_remove(
        &self,
        username: &str,
        activity: &serde_json::Value,
        is_add: bool,
    ) -> Result<(), AppError> {
        let target = match activity.get("target") {
            Some(serde_json::Value::String(url)) => url.clone(),
            Some(object) => object
                .get("id")
                .and_then(|id| id.as_str())
                .map(str::to_string)
                .unwrap_or_default(),
            None => String::new(),
        };

        let Some((owner, collection_id)) =
            collections::parse_collection_url(&self.prefixed_base_url(), &target)
        else {
            tracing::debug!(target = %target, "Add/Remove target is not a local collection");
            return Ok(());
        };

        if owner != username {
            tracing::warn!(
                username = %username,
                owner = %owner,
                "Add/Remove target owned by a different actor, ignored"
            );
            return Ok(());
        }

        let definition = self
            .db
            .get_collection(&owner, &collection_id)
            .await?
            .ok_or(AppError::NotFound)?;

        if definition.collection_type != crate::data::CollectionType::Manual {
            return Err(AppError::Unprocessable(
                "QUERY collections do not accept Add/Remove".to_string(),
            ));
        }

        let item_id = match activity.get("object") {
            Some(serde_json::Value::String(id)) => id.clone(),
            Some(object) => object
                .get("id")
                .and_then(|id| id.as_str())
                .map(str::to_string)
                .ok_or_else(|| {
                    AppError::Unprocessable("Add/Remove object carries no id".to_string())
                })?,
            None => {
                return Err(AppError::Validation(
                    "Add/Remove is missing an object".to_string(),
                ));
            }
        };

        if is_add {
            self.db
                .add_collection_item(&owner, &collection_id, &item_id, definition.max_items)
                .await?;
        } else {
            self.db
                .remove_collection_item(&owner, &collection_id, &item_id)
                .await?;
        }

        Ok(())
    }

    /// Mirror remote attachment/image URLs of the activity's object
    /// into the blob store, rewriting them to local media URLs.
    async fn mirror_attachments(
        &self,
        username: &str,
        activity: &mut serde_json::Value,
    ) -> Result<(), AppError> {
        let activity_type = activity
            .get("type")
            .and_then(|t| t.as_str())
            .unwrap_or_default()
            .to_string();

        // The object of a wrapping activity, or the activity itself
        let wraps_object = matches!(activity_type.as_str(), "Create" | "Update" | "Announce")
            && activity.get("object").is_some_and(|o| o.is_object());
        let target = if wraps_object {
            match activity.get_mut("object") {
                Some(object) => object,
                None => return Ok(()),
            }
        } else {
            activity
        };

        for field in ["attachment", "image"] {
            let Some(entries) = target.get_mut(field) else {
                continue;
            };

            match entries {
                serde_json::Value::Array(items) => {
                    for item in items {
                        self.mirror_one(username, item).await;
                    }
                }
                item @ serde_json::Value::Object(_) => {
                    self.mirror_one(username, item).await;
                }
                _ => {}
            }
        }

        Ok(())
    }

    /// Best-effort mirror of a single attachment entry
    async fn mirror_one(&self, username: &str, entry: &mut serde_json::Value) {
        let Some(url) = entry.get("url").and_then(|u| u.as_str()).map(str::to_string) else {
            return;
        };

        if self.media.is_local_url(&url) {
            return;
        }

        match self.media.mirror_remote(username, &url).await {
            Ok(local_url) => {
                entry["url"] = serde_json::Value::String(local_url);
            }
            Err(error) => {
                tracing::warn!(%error, url = %url, "Attachment fetch failed, keeping remote URL");
            }
        }
    }
}
