//! Outbox processing
//!
//! Publishing path for local actors: mints activity/object ids,
//! applies collection side effects, persists to the outbox stream,
//! and hands the activity to the delivery engine for fan-out.

use chrono::Utc;
use std::sync::Arc;

use crate::collections;
use crate::config::AppConfig;
use crate::data::{Actor, CollectionType, Database, StreamKind};
use crate::error::AppError;
use crate::metrics::ACTIVITIES_PUBLISHED_TOTAL;

use super::delivery::{DeliveryEngine, RoutingMode};

/// Outbox processor
///
/// Accepts activities POSTed to a local actor's outbox.
pub struct OutboxProcessor {
    db: Arc<Database>,
    config: Arc<AppConfig>,
    /// Absent when activity delivery is disabled; publishing still
    /// persists to the stream.
    delivery: Option<DeliveryEngine>,
}

impl OutboxProcessor {
    pub fn new(
        db: Arc<Database>,
        config: Arc<AppConfig>,
        delivery: Option<DeliveryEngine>,
    ) -> Self {
        Self {
            db,
            config,
            delivery,
        }
    }

    fn prefixed_base_url(&self) -> String {
        self.config.server.prefixed_base_url()
    }

    /// Publish an activity from a local actor.
    ///
    /// The activity is persisted before the delivery fan-out is
    /// enqueued, and the queue items exist before this returns.
    ///
    /// # Returns
    /// The (possibly minted) activity id for the Location header.
    pub async fn publish(
        &self,
        actor: &Actor,
        mut activity: serde_json::Value,
    ) -> Result<String, AppError> {
        let activity_type = activity
            .get("type")
            .and_then(|t| t.as_str())
            .ok_or_else(|| AppError::Validation("Missing activity type".to_string()))?
            .to_string();

        // The envelope always speaks for the publishing actor
        activity["actor"] = serde_json::Value::String(actor.id.clone());

        if activity.get("id").and_then(|v| v.as_str()).is_none() {
            let minted = format!(
                "{}/activities/{}",
                self.prefixed_base_url(),
                uuid::Uuid::new_v4()
            );
            activity["id"] = serde_json::Value::String(minted);
        }

        if activity.get("published").and_then(|v| v.as_str()).is_none() {
            activity["published"] = serde_json::Value::String(Utc::now().to_rfc3339());
        }

        // Collection side effects run before the envelope is persisted
        // so a minted object lands in the outbox first
        match activity_type.as_str() {
            "Add" => self.apply_collection_add(actor, &mut activity).await?,
            "Remove" => self.apply_collection_remove(actor, &activity).await?,
            _ => {}
        }

        let record = super::build_activity_record(&actor.username, StreamKind::Outbox, &activity)?;
        let activity_id = record.activity_id.clone();
        self.db.insert_activity(&record).await?;

        ACTIVITIES_PUBLISHED_TOTAL
            .with_label_values(&[activity_type.as_str()])
            .inc();

        if let Some(delivery) = &self.delivery {
            let mode = RoutingMode::for_activity(&activity);
            delivery.enqueue(actor, &activity, mode).await?;
        }

        tracing::info!(
            username = %actor.username,
            activity_id = %activity_id,
            activity_type = %activity_type,
            "Activity published"
        );

        Ok(activity_id)
    }

    /// Outbound `Add(object, target)` against one of the actor's own
    /// MANUAL collections.
    ///
    /// An object without an id gets one minted under the actor's
    /// object space and is persisted as a Create envelope before the
    /// member append.
    async fn apply_collection_add(
        &self,
        actor: &Actor,
        activity: &mut serde_json::Value,
    ) -> Result<(), AppError> {
        let Some(definition) = self.own_target_collection(actor, activity).await? else {
            return Ok(());
        };

        let explicit_id = match activity.get("object") {
            Some(serde_json::Value::String(id)) => Some(id.clone()),
            Some(object) if object.is_object() => object
                .get("id")
                .and_then(|id| id.as_str())
                .map(str::to_string),
            _ => {
                return Err(AppError::Validation(
                    "Add is missing an object".to_string(),
                ));
            }
        };

        let item_id = match explicit_id {
            Some(id) => id,
            None => self.mint_and_persist_object(actor, activity).await?,
        };

        self.db
            .add_collection_item(&actor.username, &definition.id, &item_id, definition.max_items)
            .await?;

        tracing::info!(
            username = %actor.username,
            collection = %definition.id,
            item = %item_id,
            "Collection item added"
        );
        Ok(())
    }

    /// Outbound `Remove(object, target)`, symmetric to Add
    async fn apply_collection_remove(
        &self,
        actor: &Actor,
        activity: &serde_json::Value,
    ) -> Result<(), AppError> {
        let Some(definition) = self.own_target_collection(actor, activity).await? else {
            return Ok(());
        };

        let item_id = match activity.get("object") {
            Some(serde_json::Value::String(id)) => id.clone(),
            Some(object) => object
                .get("id")
                .and_then(|id| id.as_str())
                .map(str::to_string)
                .ok_or_else(|| {
                    AppError::Unprocessable("Remove object carries no id".to_string())
                })?,
            None => {
                return Err(AppError::Validation(
                    "Remove is missing an object".to_string(),
                ));
            }
        };

        self.db
            .remove_collection_item(&actor.username, &definition.id, &item_id)
            .await?;

        tracing::info!(
            username = %actor.username,
            collection = %definition.id,
            item = %item_id,
            "Collection item removed"
        );
        Ok(())
    }

    /// Resolve the activity's target to a MANUAL collection owned by
    /// the publishing actor. Targets outside the actor's collection
    /// space are not a side effect and resolve to None.
    async fn own_target_collection(
        &self,
        actor: &Actor,
        activity: &serde_json::Value,
    ) -> Result<Option<crate::data::CollectionDefinition>, AppError> {
        let target = match activity.get("target") {
            Some(serde_json::Value::String(url)) => url.clone(),
            Some(object) => object
                .get("id")
                .and_then(|id| id.as_str())
                .map(str::to_string)
                .unwrap_or_default(),
            None => return Ok(None),
        };

        let Some((owner, collection_id)) =
            collections::parse_collection_url(&self.prefixed_base_url(), &target)
        else {
            return Ok(None);
        };

        if owner != actor.username {
            return Err(AppError::Forbidden);
        }

        let definition = self
            .db
            .get_collection(&owner, &collection_id)
            .await?
            .ok_or(AppError::NotFound)?;

        if definition.collection_type != CollectionType::Manual {
            return Err(AppError::Unprocessable(
                "QUERY collections do not accept Add/Remove".to_string(),
            ));
        }

        Ok(Some(definition))
    }

    /// Mint an id for an embedded object and persist it to the outbox
    /// wrapped in a Create envelope.
    ///
    /// # Returns
    /// The minted object id.
    async fn mint_and_persist_object(
        &self,
        actor: &Actor,
        activity: &mut serde_json::Value,
    ) -> Result<String, AppError> {
        let object_id = format!(
            "{}/users/{}/objects/{}",
            self.prefixed_base_url(),
            actor.username,
            uuid::Uuid::new_v4()
        );

        let object = activity
            .get_mut("object")
            .ok_or_else(|| AppError::Validation("Add is missing an object".to_string()))?;
        object["id"] = serde_json::Value::String(object_id.clone());
        if object.get("attributedTo").is_none() {
            object["attributedTo"] = serde_json::Value::String(actor.id.clone());
        }

        let create = serde_json::json!({
            "@context": "https://www.w3.org/ns/activitystreams",
            "type": "Create",
            "id": format!("{}/activities/{}", self.prefixed_base_url(), uuid::Uuid::new_v4()),
            "actor": actor.id,
            "object": object.clone(),
            "published": Utc::now().to_rfc3339(),
        });

        let record = super::build_activity_record(&actor.username, StreamKind::Outbox, &create)?;
        self.db.insert_activity(&record).await?;

        Ok(object_id)
    }
}
