//! SQLite database operations
//!
//! All database access goes through this module. Each group of methods
//! is one of the persistence contracts the core depends on: actor store,
//! activity streams, follow relations, delivery queue, collection store,
//! and blob store.

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Pool, QueryBuilder, Row, Sqlite, SqlitePool};
use std::path::Path;

use super::models::*;
use crate::error::AppError;

/// Database connection pool wrapper.
pub struct Database {
    pool: Pool<Sqlite>,
}

fn actor_from_row(row: &SqliteRow) -> Result<Actor, AppError> {
    let kind_str: String = row.try_get("kind")?;
    let kind = ActorKind::parse(&kind_str)
        .ok_or_else(|| AppError::Internal(anyhow::anyhow!("unknown actor kind: {kind_str}")))?;

    let extensions_json: String = row.try_get("extensions")?;
    let extensions = serde_json::from_str(&extensions_json)
        .map_err(|e| AppError::Internal(anyhow::anyhow!("corrupt actor extensions: {e}")))?;

    Ok(Actor {
        id: row.try_get("id")?,
        username: row.try_get("username")?,
        kind,
        display_name: row.try_get("display_name")?,
        summary: row.try_get("summary")?,
        inbox: row.try_get("inbox")?,
        outbox: row.try_get("outbox")?,
        followers_url: row.try_get("followers_url")?,
        following_url: row.try_get("following_url")?,
        shared_inbox: row.try_get("shared_inbox")?,
        public_key_pem: row.try_get("public_key_pem")?,
        private_key_pem: row.try_get("private_key_pem")?,
        extensions,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn activity_from_row(row: &SqliteRow) -> Result<ActivityRecord, AppError> {
    let stream_str: String = row.try_get("stream")?;
    let stream = match stream_str.as_str() {
        "inbox" => StreamKind::Inbox,
        "outbox" => StreamKind::Outbox,
        other => {
            return Err(AppError::Internal(anyhow::anyhow!(
                "unknown stream kind: {other}"
            )));
        }
    };

    let payload_json: String = row.try_get("payload")?;
    let payload = serde_json::from_str(&payload_json)
        .map_err(|e| AppError::Internal(anyhow::anyhow!("corrupt activity payload: {e}")))?;

    Ok(ActivityRecord {
        id: EntityId::from_string(row.try_get("id")?),
        username: row.try_get("username")?,
        stream,
        activity_id: row.try_get("activity_id")?,
        activity_type: row.try_get("activity_type")?,
        actor_id: row.try_get("actor_id")?,
        object_id: row.try_get("object_id")?,
        in_reply_to: row.try_get("in_reply_to")?,
        published: row.try_get("published")?,
        payload,
    })
}

fn delivery_item_from_row(row: &SqliteRow) -> Result<DeliveryItem, AppError> {
    let status_str: String = row.try_get("status")?;
    let status = DeliveryStatus::parse(&status_str).ok_or_else(|| {
        AppError::Internal(anyhow::anyhow!("unknown delivery status: {status_str}"))
    })?;

    let activity_json: String = row.try_get("activity")?;
    let activity = serde_json::from_str(&activity_json)
        .map_err(|e| AppError::Internal(anyhow::anyhow!("corrupt queued activity: {e}")))?;

    Ok(DeliveryItem {
        id: EntityId::from_string(row.try_get("id")?),
        sender_username: row.try_get("sender_username")?,
        sender_actor_id: row.try_get("sender_actor_id")?,
        target_inbox: row.try_get("target_inbox")?,
        activity,
        status,
        attempt_count: row.try_get::<i64, _>("attempt_count")? as u32,
        max_attempts: row.try_get::<i64, _>("max_attempts")? as u32,
        created_at: row.try_get("created_at")?,
        next_attempt_at: row.try_get("next_attempt_at")?,
        leased_until: row.try_get("leased_until")?,
        last_error: row.try_get("last_error")?,
    })
}

fn collection_from_row(row: &SqliteRow) -> Result<CollectionDefinition, AppError> {
    let type_str: String = row.try_get("collection_type")?;
    let collection_type = CollectionType::parse(&type_str).ok_or_else(|| {
        AppError::Internal(anyhow::anyhow!("unknown collection type: {type_str}"))
    })?;

    let visibility_str: String = row.try_get("visibility")?;
    let visibility = CollectionVisibility::parse(&visibility_str).ok_or_else(|| {
        AppError::Internal(anyhow::anyhow!("unknown visibility: {visibility_str}"))
    })?;

    let sort_str: String = row.try_get("sort_order")?;
    let sort_order = CollectionSortOrder::parse(&sort_str)
        .ok_or_else(|| AppError::Internal(anyhow::anyhow!("unknown sort order: {sort_str}")))?;

    let query_filter = match row.try_get::<Option<String>, _>("query_filter")? {
        Some(json) => Some(
            serde_json::from_str(&json)
                .map_err(|e| AppError::Internal(anyhow::anyhow!("corrupt query filter: {e}")))?,
        ),
        None => None,
    };

    Ok(CollectionDefinition {
        username: row.try_get("username")?,
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        description: row.try_get("description")?,
        collection_type,
        visibility,
        sort_order,
        max_items: row
            .try_get::<Option<i64>, _>("max_items")?
            .map(|n| n as u32),
        query_filter,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

impl Database {
    /// Connect to SQLite database
    ///
    /// Creates the database file if it doesn't exist.
    /// Runs pending migrations automatically.
    ///
    /// # Arguments
    /// * `path` - Path to SQLite database file
    ///
    /// # Errors
    /// Returns error if connection or migration fails
    pub async fn connect(path: &Path) -> Result<Self, AppError> {
        // Create parent directory if it doesn't exist
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| AppError::Database(sqlx::Error::Io(e)))?;
        }

        let connection_string = format!("sqlite:{}?mode=rwc", path.display());
        let pool = SqlitePool::connect(&connection_string).await?;

        sqlx::migrate!("./migrations").run(&pool).await.map_err(|e| {
            tracing::error!("Migration failed: {}", e);
            AppError::Internal(anyhow::anyhow!("Migration failed: {}", e))
        })?;

        tracing::info!("Database connected and migrated successfully");

        Ok(Self { pool })
    }

    // =========================================================================
    // Actor store
    // =========================================================================

    /// Insert a local actor.
    ///
    /// Fails if the username or actor id is already taken.
    pub async fn insert_actor(&self, actor: &Actor) -> Result<(), AppError> {
        let extensions = serde_json::to_string(&actor.extensions)
            .map_err(|e| AppError::Internal(anyhow::anyhow!("serialize extensions: {e}")))?;

        sqlx::query(
            r#"
            INSERT INTO actors (
                id, username, kind, display_name, summary,
                inbox, outbox, followers_url, following_url, shared_inbox,
                public_key_pem, private_key_pem, extensions, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
            "#,
        )
        .bind(&actor.id)
        .bind(&actor.username)
        .bind(actor.kind.as_str())
        .bind(&actor.display_name)
        .bind(&actor.summary)
        .bind(&actor.inbox)
        .bind(&actor.outbox)
        .bind(&actor.followers_url)
        .bind(&actor.following_url)
        .bind(&actor.shared_inbox)
        .bind(&actor.public_key_pem)
        .bind(&actor.private_key_pem)
        .bind(extensions)
        .bind(actor.created_at)
        .bind(actor.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Get a local actor by username
    pub async fn get_actor_by_username(&self, username: &str) -> Result<Option<Actor>, AppError> {
        let row = sqlx::query("SELECT * FROM actors WHERE username = ?1")
            .bind(username)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(actor_from_row).transpose()
    }

    /// Get a local actor by its URI
    pub async fn get_actor_by_id(&self, id: &str) -> Result<Option<Actor>, AppError> {
        let row = sqlx::query("SELECT * FROM actors WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(actor_from_row).transpose()
    }

    /// Update a local actor's mutable profile fields.
    ///
    /// Identity, endpoints, and key material are not touched here.
    pub async fn update_actor_profile(
        &self,
        username: &str,
        display_name: Option<&str>,
        summary: Option<&str>,
        extensions: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<(), AppError> {
        let extensions = serde_json::to_string(extensions)
            .map_err(|e| AppError::Internal(anyhow::anyhow!("serialize extensions: {e}")))?;

        let result = sqlx::query(
            r#"
            UPDATE actors
            SET display_name = COALESCE(?2, display_name),
                summary = COALESCE(?3, summary),
                extensions = ?4,
                updated_at = ?5
            WHERE username = ?1
            "#,
        )
        .bind(username)
        .bind(display_name)
        .bind(summary)
        .bind(extensions)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound);
        }

        Ok(())
    }

    /// Delete a local actor and everything it owns
    pub async fn delete_actor(&self, username: &str) -> Result<(), AppError> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query("DELETE FROM actors WHERE username = ?1")
            .bind(username)
            .execute(&mut *tx)
            .await?;
        if result.rows_affected() == 0 {
            return Err(AppError::NotFound);
        }

        for table in [
            "activities",
            "followers",
            "following",
            "collections",
            "collection_items",
            "blobs",
        ] {
            sqlx::query(&format!("DELETE FROM {table} WHERE username = ?1"))
                .bind(username)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    // =========================================================================
    // Activity streams
    // =========================================================================

    /// Append an activity to a stream.
    ///
    /// # Returns
    /// `true` if inserted, `false` if an activity with the same id was
    /// already present in that stream (idempotent no-op).
    pub async fn insert_activity(&self, record: &ActivityRecord) -> Result<bool, AppError> {
        let payload = serde_json::to_string(&record.payload)
            .map_err(|e| AppError::Internal(anyhow::anyhow!("serialize activity: {e}")))?;

        let result = sqlx::query(
            r#"
            INSERT INTO activities (
                id, username, stream, activity_id, activity_type,
                actor_id, object_id, in_reply_to, published, payload
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            ON CONFLICT (username, stream, activity_id) DO NOTHING
            "#,
        )
        .bind(&record.id.0)
        .bind(&record.username)
        .bind(record.stream.as_str())
        .bind(&record.activity_id)
        .bind(&record.activity_type)
        .bind(&record.actor_id)
        .bind(&record.object_id)
        .bind(&record.in_reply_to)
        .bind(record.published)
        .bind(payload)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Get one activity by its ActivityPub id within a stream
    pub async fn get_activity(
        &self,
        username: &str,
        stream: StreamKind,
        activity_id: &str,
    ) -> Result<Option<ActivityRecord>, AppError> {
        let row = sqlx::query(
            "SELECT * FROM activities WHERE username = ?1 AND stream = ?2 AND activity_id = ?3",
        )
        .bind(username)
        .bind(stream.as_str())
        .bind(activity_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(activity_from_row).transpose()
    }

    /// Page through a stream, newest first (row ids are monotonic)
    pub async fn get_stream_page(
        &self,
        username: &str,
        stream: StreamKind,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<ActivityRecord>, AppError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM activities
            WHERE username = ?1 AND stream = ?2
            ORDER BY id DESC
            LIMIT ?3 OFFSET ?4
            "#,
        )
        .bind(username)
        .bind(stream.as_str())
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(activity_from_row).collect()
    }

    /// Count activities in a stream
    pub async fn count_stream(&self, username: &str, stream: StreamKind) -> Result<i64, AppError> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM activities WHERE username = ?1 AND stream = ?2")
                .bind(username)
                .bind(stream.as_str())
                .fetch_one(&self.pool)
                .await?;

        Ok(count)
    }

    /// Full outbox scan, oldest first. Query collections are evaluated
    /// over this.
    pub async fn get_full_outbox(&self, username: &str) -> Result<Vec<ActivityRecord>, AppError> {
        let rows = sqlx::query(
            "SELECT * FROM activities WHERE username = ?1 AND stream = 'outbox' ORDER BY id ASC",
        )
        .bind(username)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(activity_from_row).collect()
    }

    /// Outbox activities of one envelope type, newest first
    /// (liked / shared relation collections)
    pub async fn get_outbox_by_type(
        &self,
        username: &str,
        activity_type: &str,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<ActivityRecord>, AppError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM activities
            WHERE username = ?1 AND stream = 'outbox' AND activity_type = ?2
            ORDER BY id DESC
            LIMIT ?3 OFFSET ?4
            "#,
        )
        .bind(username)
        .bind(activity_type)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(activity_from_row).collect()
    }

    /// Find the outbox activity that carries the given object id
    /// (usually a Create envelope)
    pub async fn find_outbox_activity_for_object(
        &self,
        username: &str,
        object_id: &str,
    ) -> Result<Option<ActivityRecord>, AppError> {
        let row = sqlx::query(
            r#"
            SELECT * FROM activities
            WHERE username = ?1 AND stream = 'outbox'
              AND (object_id = ?2 OR activity_id = ?2)
            ORDER BY id ASC
            LIMIT 1
            "#,
        )
        .bind(username)
        .bind(object_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(activity_from_row).transpose()
    }

    /// Activities whose object replies to the given object URI
    pub async fn find_replies(&self, object_id: &str) -> Result<Vec<ActivityRecord>, AppError> {
        let rows = sqlx::query("SELECT * FROM activities WHERE in_reply_to = ?1 ORDER BY id ASC")
            .bind(object_id)
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(activity_from_row).collect()
    }

    /// Activities of one type referencing the given object
    /// (Like / Announce reverse lookup)
    pub async fn find_activities_for_object(
        &self,
        activity_type: &str,
        object_id: &str,
    ) -> Result<Vec<ActivityRecord>, AppError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM activities
            WHERE activity_type = ?1 AND object_id = ?2
            ORDER BY id ASC
            "#,
        )
        .bind(activity_type)
        .bind(object_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(activity_from_row).collect()
    }

    // =========================================================================
    // Follow relations
    // =========================================================================

    /// Add a follower edge. Duplicate adds are idempotent no-ops.
    pub async fn add_follower(
        &self,
        username: &str,
        remote_actor_id: &str,
    ) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            INSERT INTO followers (id, username, remote_actor_id, created_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT (username, remote_actor_id) DO NOTHING
            "#,
        )
        .bind(EntityId::new().0)
        .bind(username)
        .bind(remote_actor_id)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Remove a follower edge. Removing a missing edge is a no-op.
    pub async fn remove_follower(
        &self,
        username: &str,
        remote_actor_id: &str,
    ) -> Result<bool, AppError> {
        let result =
            sqlx::query("DELETE FROM followers WHERE username = ?1 AND remote_actor_id = ?2")
                .bind(username)
                .bind(remote_actor_id)
                .execute(&self.pool)
                .await?;

        Ok(result.rows_affected() > 0)
    }

    /// All follower actor ids of a local actor, oldest first
    pub async fn get_followers(&self, username: &str) -> Result<Vec<String>, AppError> {
        let rows = sqlx::query_scalar::<_, String>(
            "SELECT remote_actor_id FROM followers WHERE username = ?1 ORDER BY id ASC",
        )
        .bind(username)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    pub async fn count_followers(&self, username: &str) -> Result<i64, AppError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM followers WHERE username = ?1")
            .bind(username)
            .fetch_one(&self.pool)
            .await?;

        Ok(count)
    }

    /// Add a following edge. Duplicate adds are idempotent no-ops.
    pub async fn add_following(
        &self,
        username: &str,
        remote_actor_id: &str,
    ) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            INSERT INTO following (id, username, remote_actor_id, created_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT (username, remote_actor_id) DO NOTHING
            "#,
        )
        .bind(EntityId::new().0)
        .bind(username)
        .bind(remote_actor_id)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn remove_following(
        &self,
        username: &str,
        remote_actor_id: &str,
    ) -> Result<bool, AppError> {
        let result =
            sqlx::query("DELETE FROM following WHERE username = ?1 AND remote_actor_id = ?2")
                .bind(username)
                .bind(remote_actor_id)
                .execute(&self.pool)
                .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn get_following(&self, username: &str) -> Result<Vec<String>, AppError> {
        let rows = sqlx::query_scalar::<_, String>(
            "SELECT remote_actor_id FROM following WHERE username = ?1 ORDER BY id ASC",
        )
        .bind(username)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    pub async fn count_following(&self, username: &str) -> Result<i64, AppError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM following WHERE username = ?1")
            .bind(username)
            .fetch_one(&self.pool)
            .await?;

        Ok(count)
    }

    // =========================================================================
    // Delivery queue
    // =========================================================================

    /// Append queue items in one batch
    pub async fn enqueue_delivery_items(&self, items: &[DeliveryItem]) -> Result<(), AppError> {
        if items.is_empty() {
            return Ok(());
        }

        let mut serialized = Vec::with_capacity(items.len());
        for item in items {
            serialized.push(
                serde_json::to_string(&item.activity)
                    .map_err(|e| AppError::Internal(anyhow::anyhow!("serialize activity: {e}")))?,
            );
        }

        let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(
            r#"
            INSERT INTO delivery_queue (
                id, sender_username, sender_actor_id, target_inbox, activity,
                status, attempt_count, max_attempts, created_at, next_attempt_at,
                leased_until, last_error
            ) "#,
        );

        builder.push_values(items.iter().zip(serialized.iter()), |mut b, (item, json)| {
            b.push_bind(&item.id.0)
                .push_bind(&item.sender_username)
                .push_bind(&item.sender_actor_id)
                .push_bind(&item.target_inbox)
                .push_bind(json.as_str())
                .push_bind(item.status.as_str())
                .push_bind(item.attempt_count as i64)
                .push_bind(item.max_attempts as i64)
                .push_bind(item.created_at)
                .push_bind(item.next_attempt_at)
                .push_bind(item.leased_until)
                .push_bind(&item.last_error);
        });

        builder.build().execute(&self.pool).await?;
        Ok(())
    }

    /// Atomically claim up to `batch_size` due PENDING items.
    ///
    /// Claimed items transition to PROCESSING with a lease; the claim
    /// runs in a single transaction so concurrent claimers never share
    /// an item.
    pub async fn claim_delivery_batch(
        &self,
        now: DateTime<Utc>,
        batch_size: u32,
        leased_until: DateTime<Utc>,
    ) -> Result<Vec<DeliveryItem>, AppError> {
        let mut tx = self.pool.begin().await?;

        let ids: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT id FROM delivery_queue
            WHERE status = 'PENDING' AND next_attempt_at <= ?1
            ORDER BY next_attempt_at ASC, id ASC
            LIMIT ?2
            "#,
        )
        .bind(now)
        .bind(batch_size)
        .fetch_all(&mut *tx)
        .await?;

        if ids.is_empty() {
            tx.commit().await?;
            return Ok(Vec::new());
        }

        let mut update: QueryBuilder<Sqlite> =
            QueryBuilder::new("UPDATE delivery_queue SET status = 'PROCESSING', leased_until = ");
        update.push_bind(leased_until);
        update.push(" WHERE status = 'PENDING' AND id IN (");
        {
            let mut separated = update.separated(", ");
            for id in &ids {
                separated.push_bind(id);
            }
        }
        update.push(")");
        update.build().execute(&mut *tx).await?;

        let mut select: QueryBuilder<Sqlite> =
            QueryBuilder::new("SELECT * FROM delivery_queue WHERE id IN (");
        {
            let mut separated = select.separated(", ");
            for id in &ids {
                separated.push_bind(id);
            }
        }
        select.push(") ORDER BY id ASC");
        let rows = select.build().fetch_all(&mut *tx).await?;

        tx.commit().await?;

        rows.iter().map(delivery_item_from_row).collect()
    }

    /// Revert PROCESSING items whose lease expired back to PENDING.
    ///
    /// # Returns
    /// Number of recovered items.
    pub async fn release_expired_leases(&self, now: DateTime<Utc>) -> Result<u64, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE delivery_queue
            SET status = 'PENDING', leased_until = NULL
            WHERE status = 'PROCESSING' AND leased_until IS NOT NULL AND leased_until <= ?1
            "#,
        )
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Mark an item DELIVERED
    pub async fn mark_delivered(&self, id: &EntityId) -> Result<(), AppError> {
        sqlx::query(
            r#"
            UPDATE delivery_queue
            SET status = 'DELIVERED', leased_until = NULL, last_error = NULL
            WHERE id = ?1
            "#,
        )
        .bind(&id.0)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Record a failed attempt: increments the attempt counter and
    /// stores the error, leaving the item FAILED for the retry policy.
    pub async fn mark_failed(&self, id: &EntityId, error: &str) -> Result<DeliveryItem, AppError> {
        sqlx::query(
            r#"
            UPDATE delivery_queue
            SET status = 'FAILED',
                leased_until = NULL,
                attempt_count = attempt_count + 1,
                last_error = ?2
            WHERE id = ?1
            "#,
        )
        .bind(&id.0)
        .bind(error)
        .execute(&self.pool)
        .await?;

        self.get_delivery_item(id)
            .await?
            .ok_or(AppError::NotFound)
    }

    /// FAILED -> PENDING with a future attempt time
    pub async fn schedule_retry(
        &self,
        id: &EntityId,
        next_attempt_at: DateTime<Utc>,
    ) -> Result<(), AppError> {
        sqlx::query(
            r#"
            UPDATE delivery_queue
            SET status = 'PENDING', next_attempt_at = ?2
            WHERE id = ?1 AND status = 'FAILED'
            "#,
        )
        .bind(&id.0)
        .bind(next_attempt_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// FAILED -> DEAD, terminal
    pub async fn mark_dead(&self, id: &EntityId) -> Result<(), AppError> {
        sqlx::query("UPDATE delivery_queue SET status = 'DEAD' WHERE id = ?1 AND status = 'FAILED'")
            .bind(&id.0)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Purge DELIVERED and DEAD items created before the cutoff
    pub async fn purge_finished_deliveries(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, AppError> {
        let result = sqlx::query(
            "DELETE FROM delivery_queue WHERE status IN ('DELIVERED', 'DEAD') AND created_at <= ?1",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Get one queue item
    pub async fn get_delivery_item(
        &self,
        id: &EntityId,
    ) -> Result<Option<DeliveryItem>, AppError> {
        let row = sqlx::query("SELECT * FROM delivery_queue WHERE id = ?1")
            .bind(&id.0)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(delivery_item_from_row).transpose()
    }

    /// All queue items for a sender, oldest first (tests and operator views)
    pub async fn get_delivery_items_for_sender(
        &self,
        sender_username: &str,
    ) -> Result<Vec<DeliveryItem>, AppError> {
        let rows =
            sqlx::query("SELECT * FROM delivery_queue WHERE sender_username = ?1 ORDER BY id ASC")
                .bind(sender_username)
                .fetch_all(&self.pool)
                .await?;

        rows.iter().map(delivery_item_from_row).collect()
    }

    /// Queue item counts per status
    pub async fn delivery_queue_stats(&self) -> Result<DeliveryQueueStats, AppError> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM delivery_queue GROUP BY status")
            .fetch_all(&self.pool)
            .await?;

        let mut stats = DeliveryQueueStats::default();
        for row in rows {
            let status: String = row.try_get("status")?;
            let n: i64 = row.try_get("n")?;
            match status.as_str() {
                "PENDING" => stats.pending = n,
                "PROCESSING" => stats.processing = n,
                "DELIVERED" => stats.delivered = n,
                "FAILED" => stats.failed = n,
                "DEAD" => stats.dead = n,
                _ => {}
            }
        }

        Ok(stats)
    }

    // =========================================================================
    // Collection store
    // =========================================================================

    /// Insert a collection definition
    pub async fn insert_collection(
        &self,
        definition: &CollectionDefinition,
    ) -> Result<(), AppError> {
        let filter = definition
            .query_filter
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| AppError::Internal(anyhow::anyhow!("serialize query filter: {e}")))?;

        sqlx::query(
            r#"
            INSERT INTO collections (
                username, id, name, description, collection_type,
                visibility, sort_order, max_items, query_filter,
                created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            "#,
        )
        .bind(&definition.username)
        .bind(&definition.id)
        .bind(&definition.name)
        .bind(&definition.description)
        .bind(definition.collection_type.as_str())
        .bind(definition.visibility.as_str())
        .bind(definition.sort_order.as_str())
        .bind(definition.max_items.map(|n| n as i64))
        .bind(filter)
        .bind(definition.created_at)
        .bind(definition.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Update a collection definition's mutable fields
    pub async fn update_collection(
        &self,
        definition: &CollectionDefinition,
    ) -> Result<(), AppError> {
        let filter = definition
            .query_filter
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| AppError::Internal(anyhow::anyhow!("serialize query filter: {e}")))?;

        let result = sqlx::query(
            r#"
            UPDATE collections
            SET name = ?3, description = ?4, visibility = ?5,
                sort_order = ?6, max_items = ?7, query_filter = ?8, updated_at = ?9
            WHERE username = ?1 AND id = ?2
            "#,
        )
        .bind(&definition.username)
        .bind(&definition.id)
        .bind(&definition.name)
        .bind(&definition.description)
        .bind(definition.visibility.as_str())
        .bind(definition.sort_order.as_str())
        .bind(definition.max_items.map(|n| n as i64))
        .bind(filter)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound);
        }

        Ok(())
    }

    /// Delete a collection and its member list
    pub async fn delete_collection(&self, username: &str, id: &str) -> Result<(), AppError> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query("DELETE FROM collections WHERE username = ?1 AND id = ?2")
            .bind(username)
            .bind(id)
            .execute(&mut *tx)
            .await?;
        if result.rows_affected() == 0 {
            return Err(AppError::NotFound);
        }

        sqlx::query("DELETE FROM collection_items WHERE username = ?1 AND collection_id = ?2")
            .bind(username)
            .bind(id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    pub async fn get_collection(
        &self,
        username: &str,
        id: &str,
    ) -> Result<Option<CollectionDefinition>, AppError> {
        let row = sqlx::query("SELECT * FROM collections WHERE username = ?1 AND id = ?2")
            .bind(username)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(collection_from_row).transpose()
    }

    /// All collection definitions owned by an actor
    pub async fn list_collections(
        &self,
        username: &str,
    ) -> Result<Vec<CollectionDefinition>, AppError> {
        let rows = sqlx::query("SELECT * FROM collections WHERE username = ?1 ORDER BY id ASC")
            .bind(username)
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(collection_from_row).collect()
    }

    /// Append an item to a MANUAL collection's member list.
    ///
    /// Duplicate item ids are idempotent no-ops; `max_items` is
    /// enforced here.
    pub async fn add_collection_item(
        &self,
        username: &str,
        collection_id: &str,
        item_id: &str,
        max_items: Option<u32>,
    ) -> Result<bool, AppError> {
        let mut tx = self.pool.begin().await?;

        if let Some(max) = max_items {
            let count: i64 = sqlx::query_scalar(
                "SELECT COUNT(*) FROM collection_items WHERE username = ?1 AND collection_id = ?2",
            )
            .bind(username)
            .bind(collection_id)
            .fetch_one(&mut *tx)
            .await?;

            if count >= i64::from(max) {
                tx.commit().await?;
                return Err(AppError::Unprocessable(format!(
                    "collection {collection_id} is full ({max} items)"
                )));
            }
        }

        let next_position: i64 = sqlx::query_scalar(
            r#"
            SELECT COALESCE(MAX(position), -1) + 1 FROM collection_items
            WHERE username = ?1 AND collection_id = ?2
            "#,
        )
        .bind(username)
        .bind(collection_id)
        .fetch_one(&mut *tx)
        .await?;

        let result = sqlx::query(
            r#"
            INSERT INTO collection_items (username, collection_id, position, item_id, added_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT (username, collection_id, item_id) DO NOTHING
            "#,
        )
        .bind(username)
        .bind(collection_id)
        .bind(next_position)
        .bind(item_id)
        .bind(Utc::now())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(result.rows_affected() > 0)
    }

    /// Remove an item from a MANUAL collection's member list
    pub async fn remove_collection_item(
        &self,
        username: &str,
        collection_id: &str,
        item_id: &str,
    ) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            DELETE FROM collection_items
            WHERE username = ?1 AND collection_id = ?2 AND item_id = ?3
            "#,
        )
        .bind(username)
        .bind(collection_id)
        .bind(item_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Member list of a MANUAL collection in insertion order
    pub async fn get_collection_items(
        &self,
        username: &str,
        collection_id: &str,
    ) -> Result<Vec<CollectionItem>, AppError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM collection_items
            WHERE username = ?1 AND collection_id = ?2
            ORDER BY position ASC
            "#,
        )
        .bind(username)
        .bind(collection_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(CollectionItem {
                    username: row.try_get("username")?,
                    collection_id: row.try_get("collection_id")?,
                    position: row.try_get("position")?,
                    item_id: row.try_get("item_id")?,
                    added_at: row.try_get("added_at")?,
                })
            })
            .collect()
    }

    pub async fn count_collection_items(
        &self,
        username: &str,
        collection_id: &str,
    ) -> Result<i64, AppError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM collection_items WHERE username = ?1 AND collection_id = ?2",
        )
        .bind(username)
        .bind(collection_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(count)
    }

    // =========================================================================
    // Blob store
    // =========================================================================

    /// Store a blob
    pub async fn insert_blob(&self, blob: &Blob) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO blobs (username, id, content_type, data, source_url, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
        )
        .bind(&blob.username)
        .bind(&blob.id)
        .bind(&blob.content_type)
        .bind(&blob.data)
        .bind(&blob.source_url)
        .bind(blob.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Fetch a blob by owner and id
    pub async fn get_blob(&self, username: &str, id: &str) -> Result<Option<Blob>, AppError> {
        let row = sqlx::query("SELECT * FROM blobs WHERE username = ?1 AND id = ?2")
            .bind(username)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|row| {
            Ok(Blob {
                username: row.try_get("username")?,
                id: row.try_get("id")?,
                content_type: row.try_get("content_type")?,
                data: row.try_get("data")?,
                source_url: row.try_get("source_url")?,
                created_at: row.try_get("created_at")?,
            })
        })
        .transpose()
    }

    /// Blob id previously mirrored from a remote URL, if any.
    /// Lets repeated deliveries of the same attachment reuse one blob.
    pub async fn find_blob_by_source(
        &self,
        username: &str,
        source_url: &str,
    ) -> Result<Option<String>, AppError> {
        let id = sqlx::query_scalar::<_, String>(
            "SELECT id FROM blobs WHERE username = ?1 AND source_url = ?2 LIMIT 1",
        )
        .bind(username)
        .bind(source_url)
        .fetch_optional(&self.pool)
        .await?;

        Ok(id)
    }
}
