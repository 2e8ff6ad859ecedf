//! Activity delivery
//!
//! Durable fan-out of outbound activities: the enqueue path resolves
//! recipients into unique target inboxes and appends PENDING queue
//! items; a single background worker claims due items, signs and ships
//! them with bounded concurrency, and applies the retry policy until
//! an item is DELIVERED or DEAD.

use chrono::Utc;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;

use crate::config::{DeliveryConfig, FederationConfig};
use crate::data::{Actor, Database, DeliveryItem, DeliveryStatus, EntityId};
use crate::error::AppError;
use crate::identity::SystemIdentity;
use crate::metrics::{DELIVERY_ATTEMPTS_TOTAL, DELIVERY_DURATION_SECONDS, DELIVERY_QUEUE_DEPTH};

/// The public addressing collection
pub const PUBLIC_AUDIENCE: &str = "https://www.w3.org/ns/activitystreams#Public";

/// Activity types delivered to the target's inbox when no explicit
/// audience is present
const DIRECTED_TYPES: [&str; 6] = ["Follow", "Like", "Announce", "Accept", "Reject", "Undo"];

/// Wait before the next attempt, indexed by the number of attempts
/// already made: 1 min, 5 min, 15 min, 1 h, 4 h.
const BACKOFF_SCHEDULE_SECS: [u64; 5] = [60, 300, 900, 3600, 14400];

/// Backoff before the next attempt after `attempt_count` failures
pub fn retry_backoff(attempt_count: u32) -> Duration {
    let index = (attempt_count.max(1) as usize - 1).min(BACKOFF_SCHEDULE_SECS.len() - 1);
    Duration::from_secs(BACKOFF_SCHEDULE_SECS[index])
}

/// How the recipients of an outbound activity are determined
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoutingMode {
    /// The actor named by the activity's object
    Target,
    /// The explicit `to`/`cc`/`bcc`/`bto`/`audience` fields
    Recipients,
    /// The sender's follower set
    Followers,
}

impl RoutingMode {
    /// Pick the routing mode for an activity:
    /// explicit recipients win, directed types fall back to their
    /// target, everything else goes to followers.
    pub fn for_activity(activity: &serde_json::Value) -> Self {
        if !explicit_recipients(activity).is_empty() {
            return Self::Recipients;
        }

        let activity_type = activity.get("type").and_then(|t| t.as_str()).unwrap_or("");
        if DIRECTED_TYPES.contains(&activity_type) {
            return Self::Target;
        }

        Self::Followers
    }
}

/// Collect the explicit audience fields of an activity, in order,
/// without duplicates. The public pseudo-collection is not a
/// deliverable recipient and is dropped here.
pub fn explicit_recipients(activity: &serde_json::Value) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut recipients = Vec::new();

    for field in ["to", "cc", "bcc", "bto", "audience"] {
        let Some(value) = activity.get(field) else {
            continue;
        };

        let entries: Vec<&str> = match value {
            serde_json::Value::String(s) => vec![s.as_str()],
            serde_json::Value::Array(items) => {
                items.iter().filter_map(|v| v.as_str()).collect()
            }
            _ => Vec::new(),
        };

        for entry in entries {
            if entry == PUBLIC_AUDIENCE || entry == "as:Public" || entry == "Public" {
                continue;
            }
            if seen.insert(entry.to_string()) {
                recipients.push(entry.to_string());
            }
        }
    }

    recipients
}

/// Extract the actor a directed activity is aimed at
pub fn target_actor_id(activity: &serde_json::Value) -> Option<String> {
    let object = activity.get("object")?;

    if let Some(uri) = object.as_str() {
        return Some(uri.to_string());
    }

    object
        .get("actor")
        .and_then(|a| a.as_str())
        .or_else(|| object.get("attributedTo").and_then(|a| a.as_str()))
        .or_else(|| object.get("id").and_then(|a| a.as_str()))
        .map(str::to_string)
}

/// Fetch a remote actor document with a system-actor-signed GET
pub async fn fetch_remote_actor(
    http_client: &reqwest::Client,
    signer: &SystemIdentity,
    actor_id: &str,
    timeout: Duration,
) -> Result<serde_json::Value, AppError> {
    let sig_headers = super::signature::sign_request(
        "GET",
        actor_id,
        None,
        &signer.private_key_pem,
        &signer.key_id,
    )?;

    let response = http_client
        .get(actor_id)
        .timeout(timeout)
        .header("Accept", "application/activity+json")
        .header("Date", sig_headers.date)
        .header("Host", sig_headers.host)
        .header("Signature", sig_headers.signature)
        .send()
        .await
        .map_err(|e| AppError::Federation(format!("Failed to fetch actor {actor_id}: {e}")))?;

    if !response.status().is_success() {
        return Err(AppError::Federation(format!(
            "Actor fetch {actor_id} returned HTTP {}",
            response.status()
        )));
    }

    response
        .json()
        .await
        .map_err(|e| AppError::Federation(format!("Failed to parse actor {actor_id}: {e}")))
}

/// Pick the delivery inbox from an actor document:
/// `endpoints.sharedInbox` when present, the per-actor inbox otherwise.
fn inbox_from_actor_document(actor: &serde_json::Value) -> Option<String> {
    if let Some(shared) = actor
        .get("endpoints")
        .and_then(|e| e.get("sharedInbox"))
        .and_then(|s| s.as_str())
    {
        return Some(shared.to_string());
    }

    actor
        .get("inbox")
        .and_then(|i| i.as_str())
        .map(str::to_string)
}

/// Enqueue side of the delivery engine.
///
/// Resolves recipients to unique inbox URLs and durably appends queue
/// items; the worker picks them up from there.
#[derive(Clone)]
pub struct DeliveryEngine {
    db: Arc<Database>,
    http_client: Arc<reqwest::Client>,
    signer: Arc<SystemIdentity>,
    /// Base URL including the route prefix; ids starting here are local
    base_url: String,
    request_timeout: Duration,
    max_attempts: u32,
}

impl DeliveryEngine {
    pub fn new(
        db: Arc<Database>,
        http_client: Arc<reqwest::Client>,
        signer: Arc<SystemIdentity>,
        base_url: String,
        federation: &FederationConfig,
        delivery: &DeliveryConfig,
    ) -> Self {
        Self {
            db,
            http_client,
            signer,
            base_url,
            request_timeout: Duration::from_secs(federation.request_timeout_seconds),
            max_attempts: delivery.max_attempts,
        }
    }

    /// Fan an activity out to its recipients' inboxes.
    ///
    /// One PENDING queue item is appended per unique inbox URL;
    /// recipients whose profiles expose the same `sharedInbox` collapse
    /// into a single item. Per-recipient resolution failures are logged
    /// and skipped without affecting the rest.
    ///
    /// # Returns
    /// Number of queue items appended.
    pub async fn enqueue(
        &self,
        sender: &Actor,
        activity: &serde_json::Value,
        mode: RoutingMode,
    ) -> Result<usize, AppError> {
        let recipients = self.resolve_recipient_ids(sender, activity, mode).await?;

        let mut seen_inboxes = HashSet::new();
        let mut items = Vec::new();
        let now = Utc::now();

        for recipient_id in recipients {
            let inbox = match self.resolve_recipient_inbox(&recipient_id).await {
                Ok(inbox) => inbox,
                Err(error) => {
                    tracing::warn!(
                        recipient = %recipient_id,
                        %error,
                        "Skipping undeliverable recipient"
                    );
                    continue;
                }
            };

            if !seen_inboxes.insert(inbox.clone()) {
                continue;
            }

            items.push(DeliveryItem {
                id: EntityId::new(),
                sender_username: sender.username.clone(),
                sender_actor_id: sender.id.clone(),
                target_inbox: inbox,
                activity: activity.clone(),
                status: DeliveryStatus::Pending,
                attempt_count: 0,
                max_attempts: self.max_attempts,
                created_at: now,
                next_attempt_at: now,
                leased_until: None,
                last_error: None,
            });
        }

        self.db.enqueue_delivery_items(&items).await?;

        tracing::info!(
            sender = %sender.username,
            items = items.len(),
            "Enqueued delivery items"
        );

        Ok(items.len())
    }

    /// Resolve a routing mode into recipient actor ids
    async fn resolve_recipient_ids(
        &self,
        sender: &Actor,
        activity: &serde_json::Value,
        mode: RoutingMode,
    ) -> Result<Vec<String>, AppError> {
        match mode {
            RoutingMode::Followers => self.db.get_followers(&sender.username).await,
            RoutingMode::Target => Ok(target_actor_id(activity).into_iter().collect()),
            RoutingMode::Recipients => {
                let mut resolved = Vec::new();
                let mut seen = HashSet::new();

                for recipient in explicit_recipients(activity) {
                    // The sender's own followers collection expands
                    // to the follower set
                    if recipient == sender.followers_url {
                        for follower in self.db.get_followers(&sender.username).await? {
                            if seen.insert(follower.clone()) {
                                resolved.push(follower);
                            }
                        }
                        continue;
                    }

                    if recipient == sender.id {
                        continue;
                    }

                    if seen.insert(recipient.clone()) {
                        resolved.push(recipient);
                    }
                }

                Ok(resolved)
            }
        }
    }

    /// Resolve a recipient actor id to its delivery inbox URL.
    ///
    /// Local actors are looked up directly; remote profiles are fetched
    /// with an authenticated GET. A `user@domain` address goes through
    /// WebFinger first.
    async fn resolve_recipient_inbox(&self, recipient_id: &str) -> Result<String, AppError> {
        if !recipient_id.starts_with("http://") && !recipient_id.starts_with("https://") {
            let resolved =
                super::webfinger::resolve_webfinger(recipient_id, &self.http_client).await?;
            return Box::pin(self.resolve_recipient_inbox(&resolved.actor_uri)).await;
        }

        if recipient_id.starts_with(&self.base_url) {
            let actor = self
                .db
                .get_actor_by_id(recipient_id)
                .await?
                .ok_or_else(|| {
                    AppError::Federation(format!("Unknown local recipient: {recipient_id}"))
                })?;
            return Ok(actor.shared_inbox.unwrap_or(actor.inbox));
        }

        let document = fetch_remote_actor(
            &self.http_client,
            &self.signer,
            recipient_id,
            self.request_timeout,
        )
        .await?;

        inbox_from_actor_document(&document).ok_or_else(|| {
            AppError::Federation(format!("Actor {recipient_id} exposes no inbox"))
        })
    }
}

/// Background delivery worker.
///
/// A single long-running task; per-delivery sub-tasks are bounded by a
/// semaphore of width `concurrency`.
pub struct DeliveryWorker {
    db: Arc<Database>,
    http_client: Arc<reqwest::Client>,
    config: DeliveryConfig,
    request_timeout: Duration,
}

impl DeliveryWorker {
    pub fn new(
        db: Arc<Database>,
        http_client: Arc<reqwest::Client>,
        config: DeliveryConfig,
        federation: &FederationConfig,
    ) -> Self {
        Self {
            db,
            http_client,
            request_timeout: Duration::from_secs(federation.request_timeout_seconds),
            config,
        }
    }

    /// Spawn the worker loop.
    ///
    /// The worker stops claiming new items once the shutdown signal
    /// flips; in-flight deliveries run to completion or deadline.
    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            self.run(shutdown).await;
        })
    }

    async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut tick =
            tokio::time::interval(Duration::from_secs(self.config.processing_interval_seconds));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let mut last_cleanup = tokio::time::Instant::now();
        let cleanup_interval = Duration::from_secs(self.config.cleanup_interval_seconds);

        tracing::info!(
            interval_secs = self.config.processing_interval_seconds,
            batch_size = self.config.batch_size,
            concurrency = self.config.concurrency,
            "Delivery worker started"
        );

        loop {
            tokio::select! {
                _ = tick.tick() => {
                    if let Err(error) = self.process_batch().await {
                        tracing::error!(%error, "Delivery tick failed");
                    }

                    if last_cleanup.elapsed() >= cleanup_interval {
                        last_cleanup = tokio::time::Instant::now();
                        if let Err(error) = self.cleanup().await {
                            tracing::error!(%error, "Delivery cleanup failed");
                        }
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        tracing::info!("Delivery worker shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// One worker tick: recover stale leases, claim due items, deliver
    /// with bounded concurrency. Per-item failures never fail the tick.
    async fn process_batch(&self) -> Result<usize, AppError> {
        let now = Utc::now();

        let recovered = self.db.release_expired_leases(now).await?;
        if recovered > 0 {
            tracing::warn!(count = recovered, "Recovered items from expired leases");
        }

        let leased_until = now + chrono::Duration::seconds(self.config.lease_seconds as i64);
        let items = self
            .db
            .claim_delivery_batch(now, self.config.batch_size, leased_until)
            .await?;

        if items.is_empty() {
            return Ok(0);
        }

        tracing::debug!(count = items.len(), "Claimed delivery batch");

        let semaphore = Arc::new(Semaphore::new(self.config.concurrency));
        let mut tasks = Vec::with_capacity(items.len());

        for item in items {
            let semaphore = Arc::clone(&semaphore);
            let db = Arc::clone(&self.db);
            let http_client = Arc::clone(&self.http_client);
            let request_timeout = self.request_timeout;

            tasks.push(tokio::spawn(async move {
                let Ok(_permit) = semaphore.acquire().await else {
                    return;
                };
                deliver_one(&db, &http_client, item, request_timeout).await;
            }));
        }

        let count = tasks.len();
        for result in futures::future::join_all(tasks).await {
            if let Err(error) = result {
                tracing::error!(%error, "Delivery task panicked");
            }
        }

        self.update_queue_gauges().await;

        Ok(count)
    }

    /// Purge DELIVERED and DEAD items past the retention window
    async fn cleanup(&self) -> Result<(), AppError> {
        let cutoff = Utc::now() - chrono::Duration::days(self.config.retention_days as i64);
        let purged = self.db.purge_finished_deliveries(cutoff).await?;
        if purged > 0 {
            tracing::info!(count = purged, "Purged finished delivery items");
        }
        Ok(())
    }

    async fn update_queue_gauges(&self) {
        if let Ok(stats) = self.db.delivery_queue_stats().await {
            DELIVERY_QUEUE_DEPTH
                .with_label_values(&["PENDING"])
                .set(stats.pending);
            DELIVERY_QUEUE_DEPTH
                .with_label_values(&["PROCESSING"])
                .set(stats.processing);
            DELIVERY_QUEUE_DEPTH
                .with_label_values(&["FAILED"])
                .set(stats.failed);
            DELIVERY_QUEUE_DEPTH
                .with_label_values(&["DEAD"])
                .set(stats.dead);
        }
    }
}

/// Deliver one claimed item and record the outcome.
async fn deliver_one(
    db: &Database,
    http_client: &reqwest::Client,
    item: DeliveryItem,
    request_timeout: Duration,
) {
    let timer = std::time::Instant::now();

    match attempt_delivery(db, http_client, &item, request_timeout).await {
        Ok(()) => {
            DELIVERY_ATTEMPTS_TOTAL
                .with_label_values(&["delivered"])
                .inc();
            DELIVERY_DURATION_SECONDS
                .with_label_values(&["delivered"])
                .observe(timer.elapsed().as_secs_f64());

            if let Err(error) = db.mark_delivered(&item.id).await {
                tracing::error!(item = %item.id, %error, "Failed to record delivery");
            } else {
                tracing::info!(
                    item = %item.id,
                    inbox = %item.target_inbox,
                    "Delivered activity"
                );
            }
        }
        Err(error) => {
            DELIVERY_ATTEMPTS_TOTAL.with_label_values(&["failed"]).inc();
            DELIVERY_DURATION_SECONDS
                .with_label_values(&["failed"])
                .observe(timer.elapsed().as_secs_f64());

            if let Err(record_error) =
                record_failure(db, &item.id, &error.to_string()).await
            {
                tracing::error!(item = %item.id, error = %record_error, "Failed to record delivery failure");
            }
        }
    }
}

/// Record a failed attempt and apply the retry policy:
/// FAILED -> PENDING with backoff while attempts remain, DEAD after.
async fn record_failure(db: &Database, id: &EntityId, error: &str) -> Result<(), AppError> {
    let failed = db.mark_failed(id, error).await?;

    if failed.attempt_count >= failed.max_attempts {
        db.mark_dead(id).await?;
        DELIVERY_ATTEMPTS_TOTAL.with_label_values(&["dead"]).inc();
        tracing::warn!(
            item = %id,
            inbox = %failed.target_inbox,
            attempts = failed.attempt_count,
            error,
            "Delivery dead-lettered"
        );
    } else {
        let wait = retry_backoff(failed.attempt_count);
        let next_attempt_at = Utc::now() + chrono::Duration::seconds(wait.as_secs() as i64);
        db.schedule_retry(id, next_attempt_at).await?;
        tracing::info!(
            item = %id,
            inbox = %failed.target_inbox,
            attempt = failed.attempt_count,
            retry_in_secs = wait.as_secs(),
            error,
            "Delivery failed, retry scheduled"
        );
    }

    Ok(())
}

/// Execute one signed POST to the target inbox.
async fn attempt_delivery(
    db: &Database,
    http_client: &reqwest::Client,
    item: &DeliveryItem,
    request_timeout: Duration,
) -> Result<(), AppError> {
    // 1. Load sender and signing key
    let sender = db
        .get_actor_by_username(&item.sender_username)
        .await?
        .ok_or_else(|| {
            AppError::Federation(format!("Unknown sender: {}", item.sender_username))
        })?;

    let private_key_pem = sender
        .private_key_pem
        .as_deref()
        .ok_or_else(|| AppError::Federation("no private key".to_string()))?;

    // 2. Serialize activity (field order is preserved)
    let body = serde_json::to_vec(&item.activity)
        .map_err(|e| AppError::Validation(format!("Failed to serialize activity: {}", e)))?;

    // 3-4. Sign the request
    let sig_headers = super::signature::sign_request(
        "POST",
        &item.target_inbox,
        Some(&body),
        private_key_pem,
        &sender.key_id(),
    )?;

    // 5. POST to the inbox with the signed headers
    let mut request = http_client
        .post(&item.target_inbox)
        .timeout(request_timeout)
        .header("Content-Type", "application/activity+json")
        .header("Date", sig_headers.date)
        .header("Host", sig_headers.host)
        .header("Signature", sig_headers.signature);

    if let Some(digest) = sig_headers.digest {
        request = request.header("Digest", digest);
    }

    let response = request.body(body).send().await.map_err(|e| {
        AppError::Federation(format!("Failed to deliver to {}: {}", item.target_inbox, e))
    })?;

    // 6. 2xx is delivered, anything else goes through the retry policy
    if !response.status().is_success() {
        return Err(AppError::Federation(format!(
            "Inbox {} rejected activity: HTTP {}",
            item.target_inbox,
            response.status()
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn retry_backoff_follows_schedule() {
        assert_eq!(retry_backoff(1), Duration::from_secs(60));
        assert_eq!(retry_backoff(2), Duration::from_secs(300));
        assert_eq!(retry_backoff(3), Duration::from_secs(900));
        assert_eq!(retry_backoff(4), Duration::from_secs(3600));
        assert_eq!(retry_backoff(5), Duration::from_secs(14400));
        // Past the schedule the last step holds
        assert_eq!(retry_backoff(9), Duration::from_secs(14400));
    }

    #[test]
    fn explicit_recipients_collects_all_audience_fields() {
        let activity = json!({
            "type": "Create",
            "to": ["https://a.example/users/x", PUBLIC_AUDIENCE],
            "cc": "https://b.example/users/y",
            "bto": ["https://a.example/users/x"],
            "audience": ["https://c.example/groups/z"]
        });

        assert_eq!(
            explicit_recipients(&activity),
            vec![
                "https://a.example/users/x",
                "https://b.example/users/y",
                "https://c.example/groups/z",
            ]
        );
    }

    #[test]
    fn explicit_recipients_drops_public_pseudo_collection() {
        let activity = json!({
            "type": "Create",
            "to": [PUBLIC_AUDIENCE],
        });
        assert!(explicit_recipients(&activity).is_empty());
    }

    #[test]
    fn routing_mode_prefers_explicit_recipients() {
        let activity = json!({
            "type": "Follow",
            "to": ["https://a.example/users/x"],
            "object": "https://b.example/users/y"
        });
        assert_eq!(
            RoutingMode::for_activity(&activity),
            RoutingMode::Recipients
        );
    }

    #[test]
    fn routing_mode_directs_follow_without_audience() {
        let activity = json!({
            "type": "Follow",
            "object": "https://b.example/users/y"
        });
        assert_eq!(RoutingMode::for_activity(&activity), RoutingMode::Target);
    }

    #[test]
    fn routing_mode_defaults_to_followers() {
        let activity = json!({
            "type": "Create",
            "object": {"type": "Note", "content": "hi"}
        });
        assert_eq!(RoutingMode::for_activity(&activity), RoutingMode::Followers);
    }

    #[test]
    fn target_actor_id_handles_string_and_embedded_objects() {
        assert_eq!(
            target_actor_id(&json!({"object": "https://b.example/users/y"})),
            Some("https://b.example/users/y".to_string())
        );
        assert_eq!(
            target_actor_id(&json!({
                "object": {"type": "Follow", "actor": "https://b.example/users/y"}
            })),
            Some("https://b.example/users/y".to_string())
        );
        assert_eq!(
            target_actor_id(&json!({
                "object": {"type": "Note", "attributedTo": "https://c.example/users/z"}
            })),
            Some("https://c.example/users/z".to_string())
        );
        assert_eq!(target_actor_id(&json!({"type": "Follow"})), None);
    }

    #[test]
    fn shared_inbox_is_preferred_over_personal_inbox() {
        let with_shared = json!({
            "inbox": "https://a.example/users/x/inbox",
            "endpoints": {"sharedInbox": "https://a.example/inbox"}
        });
        assert_eq!(
            inbox_from_actor_document(&with_shared),
            Some("https://a.example/inbox".to_string())
        );

        let without_shared = json!({"inbox": "https://a.example/users/x/inbox"});
        assert_eq!(
            inbox_from_actor_document(&without_shared),
            Some("https://a.example/users/x/inbox".to_string())
        );
    }
}
