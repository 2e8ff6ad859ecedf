//! Media blob storage
//!
//! Remote attachments referenced by incoming activities are mirrored
//! into the blob store and re-served under local media URLs.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;

use crate::data::{Blob, Database, EntityId};
use crate::error::AppError;

/// Blob store facade over the database, plus the local URL builder.
#[derive(Clone)]
pub struct MediaStore {
    db: Arc<Database>,
    http_client: Arc<reqwest::Client>,
    /// Base URL including the route prefix
    base_url: String,
    /// Per-attachment download deadline
    fetch_timeout: Duration,
}

impl MediaStore {
    pub fn new(
        db: Arc<Database>,
        http_client: Arc<reqwest::Client>,
        base_url: String,
        fetch_timeout: Duration,
    ) -> Self {
        Self {
            db,
            http_client,
            base_url,
            fetch_timeout,
        }
    }

    /// Local URL a stored blob is served under
    pub fn blob_url(&self, username: &str, blob_id: &str) -> String {
        format!("{}/users/{}/media/{}", self.base_url, username, blob_id)
    }

    /// Whether a URL already points into this server's media space
    pub fn is_local_url(&self, url: &str) -> bool {
        url.starts_with(&self.base_url)
    }

    /// Mirror a remote attachment URL into the blob store.
    ///
    /// Re-mirroring the same source URL reuses the existing blob.
    ///
    /// # Returns
    /// The local blob URL.
    pub async fn mirror_remote(&self, username: &str, url: &str) -> Result<String, AppError> {
        if let Some(existing) = self.db.find_blob_by_source(username, url).await? {
            return Ok(self.blob_url(username, &existing));
        }

        let response = self
            .http_client
            .get(url)
            .timeout(self.fetch_timeout)
            .send()
            .await
            .map_err(|e| AppError::Federation(format!("Failed to fetch attachment {url}: {e}")))?;

        if !response.status().is_success() {
            return Err(AppError::Federation(format!(
                "Attachment fetch {url} returned HTTP {}",
                response.status()
            )));
        }

        let content_type = response
            .headers()
            .get(http::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("application/octet-stream")
            .to_string();

        let data = response
            .bytes()
            .await
            .map_err(|e| AppError::Federation(format!("Failed to read attachment {url}: {e}")))?;

        let blob = Blob {
            username: username.to_string(),
            id: EntityId::new().0,
            content_type,
            data: data.to_vec(),
            source_url: Some(url.to_string()),
            created_at: Utc::now(),
        };
        self.db.insert_blob(&blob).await?;

        tracing::debug!(
            username = %username,
            blob_id = %blob.id,
            source = %url,
            size = blob.data.len(),
            "Mirrored remote attachment"
        );

        Ok(self.blob_url(username, &blob.id))
    }
}
