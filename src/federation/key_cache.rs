//! Public Key Caching
//!
//! Caches fetched public keys to reduce remote requests. Fetches are
//! signed by the system actor so strict peers accept them.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

use crate::error::AppError;
use crate::identity::SystemIdentity;
use crate::metrics::KEY_CACHE_HITS_TOTAL;

/// Cached public key entry
#[derive(Debug, Clone)]
struct CachedKey {
    /// PEM-encoded public key
    pem: String,
    /// When this entry was cached
    cached_at: Instant,
    /// TTL for this entry
    ttl: Duration,
}

impl CachedKey {
    fn is_valid(&self) -> bool {
        self.cached_at.elapsed() < self.ttl
    }
}

/// Public key cache
///
/// Thread-safe cache for remote actor public keys, keyed by keyId URI.
/// A stale hit only ever manifests as a failed verification (401), so
/// plain TTL expiry is sufficient.
pub struct PublicKeyCache {
    cache: RwLock<HashMap<String, CachedKey>>,
    http_client: Arc<reqwest::Client>,
    /// System actor identity signing the fetches
    signer: Arc<SystemIdentity>,
    default_ttl: Duration,
    /// Sub-deadline for each remote fetch
    fetch_timeout: Duration,
}

impl PublicKeyCache {
    /// Create new public key cache
    pub fn new(
        http_client: Arc<reqwest::Client>,
        signer: Arc<SystemIdentity>,
        default_ttl: Duration,
        fetch_timeout: Duration,
    ) -> Self {
        Self {
            cache: RwLock::new(HashMap::new()),
            http_client,
            signer,
            default_ttl,
            fetch_timeout,
        }
    }

    /// Get public key for a key ID
    ///
    /// Checks cache first, fetches from remote if not cached or expired.
    ///
    /// # Arguments
    /// * `key_id` - Full URL to the key (e.g., actor#main-key)
    ///
    /// # Returns
    /// PEM-encoded public key
    pub async fn get(&self, key_id: &str) -> Result<String, AppError> {
        // 1. Check cache (read lock)
        {
            let cache = self.cache.read().await;
            if let Some(cached) = cache.get(key_id) {
                if cached.is_valid() {
                    tracing::debug!("Public key cache hit for {}", key_id);
                    KEY_CACHE_HITS_TOTAL.with_label_values(&["hit"]).inc();
                    return Ok(cached.pem.clone());
                }
                tracing::debug!("Public key cache expired for {}", key_id);
            }
        }

        // 2. Cache miss or expired - fetch from remote
        tracing::debug!("Public key cache miss for {}, fetching...", key_id);
        KEY_CACHE_HITS_TOTAL.with_label_values(&["miss"]).inc();
        let pem = super::signature::fetch_public_key(
            key_id,
            &self.http_client,
            &self.signer.key_id,
            &self.signer.private_key_pem,
            self.fetch_timeout,
        )
        .await?;

        // 3. Update cache (write lock)
        {
            let mut cache = self.cache.write().await;
            cache.insert(
                key_id.to_string(),
                CachedKey {
                    pem: pem.clone(),
                    cached_at: Instant::now(),
                    ttl: self.default_ttl,
                },
            );
        }

        Ok(pem)
    }

    /// Insert a key directly, bypassing the fetch path.
    ///
    /// Used for local actors, whose keys never need a network fetch.
    pub async fn put(&self, key_id: &str, pem: String) {
        let mut cache = self.cache.write().await;
        cache.insert(
            key_id.to_string(),
            CachedKey {
                pem,
                cached_at: Instant::now(),
                ttl: self.default_ttl,
            },
        );
    }

    /// Invalidate a cached key
    pub async fn invalidate(&self, key_id: &str) {
        let mut cache = self.cache.write().await;
        cache.remove(key_id);
        tracing::debug!("Invalidated public key cache for {}", key_id);
    }

    /// Get cache statistics
    pub async fn stats(&self) -> CacheStats {
        let cache = self.cache.read().await;
        let total = cache.len();
        let valid = cache.values().filter(|v| v.is_valid()).count();

        CacheStats {
            total_entries: total,
            valid_entries: valid,
            expired_entries: total - valid,
        }
    }

    /// Prune expired entries
    pub async fn prune_expired(&self) {
        let mut cache = self.cache.write().await;
        let before = cache.len();
        cache.retain(|_, v| v.is_valid());
        let removed = before - cache.len();

        if removed > 0 {
            tracing::info!("Pruned {} expired public key cache entries", removed);
        }
    }
}

/// Cache statistics
#[derive(Debug, Clone)]
pub struct CacheStats {
    pub total_entries: usize,
    pub valid_entries: usize,
    pub expired_entries: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_signer() -> Arc<SystemIdentity> {
        Arc::new(SystemIdentity {
            username: "sys".to_string(),
            actor_id: "https://local.example/users/sys".to_string(),
            key_id: "https://local.example/users/sys#main-key".to_string(),
            private_key_pem: "unused".to_string(),
        })
    }

    #[tokio::test]
    async fn cached_key_expires_and_prunes() {
        let client = Arc::new(reqwest::Client::new());
        let cache = PublicKeyCache::new(
            client,
            test_signer(),
            Duration::from_millis(50),
            Duration::from_secs(1),
        );

        cache.put("test-key", "test-pem".to_string()).await;

        let stats = cache.stats().await;
        assert_eq!(stats.valid_entries, 1);

        tokio::time::sleep(Duration::from_millis(80)).await;

        let stats = cache.stats().await;
        assert_eq!(stats.expired_entries, 1);

        cache.prune_expired().await;
        let stats = cache.stats().await;
        assert_eq!(stats.total_entries, 0);
    }

    #[tokio::test]
    async fn valid_entry_is_served_without_fetch() {
        let client = Arc::new(reqwest::Client::new());
        let cache = PublicKeyCache::new(
            client,
            test_signer(),
            Duration::from_secs(3600),
            Duration::from_secs(1),
        );

        cache
            .put("https://remote.example/users/a#main-key", "pem-a".to_string())
            .await;

        // The signer key material is unusable, so any fetch attempt
        // would error; a cache hit must not try.
        let pem = cache
            .get("https://remote.example/users/a#main-key")
            .await
            .unwrap();
        assert_eq!(pem, "pem-a");
    }
}
