use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::{DedupCache, DedupError};

/// In-memory stand-in for the Redis cache, for tests and local runs
/// without a cache deployment.
#[derive(Default)]
pub struct MemoryDedupCache {
    entries: Mutex<HashMap<(String, String), Instant>>,
}

impl MemoryDedupCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DedupCache for MemoryDedupCache {
    async fn is_processed(
        &self,
        _token: &CancellationToken,
        namespace: &str,
        key: &str,
    ) -> Result<bool, DedupError> {
        let mut entries = self.entries.lock().expect("dedup cache poisoned");
        match entries.get(&(namespace.to_string(), key.to_string())) {
            Some(expires_at) if *expires_at > Instant::now() => Ok(true),
            Some(_) => {
                entries.remove(&(namespace.to_string(), key.to_string()));
                Ok(false)
            }
            None => Ok(false),
        }
    }

    async fn mark_processed(
        &self,
        _token: &CancellationToken,
        namespace: &str,
        key: &str,
        ttl: Duration,
    ) -> Result<(), DedupError> {
        self.entries
            .lock()
            .expect("dedup cache poisoned")
            .insert((namespace.to_string(), key.to_string()), Instant::now() + ttl);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn marked_keys_are_seen_within_their_ttl() {
        let cache = MemoryDedupCache::new();
        let token = CancellationToken::new();

        assert!(!cache.is_processed(&token, "reddit", "q1:t3_a").await.unwrap());
        cache
            .mark_processed(&token, "reddit", "q1:t3_a", Duration::from_secs(60))
            .await
            .unwrap();
        assert!(cache.is_processed(&token, "reddit", "q1:t3_a").await.unwrap());
        // Namespaces are independent.
        assert!(!cache.is_processed(&token, "news", "q1:t3_a").await.unwrap());
    }

    #[tokio::test]
    async fn expired_keys_are_forgotten() {
        let cache = MemoryDedupCache::new();
        let token = CancellationToken::new();

        cache
            .mark_processed(&token, "reddit", "k", Duration::from_millis(5))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!cache.is_processed(&token, "reddit", "k").await.unwrap());
    }
}
