use crate::error::CoreError;
use crate::time::now_ms;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use vesper_api::types::PublicKeys;

/// Key service collaborator. `None` means the identity has no
/// published keys; the caller decides whether that is permanent.
#[async_trait]
pub trait KeyService: Send + Sync {
    async fn public_keys(&self, id: &str) -> Result<Option<PublicKeys>, CoreError>;
}

/// Bounded-TTL cache in front of a key service. Entries older than the
/// TTL are refetched; a fetch failure does not evict a stale entry.
#[derive(Clone)]
pub struct CachedKeyService {
    inner: Arc<dyn KeyService>,
    ttl_ms: u64,
    cache: Arc<Mutex<HashMap<String, (u64, PublicKeys)>>>,
}

impl CachedKeyService {
    pub fn new(inner: Arc<dyn KeyService>, ttl_secs: u64) -> Self {
        Self {
            inner,
            ttl_ms: ttl_secs.saturating_mul(1000),
            cache: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

#[async_trait]
impl KeyService for CachedKeyService {
    async fn public_keys(&self, id: &str) -> Result<Option<PublicKeys>, CoreError> {
        let now = now_ms();
        {
            let guard = self.cache.lock().await;
            if let Some((cached_at, keys)) = guard.get(id) {
                if now.saturating_sub(*cached_at) <= self.ttl_ms {
                    return Ok(Some(keys.clone()));
                }
            }
        }
        match self.inner.public_keys(id).await {
            Ok(Some(keys)) => {
                self.cache
                    .lock()
                    .await
                    .insert(id.to_string(), (now, keys.clone()));
                Ok(Some(keys))
            }
            Ok(None) => Ok(None),
            Err(err) => {
                let guard = self.cache.lock().await;
                if let Some((_, keys)) = guard.get(id) {
                    return Ok(Some(keys.clone()));
                }
                Err(err)
            }
        }
    }
}

#[derive(Clone, Default)]
pub struct InMemoryKeyService {
    keys: Arc<Mutex<HashMap<String, PublicKeys>>>,
}

impl InMemoryKeyService {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, id: &str, keys: PublicKeys) {
        self.keys.lock().await.insert(id.to_string(), keys);
    }

    pub async fn remove(&self, id: &str) {
        self.keys.lock().await.remove(id);
    }
}

#[async_trait]
impl KeyService for InMemoryKeyService {
    async fn public_keys(&self, id: &str) -> Result<Option<PublicKeys>, CoreError> {
        Ok(self.keys.lock().await.get(id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Default)]
    struct CountingService {
        inner: InMemoryKeyService,
        calls: Arc<Mutex<usize>>,
    }

    #[async_trait]
    impl KeyService for CountingService {
        async fn public_keys(&self, id: &str) -> Result<Option<PublicKeys>, CoreError> {
            *self.calls.lock().await += 1;
            self.inner.public_keys(id).await
        }
    }

    #[tokio::test]
    async fn fresh_entries_are_served_from_cache() {
        let counting = CountingService::default();
        counting
            .inner
            .register(
                "@bob",
                PublicKeys {
                    encryption: [1u8; 32],
                    verifying: [2u8; 32],
                },
            )
            .await;
        let calls = counting.calls.clone();
        let cached = CachedKeyService::new(Arc::new(counting), 60);
        let first = cached.public_keys("@bob").await.expect("first");
        let second = cached.public_keys("@bob").await.expect("second");
        assert_eq!(first, second);
        assert_eq!(*calls.lock().await, 1);
    }

    #[tokio::test]
    async fn unknown_identity_is_none_not_error() {
        let cached = CachedKeyService::new(Arc::new(InMemoryKeyService::new()), 60);
        assert!(cached.public_keys("@ghost").await.expect("lookup").is_none());
    }
}
