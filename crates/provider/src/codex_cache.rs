use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

const CACHE_TTL: Duration = Duration::from_secs(60 * 60);
const SWEEP_INTERVAL: Duration = Duration::from_secs(15 * 60);

#[derive(Debug, Clone)]
struct CacheEntry {
    id: String,
    expire: Instant,
}

/// Prompt-cache correlation ids for Codex: `(model, user)` maps to a
/// stable id for one hour so consecutive requests reuse the upstream's
/// cached context. A background sweeper purges expired entries.
pub struct CodexPromptCache {
    entries: DashMap<String, CacheEntry>,
    ttl: Duration,
}

impl CodexPromptCache {
    pub fn new() -> Arc<Self> {
        Self::with_ttl(CACHE_TTL)
    }

    pub fn with_ttl(ttl: Duration) -> Arc<Self> {
        let cache = Arc::new(Self {
            entries: DashMap::new(),
            ttl,
        });

        let sweeper = Arc::downgrade(&cache);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(SWEEP_INTERVAL);
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(cache) = sweeper.upgrade() else {
                    return;
                };
                cache.sweep();
            }
        });

        cache
    }

    fn key(model: &str, user_id: &str) -> String {
        format!("{model}\u{1f}{user_id}")
    }

    /// Return the live cache id for this (model, user), minting a new one
    /// on miss or expiry.
    pub fn get_or_mint(&self, model: &str, user_id: &str) -> String {
        let key = Self::key(model, user_id);
        if let Some(entry) = self.entries.get(&key)
            && entry.expire > Instant::now()
        {
            return entry.id.clone();
        }
        let id = uuid::Uuid::new_v4().to_string();
        self.entries.insert(
            key,
            CacheEntry {
                id: id.clone(),
                expire: Instant::now() + self.ttl,
            },
        );
        id
    }

    /// Lookup without minting; expired entries read as absent.
    pub fn get(&self, model: &str, user_id: &str) -> Option<String> {
        let entry = self.entries.get(&Self::key(model, user_id))?;
        if entry.expire <= Instant::now() {
            return None;
        }
        Some(entry.id.clone())
    }

    fn sweep(&self) {
        let now = Instant::now();
        self.entries.retain(|_, entry| entry.expire > now);
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_same_user_and_model_reuse_id() {
        let cache = CodexPromptCache::new();
        let a = cache.get_or_mint("gpt-5-codex", "user-1");
        let b = cache.get_or_mint("gpt-5-codex", "user-1");
        assert_eq!(a, b);

        let other_user = cache.get_or_mint("gpt-5-codex", "user-2");
        assert_ne!(a, other_user);
        let other_model = cache.get_or_mint("gpt-5", "user-1");
        assert_ne!(a, other_model);
    }

    #[tokio::test]
    async fn test_expiry_mints_new_id() {
        let cache = CodexPromptCache::with_ttl(Duration::from_millis(20));
        let a = cache.get_or_mint("gpt-5-codex", "user-1");
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(cache.get("gpt-5-codex", "user-1").is_none());
        let b = cache.get_or_mint("gpt-5-codex", "user-1");
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn test_sweep_purges_expired() {
        let cache = CodexPromptCache::with_ttl(Duration::from_millis(10));
        cache.get_or_mint("m", "u");
        tokio::time::sleep(Duration::from_millis(30)).await;
        cache.sweep();
        assert_eq!(cache.len(), 0);
    }
}
