use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;
use tracing::debug;

use super::{eviction_batch, CacheBackendTrait, CacheCounters, CacheEntry, CacheMetadata, CacheStats, SetOptions};
use crate::config::CacheConfig;
use crate::error::Result;
use crate::utils::SharedClock;

#[derive(Debug)]
struct Slot {
    /// 插入序号，时间戳相同时按插入先后淘汰
    seq: u64,
    entry: CacheEntry,
}

/// 基于内存的缓存实现
#[derive(Debug)]
pub struct MemoryCache {
    entries: RwLock<HashMap<String, Slot>>,
    next_seq: AtomicU64,
    default_ttl: Option<i64>,
    max_size: Option<usize>,
    clock: SharedClock,
    counters: CacheCounters,
}

impl MemoryCache {
    pub fn new(config: &CacheConfig, clock: SharedClock) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            next_seq: AtomicU64::new(0),
            default_ttl: config.default_ttl_ms,
            max_size: config.max_size,
            clock,
            counters: CacheCounters::default(),
        }
    }

    fn evict_oldest(&self, entries: &mut HashMap<String, Slot>, limit: usize) {
        let mut order: Vec<(i64, u64, String)> = entries
            .iter()
            .map(|(k, s)| (s.entry.metadata.timestamp, s.seq, k.clone()))
            .collect();
        order.sort();

        let removed = order
            .into_iter()
            .take(eviction_batch(limit))
            .filter(|(_, _, key)| entries.remove(key).is_some())
            .count();
        self.counters.evicted(removed);
        debug!("内存缓存淘汰 {} 条，剩余 {}", removed, entries.len());
    }
}

#[async_trait]
impl CacheBackendTrait for MemoryCache {
    async fn set(&self, key: &str, data: Value, options: SetOptions) -> Result<()> {
        let entry = CacheEntry {
            data,
            metadata: CacheMetadata {
                timestamp: self.clock.now_ms(),
                version: options.version,
            },
            ttl: options.ttl.or(self.default_ttl),
        };
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);

        let mut entries = self.entries.write().await;
        entries.insert(key.to_string(), Slot { seq, entry });
        if let Some(limit) = self.max_size {
            if entries.len() > limit {
                self.evict_oldest(&mut entries, limit);
            }
        }
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<CacheEntry>> {
        let now = self.clock.now_ms();
        let mut entries = self.entries.write().await;

        let expired = match entries.get(key) {
            None => {
                self.counters.miss();
                return Ok(None);
            }
            Some(slot) => slot.entry.is_expired(now),
        };

        if expired {
            entries.remove(key);
            self.counters.expired();
            self.counters.miss();
            debug!("缓存条目已过期: {}", key);
            return Ok(None);
        }

        self.counters.hit();
        Ok(entries.get(key).map(|slot| slot.entry.clone()))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.write().await.remove(key);
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        self.entries.write().await.clear();
        Ok(())
    }

    /// 只返回未过期的 key（不删除过期条目）
    async fn keys(&self) -> Result<Vec<String>> {
        let now = self.clock.now_ms();
        let entries = self.entries.read().await;
        let mut live: Vec<(u64, String)> = entries
            .iter()
            .filter(|(_, s)| !s.entry.is_expired(now))
            .map(|(k, s)| (s.seq, k.clone()))
            .collect();
        live.sort();
        Ok(live.into_iter().map(|(_, k)| k).collect())
    }

    async fn size(&self) -> Result<usize> {
        let now = self.clock.now_ms();
        let entries = self.entries.read().await;
        Ok(entries.values().filter(|s| !s.entry.is_expired(now)).count())
    }

    async fn close(&self) -> Result<()> {
        self.clear().await
    }

    fn stats(&self) -> CacheStats {
        self.counters.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheStorage;
    use crate::utils::ManualClock;
    use serde_json::json;

    fn cache(clock: SharedClock, default_ttl_ms: Option<i64>, max_size: Option<usize>) -> MemoryCache {
        let config = CacheConfig {
            storage: CacheStorage::Memory,
            name: "mem".to_string(),
            default_ttl_ms,
            max_size,
        };
        MemoryCache::new(&config, clock)
    }

    #[tokio::test]
    async fn test_default_ttl_applies() {
        let clock = ManualClock::new(0);
        let cache = cache(clock.clone(), Some(100), None);

        cache.set("npc", json!("guard"), SetOptions::default()).await.unwrap();
        cache.set("boss", json!("dragon"), SetOptions::ttl(1_000)).await.unwrap();
        assert_eq!(cache.get("npc").await.unwrap().unwrap().ttl, Some(100));

        clock.advance(101);
        // size/keys 不统计过期条目，但条目仍在，直到 get 时删除
        assert_eq!(cache.size().await.unwrap(), 1);
        assert_eq!(cache.keys().await.unwrap(), vec!["boss".to_string()]);
        assert_eq!(cache.entries.read().await.len(), 2);

        assert!(cache.get("npc").await.unwrap().is_none());
        assert_eq!(cache.entries.read().await.len(), 1);
    }

    #[tokio::test]
    async fn test_eviction_ties_use_insertion_order() {
        let clock = ManualClock::new(0);
        let cache = cache(clock, None, Some(3));

        for key in ["k1", "k2", "k3", "k4"] {
            cache.set(key, json!(key), SetOptions::default()).await.unwrap();
        }

        assert_eq!(
            cache.keys().await.unwrap(),
            vec!["k2".to_string(), "k3".to_string(), "k4".to_string()]
        );
    }

    #[tokio::test]
    async fn test_eviction_stats_match_removed_entries() {
        let clock = ManualClock::new(0);
        let cache = cache(clock.clone(), None, Some(20));

        for n in 0..21 {
            cache.set(&format!("item:{}", n), json!(n), SetOptions::default()).await.unwrap();
            clock.advance(1);
        }

        // 超出上限 1 条，淘汰 max(1, 20 / 10) = 2 条最旧的
        assert_eq!(cache.size().await.unwrap(), 19);
        assert!(!cache.has("item:0").await.unwrap());
        assert!(!cache.has("item:1").await.unwrap());
        assert!(cache.has("item:2").await.unwrap());
        assert_eq!(cache.stats().evictions, 21 - 19);
    }

    #[tokio::test]
    async fn test_overwrite_does_not_grow() {
        let clock = ManualClock::new(0);
        let cache = cache(clock, None, Some(2));

        cache.set("a", json!(1), SetOptions::default()).await.unwrap();
        cache.set("a", json!(2), SetOptions::default()).await.unwrap();
        cache.set("b", json!(3), SetOptions::default()).await.unwrap();

        assert_eq!(cache.size().await.unwrap(), 2);
        assert_eq!(cache.get("a").await.unwrap().unwrap().data, json!(2));
        assert_eq!(cache.stats().evictions, 0);
    }

    #[tokio::test]
    async fn test_delete_clear_close() {
        let cache = cache(ManualClock::new(0), None, None);
        cache.set("a", json!(1), SetOptions::default()).await.unwrap();
        cache.set("b", json!(2), SetOptions::default()).await.unwrap();

        cache.delete("a").await.unwrap();
        cache.delete("unknown").await.unwrap();
        assert_eq!(cache.size().await.unwrap(), 1);

        cache.close().await.unwrap();
        assert_eq!(cache.size().await.unwrap(), 0);
    }
}
