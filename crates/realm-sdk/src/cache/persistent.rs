//! 持久化缓存后端
//!
//! 条目以 JSON 形式写入 `cache:{name}:{key}`。写入遇到配额错误时淘汰本命名空间最旧的
//! 10% 条目并重试一次；其余存储错误只记录日志。读取到损坏的 JSON 按未命中处理。

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, error, warn};

use super::{eviction_batch, CacheBackendTrait, CacheCounters, CacheEntry, CacheMetadata, CacheStats, SetOptions};
use crate::config::CacheConfig;
use crate::error::Result;
use crate::storage::{keys, SharedStorage};
use crate::utils::SharedClock;

#[derive(Debug)]
pub struct PersistentCache {
    storage: SharedStorage,
    /// `cache:{name}:`
    namespace: String,
    default_ttl: Option<i64>,
    max_size: Option<usize>,
    clock: SharedClock,
    counters: CacheCounters,
}

impl PersistentCache {
    pub fn new(config: &CacheConfig, storage: SharedStorage, clock: SharedClock) -> Self {
        Self {
            storage,
            namespace: keys::cache_namespace(&config.name),
            default_ttl: config.default_ttl_ms,
            max_size: config.max_size,
            clock,
            counters: CacheCounters::default(),
        }
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}{}", self.namespace, key)
    }

    fn namespaced_keys(&self) -> Vec<String> {
        match self.storage.keys_with_prefix(&self.namespace) {
            Ok(keys) => keys,
            Err(e) => {
                error!("枚举缓存 key 失败 ({}): {}", self.namespace, e);
                Vec::new()
            }
        }
    }

    /// 删除命名空间内最旧的条目，损坏条目视为最旧
    fn evict_oldest(&self, limit: usize) -> usize {
        let mut order: Vec<(i64, String)> = self
            .namespaced_keys()
            .into_iter()
            .map(|full_key| {
                let timestamp = self
                    .storage
                    .get_item(&full_key)
                    .ok()
                    .flatten()
                    .and_then(|raw| serde_json::from_str::<CacheEntry>(&raw).ok())
                    .map(|entry| entry.metadata.timestamp)
                    .unwrap_or(i64::MIN);
                (timestamp, full_key)
            })
            .collect();
        order.sort();

        let mut removed = 0;
        for (_, full_key) in order.into_iter().take(eviction_batch(limit)) {
            match self.storage.remove_item(&full_key) {
                Ok(()) => removed += 1,
                Err(e) => warn!("淘汰缓存条目 {} 失败: {}", full_key, e),
            }
        }
        self.counters.evicted(removed);
        debug!("持久化缓存淘汰 {} 条 ({})", removed, self.namespace);
        removed
    }

    fn write(&self, full_key: &str, raw: &str) {
        let err = match self.storage.set_item(full_key, raw) {
            Ok(()) => return,
            Err(e) => e,
        };

        if !err.is_quota_exceeded() {
            error!("写入缓存 {} 失败: {}", full_key, err);
            return;
        }

        warn!("缓存存储配额已满，淘汰后重试: {}", full_key);
        let total = self.namespaced_keys().len();
        self.evict_oldest(total);
        if let Err(e) = self.storage.set_item(full_key, raw) {
            error!("淘汰后重试写入缓存 {} 仍失败: {}", full_key, e);
        }
    }

    fn remove(&self, full_key: &str) {
        if let Err(e) = self.storage.remove_item(full_key) {
            error!("删除缓存 {} 失败: {}", full_key, e);
        }
    }
}

#[async_trait]
impl CacheBackendTrait for PersistentCache {
    async fn set(&self, key: &str, data: Value, options: SetOptions) -> Result<()> {
        let entry = CacheEntry {
            data,
            metadata: CacheMetadata {
                timestamp: self.clock.now_ms(),
                version: options.version,
            },
            ttl: options.ttl.or(self.default_ttl),
        };
        let raw = match serde_json::to_string(&entry) {
            Ok(raw) => raw,
            Err(e) => {
                error!("序列化缓存条目 {} 失败: {}", key, e);
                return Ok(());
            }
        };

        self.write(&self.full_key(key), &raw);

        if let Some(limit) = self.max_size {
            if self.namespaced_keys().len() > limit {
                self.evict_oldest(limit);
            }
        }
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<CacheEntry>> {
        let full_key = self.full_key(key);
        let raw = match self.storage.get_item(&full_key) {
            Ok(Some(raw)) => raw,
            Ok(None) => {
                self.counters.miss();
                return Ok(None);
            }
            Err(e) => {
                error!("读取缓存 {} 失败: {}", full_key, e);
                self.counters.miss();
                return Ok(None);
            }
        };

        let entry: CacheEntry = match serde_json::from_str(&raw) {
            Ok(entry) => entry,
            Err(e) => {
                warn!("缓存 {} 内容损坏，按未命中处理: {}", full_key, e);
                self.counters.miss();
                return Ok(None);
            }
        };

        if entry.is_expired(self.clock.now_ms()) {
            self.remove(&full_key);
            self.counters.expired();
            self.counters.miss();
            return Ok(None);
        }

        self.counters.hit();
        Ok(Some(entry))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.remove(&self.full_key(key));
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        for full_key in self.namespaced_keys() {
            self.remove(&full_key);
        }
        Ok(())
    }

    /// 本命名空间内的全部 key（不过滤过期条目）
    async fn keys(&self) -> Result<Vec<String>> {
        Ok(self
            .namespaced_keys()
            .into_iter()
            .filter_map(|full_key| full_key.strip_prefix(&self.namespace).map(str::to_string))
            .collect())
    }

    async fn size(&self) -> Result<usize> {
        Ok(self.namespaced_keys().len())
    }

    async fn close(&self) -> Result<()> {
        if let Err(e) = self.storage.flush() {
            warn!("缓存落盘失败 ({}): {}", self.namespace, e);
        }
        Ok(())
    }

    fn stats(&self) -> CacheStats {
        self.counters.snapshot()
    }
}
