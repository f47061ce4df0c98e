//! 缓存模块 - 统一的缓存接口与可替换的存储后端
//!
//! 功能包括：
//! - 基于 TTL 的惰性过期（只在 get/has 时删除）
//! - 按条目数量的淘汰策略（插入后超出上限时删除最旧的 10%，至少 1 条）
//! - 内存后端与持久化后端，由配置在构造时选择
//! - 命中率统计

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

use crate::config::CacheConfig;
use crate::error::Result;
use crate::storage::SharedStorage;
use crate::utils::{SharedClock, SystemClock};

pub mod memory;
pub mod persistent;

pub use memory::MemoryCache;
pub use persistent::PersistentCache;

/// 缓存条目元数据
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheMetadata {
    /// 写入时间（UTC 毫秒）
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

/// 缓存条目
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub data: Value,
    pub metadata: CacheMetadata,
    /// 存活时间（毫秒），`None` 表示永不过期
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<i64>,
}

impl CacheEntry {
    /// `now - timestamp > ttl` 时视为过期
    pub fn is_expired(&self, now_ms: i64) -> bool {
        match self.ttl {
            Some(ttl) => now_ms - self.metadata.timestamp > ttl,
            None => false,
        }
    }
}

/// 写入选项
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SetOptions {
    /// 覆盖默认 TTL
    pub ttl: Option<i64>,
    pub version: Option<String>,
}

impl SetOptions {
    pub fn ttl(ttl_ms: i64) -> Self {
        Self {
            ttl: Some(ttl_ms),
            version: None,
        }
    }

    pub fn with_version<S: Into<String>>(mut self, version: S) -> Self {
        self.version = Some(version.into());
        self
    }
}

/// 缓存存储类型
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheStorage {
    #[default]
    Memory,
    /// 键值存储（`cache:{name}:{key}`）
    Persistent,
    /// 目前与 `Persistent` 相同
    Database,
}

/// 缓存统计信息
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub expirations: u64,
    pub evictions: u64,
}

/// 后端内部计数器
#[derive(Debug, Default)]
pub(crate) struct CacheCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    expirations: AtomicU64,
    evictions: AtomicU64,
}

impl CacheCounters {
    pub(crate) fn hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn expired(&self) {
        self.expirations.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn evicted(&self, count: usize) {
        self.evictions.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }
}

/// 一次淘汰删除的条目数：上限的 10%，至少 1 条
pub(crate) fn eviction_batch(limit: usize) -> usize {
    (limit / 10).max(1)
}

/// 缓存后端 trait
#[async_trait]
pub trait CacheBackendTrait: std::fmt::Debug + Send + Sync {
    async fn set(&self, key: &str, data: Value, options: SetOptions) -> Result<()>;
    /// 读取条目；过期条目在此删除并返回 `None`
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>>;
    async fn delete(&self, key: &str) -> Result<()>;
    async fn clear(&self) -> Result<()>;
    async fn keys(&self) -> Result<Vec<String>>;
    async fn size(&self) -> Result<usize>;
    async fn close(&self) -> Result<()>;
    fn stats(&self) -> CacheStats;

    async fn has(&self, key: &str) -> Result<bool> {
        Ok(self.get(key).await?.is_some())
    }
}

/// 缓存后端枚举 - 支持内存缓存和持久化缓存
#[derive(Debug)]
pub enum CacheBackend {
    Memory(MemoryCache),
    Persistent(PersistentCache),
}

#[async_trait]
impl CacheBackendTrait for CacheBackend {
    async fn set(&self, key: &str, data: Value, options: SetOptions) -> Result<()> {
        match self {
            CacheBackend::Memory(c) => c.set(key, data, options).await,
            CacheBackend::Persistent(c) => c.set(key, data, options).await,
        }
    }

    async fn get(&self, key: &str) -> Result<Option<CacheEntry>> {
        match self {
            CacheBackend::Memory(c) => c.get(key).await,
            CacheBackend::Persistent(c) => c.get(key).await,
        }
    }

    async fn delete(&self, key: &str) -> Result<()> {
        match self {
            CacheBackend::Memory(c) => c.delete(key).await,
            CacheBackend::Persistent(c) => c.delete(key).await,
        }
    }

    async fn clear(&self) -> Result<()> {
        match self {
            CacheBackend::Memory(c) => c.clear().await,
            CacheBackend::Persistent(c) => c.clear().await,
        }
    }

    async fn keys(&self) -> Result<Vec<String>> {
        match self {
            CacheBackend::Memory(c) => c.keys().await,
            CacheBackend::Persistent(c) => c.keys().await,
        }
    }

    async fn size(&self) -> Result<usize> {
        match self {
            CacheBackend::Memory(c) => c.size().await,
            CacheBackend::Persistent(c) => c.size().await,
        }
    }

    async fn close(&self) -> Result<()> {
        match self {
            CacheBackend::Memory(c) => c.close().await,
            CacheBackend::Persistent(c) => c.close().await,
        }
    }

    fn stats(&self) -> CacheStats {
        match self {
            CacheBackend::Memory(c) => c.stats(),
            CacheBackend::Persistent(c) => c.stats(),
        }
    }
}

/// 缓存服务（按配置选择后端并转发调用）
#[derive(Debug)]
pub struct CacheService {
    name: String,
    backend: CacheBackend,
}

impl CacheService {
    pub fn new(config: &CacheConfig, storage: SharedStorage) -> Self {
        Self::with_clock(config, storage, SystemClock::shared())
    }

    pub fn with_clock(config: &CacheConfig, storage: SharedStorage, clock: SharedClock) -> Self {
        let backend = match config.storage {
            CacheStorage::Memory => CacheBackend::Memory(MemoryCache::new(config, clock)),
            CacheStorage::Persistent | CacheStorage::Database => {
                CacheBackend::Persistent(PersistentCache::new(config, storage, clock))
            }
        };
        debug!("缓存服务已创建: {} ({:?})", config.name, config.storage);

        Self {
            name: config.name.clone(),
            backend,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn backend(&self) -> &CacheBackend {
        &self.backend
    }

    pub async fn set(&self, key: &str, data: Value, options: SetOptions) -> Result<()> {
        self.backend.set(key, data, options).await
    }

    pub async fn get(&self, key: &str) -> Result<Option<CacheEntry>> {
        self.backend.get(key).await
    }

    pub async fn delete(&self, key: &str) -> Result<()> {
        self.backend.delete(key).await
    }

    pub async fn clear(&self) -> Result<()> {
        self.backend.clear().await
    }

    pub async fn has(&self, key: &str) -> Result<bool> {
        self.backend.has(key).await
    }

    pub async fn keys(&self) -> Result<Vec<String>> {
        self.backend.keys().await
    }

    pub async fn size(&self) -> Result<usize> {
        self.backend.size().await
    }

    pub async fn close(&self) -> Result<()> {
        self.backend.close().await
    }

    pub fn stats(&self) -> CacheStats {
        self.backend.stats()
    }

    /// 读取并反序列化数据；类型不匹配视为未命中
    pub async fn get_data<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let Some(entry) = self.get(key).await? else {
            return Ok(None);
        };
        match serde_json::from_value(entry.data) {
            Ok(data) => Ok(Some(data)),
            Err(e) => {
                warn!("缓存 {} 数据类型不匹配，按未命中处理: {}", key, e);
                Ok(None)
            }
        }
    }

    pub async fn set_data<T: Serialize>(&self, key: &str, data: &T, options: SetOptions) -> Result<()> {
        let value = serde_json::to_value(data)?;
        self.set(key, value, options).await
    }
}
