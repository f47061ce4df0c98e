use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::cache::CacheStorage;
use crate::error::{RealmError, Result};

/// Realm SDK 配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RealmConfig {
    /// 数据存储目录；None 表示只使用内存存储
    pub data_dir: Option<PathBuf>,
    /// 存储命名空间（通常是账号或角色 ID）
    pub namespace: String,
    /// 存储字节配额；None 表示不限制
    pub storage_quota_bytes: Option<usize>,
    /// 日志级别（trace / debug / info / warn / error）
    pub log_level: String,
    /// 实时会话配置
    pub realtime: RealtimeConfig,
    /// 缓存配置
    pub cache: CacheConfig,
    /// 离线队列配置
    pub offline_queue: OfflineQueueConfig,
    /// 状态管理配置
    pub store: StoreConfig,
}

/// 实时会话配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RealtimeConfig {
    /// 心跳间隔（毫秒）；None 不发送心跳
    pub heartbeat_interval_ms: Option<u64>,
    /// 发送缓冲上限；None 表示不限制（超过 30 秒的消息在补发时丢弃）
    pub max_backlog: Option<usize>,
    /// 本地事件总线广播缓冲区大小
    pub event_capacity: usize,
}

/// 缓存配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    pub storage: CacheStorage,
    /// 缓存名，持久化 key 为 `cache:{name}:{key}`
    pub name: String,
    /// 默认 TTL（毫秒）；None 表示永不过期
    pub default_ttl_ms: Option<i64>,
    /// 条目数上限；None 表示不淘汰
    pub max_size: Option<usize>,
}

/// 离线队列配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OfflineQueueConfig {
    /// 是否持久化到 `offline-queue`
    pub persistent: bool,
    pub max_size: usize,
    /// 操作存活时间（毫秒）
    pub ttl_ms: i64,
    /// 默认最大重试次数
    pub max_retries: u32,
}

/// 状态管理配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// 状态事件总线广播缓冲区大小
    pub event_capacity: usize,
    /// 是否安装日志中间件
    pub log_transitions: bool,
}

impl Default for RealmConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            namespace: "default".to_string(),
            storage_quota_bytes: None,
            log_level: "info".to_string(),
            realtime: RealtimeConfig::default(),
            cache: CacheConfig::default(),
            offline_queue: OfflineQueueConfig::default(),
            store: StoreConfig::default(),
        }
    }
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: Some(30_000),
            max_backlog: None,
            event_capacity: 256,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            storage: CacheStorage::Memory,
            name: "default".to_string(),
            default_ttl_ms: Some(5 * 60 * 1000),
            max_size: Some(100),
        }
    }
}

impl Default for OfflineQueueConfig {
    fn default() -> Self {
        Self {
            persistent: true,
            max_size: 100,
            ttl_ms: 24 * 60 * 60 * 1000,
            max_retries: 3,
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            event_capacity: 256,
            log_transitions: false,
        }
    }
}

impl RealmConfig {
    pub fn builder() -> RealmConfigBuilder {
        RealmConfigBuilder::new()
    }

    /// 校验配置，拒绝为 0 的容量和间隔
    pub fn validate(&self) -> Result<()> {
        if self.namespace.is_empty() {
            return Err(RealmError::Config("namespace 不能为空".to_string()));
        }
        if self.realtime.heartbeat_interval_ms == Some(0) {
            return Err(RealmError::Config("heartbeat_interval_ms 不能为 0".to_string()));
        }
        if self.realtime.max_backlog == Some(0) {
            return Err(RealmError::Config("max_backlog 不能为 0".to_string()));
        }
        if self.realtime.event_capacity == 0 || self.store.event_capacity == 0 {
            return Err(RealmError::Config("event_capacity 不能为 0".to_string()));
        }
        if self.cache.name.is_empty() {
            return Err(RealmError::Config("cache.name 不能为空".to_string()));
        }
        if self.cache.max_size == Some(0) {
            return Err(RealmError::Config("cache.max_size 不能为 0".to_string()));
        }
        if matches!(self.cache.default_ttl_ms, Some(ttl) if ttl <= 0) {
            return Err(RealmError::Config("cache.default_ttl_ms 必须为正数".to_string()));
        }
        if self.offline_queue.max_size == 0 {
            return Err(RealmError::Config("offline_queue.max_size 不能为 0".to_string()));
        }
        if self.offline_queue.ttl_ms <= 0 {
            return Err(RealmError::Config("offline_queue.ttl_ms 必须为正数".to_string()));
        }
        Ok(())
    }
}

/// Realm SDK 配置构建器
#[derive(Debug, Default)]
pub struct RealmConfigBuilder {
    config: RealmConfig,
}

impl RealmConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: RealmConfig::default(),
        }
    }

    pub fn data_dir<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config.data_dir = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn namespace<S: Into<String>>(mut self, namespace: S) -> Self {
        self.config.namespace = namespace.into();
        self
    }

    pub fn storage_quota_bytes(mut self, quota: usize) -> Self {
        self.config.storage_quota_bytes = Some(quota);
        self
    }

    pub fn log_level<S: Into<String>>(mut self, level: S) -> Self {
        self.config.log_level = level.into();
        self
    }

    pub fn heartbeat_interval_ms(mut self, interval: Option<u64>) -> Self {
        self.config.realtime.heartbeat_interval_ms = interval;
        self
    }

    pub fn max_backlog(mut self, max: usize) -> Self {
        self.config.realtime.max_backlog = Some(max);
        self
    }

    pub fn realtime_config(mut self, config: RealtimeConfig) -> Self {
        self.config.realtime = config;
        self
    }

    pub fn cache_config(mut self, config: CacheConfig) -> Self {
        self.config.cache = config;
        self
    }

    pub fn cache_storage(mut self, storage: CacheStorage) -> Self {
        self.config.cache.storage = storage;
        self
    }

    pub fn offline_queue_config(mut self, config: OfflineQueueConfig) -> Self {
        self.config.offline_queue = config;
        self
    }

    pub fn store_config(mut self, config: StoreConfig) -> Self {
        self.config.store = config;
        self
    }

    pub fn build(self) -> Result<RealmConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = RealmConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.offline_queue.max_retries, 3);
        assert_eq!(config.offline_queue.ttl_ms, 86_400_000);
        assert_eq!(config.realtime.heartbeat_interval_ms, Some(30_000));
        assert_eq!(config.realtime.max_backlog, None);
    }

    #[test]
    fn test_builder() {
        let config = RealmConfig::builder()
            .data_dir("/tmp/realm")
            .namespace("hero_42")
            .cache_storage(CacheStorage::Persistent)
            .max_backlog(500)
            .heartbeat_interval_ms(None)
            .build()
            .unwrap();

        assert_eq!(config.data_dir, Some(PathBuf::from("/tmp/realm")));
        assert_eq!(config.namespace, "hero_42");
        assert_eq!(config.cache.storage, CacheStorage::Persistent);
        assert_eq!(config.realtime.max_backlog, Some(500));
        assert_eq!(config.realtime.heartbeat_interval_ms, None);
    }

    #[test]
    fn test_validate_rejects_zero_values() {
        assert!(RealmConfig::builder().max_backlog(0).build().is_err());
        assert!(RealmConfig::builder().heartbeat_interval_ms(Some(0)).build().is_err());

        let mut config = RealmConfig::default();
        config.cache.max_size = Some(0);
        assert!(matches!(config.validate(), Err(RealmError::Config(_))));

        let mut config = RealmConfig::default();
        config.offline_queue.max_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_json_round_trip() {
        let json = serde_json::to_string(&RealmConfig::default()).unwrap();
        assert!(json.contains("\"storage\":\"memory\""));
        let back: RealmConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.cache.name, "default");
    }
}
