//! 客户端上下文
//!
//! 由应用显式创建并传递，一个实例共享同一个存储句柄：状态管理器、缓存和离线队列
//! 各自使用不同的 key 前缀。实时会话按需通过调用方提供的传输层创建。

use std::sync::Arc;
use tracing::{info, warn};

use crate::cache::CacheService;
use crate::character::CharacterRealtime;
use crate::config::RealmConfig;
use crate::error::Result;
use crate::events::EventBus;
use crate::offline::{OfflineQueue, QueueStorage};
use crate::realtime::{RealtimeService, RealtimeTransport};
use crate::state::{middleware, StateManager};
use crate::storage::{MemoryStorage, SharedStorage, SledStorage};
use crate::utils::{SharedClock, SystemClock};

pub struct RealmClient {
    config: RealmConfig,
    storage: SharedStorage,
    clock: SharedClock,
    store: Arc<StateManager>,
    cache: Arc<CacheService>,
    offline_queue: Arc<OfflineQueue>,
}

impl std::fmt::Debug for RealmClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RealmClient")
            .field("namespace", &self.config.namespace)
            .field("storage", &self.storage)
            .finish()
    }
}

impl RealmClient {
    /// 按配置打开存储：配置了 `data_dir` 时使用 sled，否则使用内存存储
    pub fn new(config: RealmConfig) -> Result<Self> {
        config.validate()?;

        let storage: SharedStorage = match &config.data_dir {
            Some(dir) => Arc::new(SledStorage::open_with_quota(
                dir,
                &config.namespace,
                config.storage_quota_bytes,
            )?),
            None => match config.storage_quota_bytes {
                Some(quota) => Arc::new(MemoryStorage::with_quota(quota)),
                None => Arc::new(MemoryStorage::new()),
            },
        };

        Self::with_storage(config, storage, SystemClock::shared())
    }

    /// 使用外部提供的存储和时间源
    pub fn with_storage(config: RealmConfig, storage: SharedStorage, clock: SharedClock) -> Result<Self> {
        config.validate()?;

        let events = Arc::new(EventBus::new(config.store.event_capacity));
        let store = StateManager::new(events)
            .with_storage(storage.clone())
            .with_clock(clock.clone());
        if config.store.log_transitions {
            store.use_middleware(middleware::logging());
        }

        let cache = CacheService::with_clock(&config.cache, storage.clone(), clock.clone());

        let queue_storage = if config.offline_queue.persistent {
            QueueStorage::Persistent(storage.clone())
        } else {
            QueueStorage::Memory
        };
        let offline_queue = OfflineQueue::with_clock(config.offline_queue.clone(), queue_storage, clock.clone());

        info!("Realm 客户端已初始化: namespace={}", config.namespace);

        Ok(Self {
            config,
            storage,
            clock,
            store: Arc::new(store),
            cache: Arc::new(cache),
            offline_queue: Arc::new(offline_queue),
        })
    }

    pub fn config(&self) -> &RealmConfig {
        &self.config
    }

    pub fn storage(&self) -> &SharedStorage {
        &self.storage
    }

    pub fn store(&self) -> &Arc<StateManager> {
        &self.store
    }

    pub fn cache(&self) -> &Arc<CacheService> {
        &self.cache
    }

    pub fn offline_queue(&self) -> &Arc<OfflineQueue> {
        &self.offline_queue
    }

    /// 基于传输层创建一个实时会话
    pub fn realtime(&self, name: &str, transport: Arc<dyn RealtimeTransport>) -> Arc<RealtimeService> {
        RealtimeService::with_clock(name, transport, self.config.realtime.clone(), self.clock.clone())
    }

    /// 创建角色实时服务（会话 + `character` 状态切片）
    pub fn character_realtime(&self, transport: Arc<dyn RealtimeTransport>) -> CharacterRealtime {
        let session = self.realtime("character", transport);
        CharacterRealtime::new(session, self.store.clone())
    }

    /// 关闭缓存并落盘
    pub async fn shutdown(&self) -> Result<()> {
        self.cache.close().await?;
        if let Err(e) = self.storage.flush() {
            warn!("存储落盘失败: {}", e);
        }
        info!("Realm 客户端已关闭: namespace={}", self.config.namespace);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheStorage, SetOptions};
    use crate::offline::{HttpMethod, PendingOperation};
    use crate::state::{RegisterOptions, UpdateOptions};
    use crate::storage::KeyValueStorage;
    use serde_json::json;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_components_share_storage_without_collisions() {
        let config = RealmConfig::builder()
            .cache_storage(CacheStorage::Persistent)
            .heartbeat_interval_ms(None)
            .build()
            .unwrap();
        let storage = MemoryStorage::shared();
        let client = RealmClient::with_storage(config, storage.clone(), SystemClock::shared()).unwrap();

        client.store().register("settings", json!({"music": true}), RegisterOptions::persisted());
        client
            .store()
            .update("settings", json!({"music": false}), UpdateOptions::default())
            .unwrap();
        client.cache().set("zones", json!(["harbor"]), SetOptions::default()).await.unwrap();
        client
            .offline_queue()
            .add(PendingOperation::new(HttpMethod::Post, "/api/bank/deposit"))
            .await;

        let mut keys = storage.keys().unwrap();
        keys.sort();
        assert_eq!(
            keys,
            vec![
                "cache:default:zones".to_string(),
                "offline-queue".to_string(),
                "state:settings".to_string()
            ]
        );
    }

    #[tokio::test]
    async fn test_sled_backed_client_restores_state() {
        let temp_dir = TempDir::new().unwrap();
        let config = RealmConfig::builder()
            .data_dir(temp_dir.path())
            .namespace("hero")
            .heartbeat_interval_ms(None)
            .build()
            .unwrap();

        {
            let client = RealmClient::new(config.clone()).unwrap();
            client.store().register("gold", json!(0), RegisterOptions::persisted());
            client.store().update("gold", json!(250), UpdateOptions::default()).unwrap();
            client.shutdown().await.unwrap();
        }

        let client = RealmClient::new(config).unwrap();
        client.store().register("gold", json!(0), RegisterOptions::persisted());
        assert_eq!(client.store().select("gold"), Some(json!(250)));
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let mut config = RealmConfig::default();
        config.offline_queue.max_size = 0;
        assert!(RealmClient::new(config).is_err());
    }
}
