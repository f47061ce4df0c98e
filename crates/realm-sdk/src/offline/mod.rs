//! 离线队列模块 - 暂存离线期间无法发送的写操作
//!
//! 功能包括：
//! - 数量上限（达到上限时淘汰最旧的 10%，至少 1 条）
//! - TTL 过期（`get_all` / `process` 时清理）
//! - 重试计数，达到最大重试次数后判定失败并移除
//! - 内存模式与持久化模式（整个队列序列化为 `offline-queue` 下的一个 JSON 数组）
//!
//! 队列只做重试记账，不执行真正的网络请求。

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use crate::cache::eviction_batch;
use crate::config::OfflineQueueConfig;
use crate::storage::{keys, SharedStorage};
use crate::utils::{SharedClock, SystemClock};

mod operation;

pub use operation::{HttpMethod, OfflineOperation, PendingOperation, ProcessResult};

/// 队列存储方式
#[derive(Clone)]
pub enum QueueStorage {
    Memory,
    Persistent(SharedStorage),
}

impl fmt::Debug for QueueStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueueStorage::Memory => f.write_str("Memory"),
            QueueStorage::Persistent(_) => f.write_str("Persistent"),
        }
    }
}

/// 离线队列统计信息
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OfflineQueueStats {
    pub pending: usize,
    pub total_added: u64,
    pub total_failed: u64,
    pub total_expired: u64,
    pub total_evicted: u64,
}

/// 离线操作队列
#[derive(Debug)]
pub struct OfflineQueue {
    /// 按入队顺序保存
    operations: RwLock<Vec<OfflineOperation>>,
    storage: QueueStorage,
    config: OfflineQueueConfig,
    clock: SharedClock,
    stats: Mutex<OfflineQueueStats>,
}

impl OfflineQueue {
    /// 创建队列；持久化模式下立即加载已保存的操作
    pub fn new(config: OfflineQueueConfig, storage: QueueStorage) -> Self {
        Self::with_clock(config, storage, SystemClock::shared())
    }

    pub fn with_clock(config: OfflineQueueConfig, storage: QueueStorage, clock: SharedClock) -> Self {
        let operations = Self::load(&storage);
        if !operations.is_empty() {
            info!("已加载 {} 个离线操作", operations.len());
        }

        Self {
            operations: RwLock::new(operations),
            storage,
            config,
            clock,
            stats: Mutex::new(OfflineQueueStats::default()),
        }
    }

    fn load(storage: &QueueStorage) -> Vec<OfflineOperation> {
        let QueueStorage::Persistent(storage) = storage else {
            return Vec::new();
        };

        match storage.get_item(keys::OFFLINE_QUEUE) {
            Ok(Some(raw)) => serde_json::from_str(&raw).unwrap_or_else(|e| {
                warn!("离线队列数据损坏，从空队列开始: {}", e);
                Vec::new()
            }),
            Ok(None) => Vec::new(),
            Err(e) => {
                error!("读取离线队列失败，从空队列开始: {}", e);
                Vec::new()
            }
        }
    }

    fn persist(&self, operations: &[OfflineOperation]) {
        let QueueStorage::Persistent(storage) = &self.storage else {
            return;
        };

        let result = serde_json::to_string(operations)
            .map_err(crate::error::RealmError::from)
            .and_then(|raw| storage.set_item(keys::OFFLINE_QUEUE, &raw));
        if let Err(e) = result {
            error!("保存离线队列失败: {}", e);
        }
    }

    /// 入队；队列已满时先淘汰最旧的操作
    pub async fn add(&self, pending: PendingOperation) -> OfflineOperation {
        let operation = OfflineOperation {
            id: uuid::Uuid::new_v4().to_string(),
            method: pending.method,
            endpoint: pending.endpoint,
            data: pending.data,
            options: pending.options,
            timestamp: self.clock.now_ms(),
            retry_count: 0,
            max_retries: pending.max_retries.unwrap_or(self.config.max_retries),
        };

        let mut operations = self.operations.write().await;
        if operations.len() >= self.config.max_size {
            let evicted = Self::evict_oldest(&mut operations, self.config.max_size);
            self.stats.lock().total_evicted += evicted as u64;
            warn!("离线队列已满，淘汰最旧的 {} 个操作", evicted);
        }

        operations.push(operation.clone());
        self.persist(&operations);
        self.stats.lock().total_added += 1;
        debug!("离线操作入队: {} {} ({})", operation.method, operation.endpoint, operation.id);

        operation
    }

    fn evict_oldest(operations: &mut Vec<OfflineOperation>, limit: usize) -> usize {
        let mut by_age: Vec<(i64, usize)> = operations
            .iter()
            .enumerate()
            .map(|(index, op)| (op.timestamp, index))
            .collect();
        by_age.sort();

        let count = eviction_batch(limit).min(operations.len());
        let victims: Vec<usize> = by_age.into_iter().take(count).map(|(_, index)| index).collect();
        let mut index = 0;
        operations.retain(|_| {
            let keep = !victims.contains(&index);
            index += 1;
            keep
        });
        count
    }

    pub async fn get(&self, id: &str) -> Option<OfflineOperation> {
        self.operations.read().await.iter().find(|op| op.id == id).cloned()
    }

    /// 移除操作，返回是否存在
    pub async fn remove(&self, id: &str) -> bool {
        let mut operations = self.operations.write().await;
        let before = operations.len();
        operations.retain(|op| op.id != id);
        let removed = operations.len() != before;
        self.persist(&operations);
        removed
    }

    pub async fn clear(&self) {
        let mut operations = self.operations.write().await;
        operations.clear();
        self.persist(&operations);
    }

    /// 清理过期操作后返回剩余操作（入队顺序）
    pub async fn get_all(&self) -> Vec<OfflineOperation> {
        let mut operations = self.operations.write().await;
        self.sweep_expired(&mut operations);
        operations.clone()
    }

    fn sweep_expired(&self, operations: &mut Vec<OfflineOperation>) {
        let now = self.clock.now_ms();
        let ttl = self.config.ttl_ms;
        let before = operations.len();
        operations.retain(|op| op.age_ms(now) <= ttl);

        let expired = before - operations.len();
        if expired > 0 {
            info!("离线队列清理过期操作 {} 个", expired);
            self.stats.lock().total_expired += expired as u64;
            self.persist(operations);
        }
    }

    /// 推进重试计数：达到最大重试次数的操作判定失败并移除，其余保留待重试
    pub async fn process(&self) -> ProcessResult {
        let mut operations = self.operations.write().await;
        self.sweep_expired(&mut operations);

        let mut result = ProcessResult::default();
        if operations.is_empty() {
            return result;
        }

        for op in operations.iter_mut() {
            op.retry_count += 1;
            if op.is_exhausted() {
                result.failed.push(op.clone());
            } else {
                result.retrying.push(op.clone());
            }
        }
        operations.retain(|op| !op.is_exhausted());
        self.persist(&operations);

        if !result.failed.is_empty() {
            warn!("{} 个离线操作超过最大重试次数，已放弃", result.failed.len());
            self.stats.lock().total_failed += result.failed.len() as u64;
        }
        debug!(
            "离线队列处理完成: failed={}, retrying={}",
            result.failed.len(),
            result.retrying.len()
        );
        result
    }

    /// 当前数量（不做过期清理）
    pub async fn size(&self) -> usize {
        self.operations.read().await.len()
    }

    pub async fn stats(&self) -> OfflineQueueStats {
        let pending = self.size().await;
        let mut stats = self.stats.lock().clone();
        stats.pending = pending;
        stats
    }

    pub fn config(&self) -> &OfflineQueueConfig {
        &self.config
    }
}
