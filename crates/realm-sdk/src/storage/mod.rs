//! 存储模块 - 持久化键值存储抽象
//!
//! 缓存、离线队列和状态管理器的持久化都通过 [`KeyValueStorage`] 完成，
//! 各自使用独立的 key 前缀，互不冲突：
//!
//! | 使用方 | key |
//! |--------|-----|
//! | 持久化缓存 | `cache:{name}:{key}` |
//! | 离线队列 | `offline-queue` |
//! | 状态管理器 | `state:{key}` |
//!
//! 写入可能返回 [`RealmError::QuotaExceeded`](crate::RealmError::QuotaExceeded)，
//! 调用方据此与其他写入错误区分。

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::Result;

pub mod kv;
pub mod memory;

pub use kv::SledStorage;
pub use memory::MemoryStorage;

/// 常用的 key 前缀常量
pub mod keys {
    /// 持久化缓存前缀
    pub const CACHE_PREFIX: &str = "cache:";
    /// 离线队列（整个队列序列化为一个 JSON 数组）
    pub const OFFLINE_QUEUE: &str = "offline-queue";
    /// 状态切片前缀
    pub const STATE_PREFIX: &str = "state:";

    /// 缓存命名空间前缀
    pub fn cache_namespace(name: &str) -> String {
        format!("{}{}:", CACHE_PREFIX, name)
    }

    /// 状态切片的完整 key
    pub fn state_key(key: &str) -> String {
        format!("{}{}", STATE_PREFIX, key)
    }
}

/// 存储统计信息
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageStats {
    pub key_count: usize,
    pub used_bytes: usize,
    pub quota_bytes: Option<usize>,
}

/// 键值存储 trait（同步调用，可能失败）
pub trait KeyValueStorage: Send + Sync + std::fmt::Debug {
    fn get_item(&self, key: &str) -> Result<Option<String>>;

    /// 写入；超出配额时返回 `QuotaExceeded`
    fn set_item(&self, key: &str, value: &str) -> Result<()>;

    fn remove_item(&self, key: &str) -> Result<()>;

    /// 所有 key（按 key 排序）
    fn keys(&self) -> Result<Vec<String>>;

    fn len(&self) -> Result<usize> {
        Ok(self.keys()?.len())
    }

    fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// 指定前缀的所有 key
    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .keys()?
            .into_iter()
            .filter(|k| k.starts_with(prefix))
            .collect())
    }

    /// 落盘（内存实现为空操作）
    fn flush(&self) -> Result<()> {
        Ok(())
    }

    fn stats(&self) -> Result<StorageStats>;
}

/// 共享存储句柄
pub type SharedStorage = Arc<dyn KeyValueStorage>;

/// 计算一组键值对占用的字节数
pub(crate) fn entry_bytes(key: &str, value: &str) -> usize {
    key.len() + value.len()
}
