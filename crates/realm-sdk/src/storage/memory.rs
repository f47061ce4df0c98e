//! 内存键值存储，可选字节配额
//!
//! 行为与浏览器 localStorage 一致：超出配额的写入失败并返回
//! `QuotaExceeded`，原值保持不变。

use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

use super::{entry_bytes, KeyValueStorage, StorageStats};
use crate::error::{RealmError, Result};

#[derive(Debug, Default)]
pub struct MemoryStorage {
    items: RwLock<BTreeMap<String, String>>,
    quota_bytes: Option<usize>,
    read_only: AtomicBool,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// 带字节配额的存储
    pub fn with_quota(quota_bytes: usize) -> Self {
        Self {
            quota_bytes: Some(quota_bytes),
            ..Self::default()
        }
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// 只读模式下所有写入返回 `KvStore` 错误（非配额错误）
    pub fn set_read_only(&self, read_only: bool) {
        self.read_only.store(read_only, Ordering::SeqCst);
    }

    fn used_bytes(items: &BTreeMap<String, String>) -> usize {
        items.iter().map(|(k, v)| entry_bytes(k, v)).sum()
    }
}

impl KeyValueStorage for MemoryStorage {
    fn get_item(&self, key: &str) -> Result<Option<String>> {
        Ok(self.items.read().get(key).cloned())
    }

    fn set_item(&self, key: &str, value: &str) -> Result<()> {
        if self.read_only.load(Ordering::SeqCst) {
            return Err(RealmError::KvStore(format!("存储只读，拒绝写入: {}", key)));
        }

        let mut items = self.items.write();
        if let Some(quota) = self.quota_bytes {
            let current = Self::used_bytes(&items);
            let replaced = items.get(key).map(|old| entry_bytes(key, old)).unwrap_or(0);
            let projected = current - replaced + entry_bytes(key, value);
            if projected > quota {
                debug!("写入超出配额: key={}, {} > {}", key, projected, quota);
                return Err(RealmError::QuotaExceeded(format!(
                    "写入 {} 需要 {} 字节，配额 {} 字节",
                    key, projected, quota
                )));
            }
        }
        items.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove_item(&self, key: &str) -> Result<()> {
        if self.read_only.load(Ordering::SeqCst) {
            return Err(RealmError::KvStore(format!("存储只读，拒绝删除: {}", key)));
        }
        self.items.write().remove(key);
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>> {
        Ok(self.items.read().keys().cloned().collect())
    }

    fn len(&self) -> Result<usize> {
        Ok(self.items.read().len())
    }

    fn stats(&self) -> Result<StorageStats> {
        let items = self.items.read();
        Ok(StorageStats {
            key_count: items.len(),
            used_bytes: Self::used_bytes(&items),
            quota_bytes: self.quota_bytes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_storage_basic_operations() {
        let storage = MemoryStorage::new();

        storage.set_item("state:player", "{\"hp\":10}").unwrap();
        assert_eq!(
            storage.get_item("state:player").unwrap().as_deref(),
            Some("{\"hp\":10}")
        );
        assert_eq!(storage.len().unwrap(), 1);

        storage.remove_item("state:player").unwrap();
        assert!(storage.get_item("state:player").unwrap().is_none());
        assert!(storage.is_empty().unwrap());
    }

    #[test]
    fn test_memory_storage_quota() {
        // "a" + "12345" = 6 字节
        let storage = MemoryStorage::with_quota(10);
        storage.set_item("a", "12345").unwrap();

        let err = storage.set_item("b", "123456").unwrap_err();
        assert!(err.is_quota_exceeded());
        assert!(storage.get_item("b").unwrap().is_none());

        // 覆盖写只计算差值
        storage.set_item("a", "123456789").unwrap();
        assert_eq!(storage.stats().unwrap().used_bytes, 10);
    }

    #[test]
    fn test_memory_storage_read_only_is_not_quota_error() {
        let storage = MemoryStorage::new();
        storage.set_read_only(true);

        let err = storage.set_item("k", "v").unwrap_err();
        assert!(!err.is_quota_exceeded());
        assert!(matches!(err, RealmError::KvStore(_)));
    }

    #[test]
    fn test_keys_with_prefix() {
        let storage = MemoryStorage::new();
        storage.set_item("cache:api:a", "1").unwrap();
        storage.set_item("cache:api:b", "2").unwrap();
        storage.set_item("state:x", "3").unwrap();

        let keys = storage.keys_with_prefix("cache:api:").unwrap();
        assert_eq!(keys, vec!["cache:api:a".to_string(), "cache:api:b".to_string()]);
    }
}
