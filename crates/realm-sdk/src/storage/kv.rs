//! KV 存储模块 - 基于 sled 的持久化键值存储
//!
//! 本模块提供：
//! - 落盘的键值存储（每个账号/实例一个 Tree 命名空间）
//! - 可选字节配额，超出时返回 `QuotaExceeded`
//! - 打开数据库时的锁冲突退避重试

use std::path::{Path, PathBuf};
use std::time::Duration;

use sled::{Db, Tree};
use tracing::{info, warn};

use super::{entry_bytes, KeyValueStorage, StorageStats};
use crate::error::{RealmError, Result};

/// sled 键值存储
#[derive(Debug)]
pub struct SledStorage {
    path: PathBuf,
    db: Db,
    tree: Tree,
    quota_bytes: Option<usize>,
}

impl SledStorage {
    /// 打开（或创建）`base_path/kv` 下的数据库，并使用 `namespace` 对应的 Tree
    pub fn open(base_path: &Path, namespace: &str) -> Result<Self> {
        Self::open_with_quota(base_path, namespace, None)
    }

    pub fn open_with_quota(
        base_path: &Path,
        namespace: &str,
        quota_bytes: Option<usize>,
    ) -> Result<Self> {
        let kv_path = base_path.join("kv");
        std::fs::create_dir_all(&kv_path)
            .map_err(|e| RealmError::IO(format!("创建 KV 存储目录失败: {}", e)))?;

        let db = Self::open_db(&kv_path)?;
        let tree_name = format!("realm_{}", namespace);
        let tree = db
            .open_tree(&tree_name)
            .map_err(|e| RealmError::KvStore(format!("打开 Tree 失败: {}", e)))?;

        info!("KV 存储已打开: {} (tree={})", kv_path.display(), tree_name);

        Ok(Self {
            path: kv_path,
            db,
            tree,
            quota_bytes,
        })
    }

    /// 打开 sled 数据库（上一个实例可能刚释放锁，带退避重试）
    fn open_db(kv_path: &Path) -> Result<Db> {
        const MAX_OPEN_RETRIES: u32 = 5;
        const RETRY_DELAY_MS: u64 = 100;

        let mut last_err: Option<sled::Error> = None;
        for attempt in 0..MAX_OPEN_RETRIES {
            match sled::open(kv_path) {
                Ok(db) => return Ok(db),
                Err(e) => {
                    let msg = e.to_string();
                    let is_lock = msg.contains("could not acquire lock")
                        || msg.contains("Resource temporarily unavailable")
                        || msg.contains("WouldBlock");
                    last_err = Some(e);
                    if is_lock && attempt + 1 < MAX_OPEN_RETRIES {
                        let delay_ms = RETRY_DELAY_MS * (1 << attempt);
                        warn!("sled 数据库被占用，{}ms 后重试 (第 {} 次)", delay_ms, attempt + 1);
                        std::thread::sleep(Duration::from_millis(delay_ms));
                    } else {
                        break;
                    }
                }
            }
        }

        Err(RealmError::KvStore(
            last_err
                .map(|e| format!("打开 sled 数据库失败: {}", e))
                .unwrap_or_else(|| "打开 sled 数据库失败".to_string()),
        ))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn used_bytes(&self) -> Result<usize> {
        let mut total = 0usize;
        for item in self.tree.iter() {
            let (k, v) = item.map_err(|e| RealmError::KvStore(format!("遍历键值对失败: {}", e)))?;
            total += k.len() + v.len();
        }
        Ok(total)
    }
}

impl KeyValueStorage for SledStorage {
    fn get_item(&self, key: &str) -> Result<Option<String>> {
        let value = self
            .tree
            .get(key)
            .map_err(|e| RealmError::KvStore(format!("获取键值对失败: {}", e)))?;

        match value {
            Some(bytes) => {
                let text = String::from_utf8(bytes.to_vec())
                    .map_err(|e| RealmError::Serialization(format!("值不是合法 UTF-8: {}", e)))?;
                Ok(Some(text))
            }
            None => Ok(None),
        }
    }

    fn set_item(&self, key: &str, value: &str) -> Result<()> {
        if let Some(quota) = self.quota_bytes {
            let replaced = self
                .tree
                .get(key)
                .map_err(|e| RealmError::KvStore(format!("获取键值对失败: {}", e)))?
                .map(|old| key.len() + old.len())
                .unwrap_or(0);
            let projected = self.used_bytes()? - replaced + entry_bytes(key, value);
            if projected > quota {
                return Err(RealmError::QuotaExceeded(format!(
                    "写入 {} 需要 {} 字节，配额 {} 字节",
                    key, projected, quota
                )));
            }
        }

        self.tree
            .insert(key, value.as_bytes())
            .map_err(|e| RealmError::KvStore(format!("设置键值对失败: {}", e)))?;
        Ok(())
    }

    fn remove_item(&self, key: &str) -> Result<()> {
        self.tree
            .remove(key)
            .map_err(|e| RealmError::KvStore(format!("删除键值对失败: {}", e)))?;
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        for item in self.tree.iter().keys() {
            let key = item.map_err(|e| RealmError::KvStore(format!("遍历键失败: {}", e)))?;
            keys.push(String::from_utf8_lossy(&key).into_owned());
        }
        Ok(keys)
    }

    fn len(&self) -> Result<usize> {
        Ok(self.tree.len())
    }

    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        for item in self.tree.scan_prefix(prefix).keys() {
            let key = item.map_err(|e| RealmError::KvStore(format!("扫描前缀失败: {}", e)))?;
            keys.push(String::from_utf8_lossy(&key).into_owned());
        }
        Ok(keys)
    }

    fn flush(&self) -> Result<()> {
        self.db
            .flush()
            .map_err(|e| RealmError::KvStore(format!("落盘失败: {}", e)))?;
        Ok(())
    }

    fn stats(&self) -> Result<StorageStats> {
        Ok(StorageStats {
            key_count: self.tree.len(),
            used_bytes: self.used_bytes()?,
            quota_bytes: self.quota_bytes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_sled_storage_basic_operations() {
        let temp_dir = TempDir::new().unwrap();
        let storage = SledStorage::open(temp_dir.path(), "test_user").unwrap();

        storage.set_item("state:player", "{\"level\":3}").unwrap();
        assert_eq!(
            storage.get_item("state:player").unwrap().as_deref(),
            Some("{\"level\":3}")
        );
        assert!(storage.get_item("missing").unwrap().is_none());

        storage.remove_item("state:player").unwrap();
        assert!(storage.get_item("state:player").unwrap().is_none());
    }

    #[test]
    fn test_sled_storage_prefix_scan() {
        let temp_dir = TempDir::new().unwrap();
        let storage = SledStorage::open(temp_dir.path(), "scan").unwrap();

        storage.set_item("cache:api:b", "2").unwrap();
        storage.set_item("cache:api:a", "1").unwrap();
        storage.set_item("offline-queue", "[]").unwrap();

        let keys = storage.keys_with_prefix("cache:api:").unwrap();
        assert_eq!(keys, vec!["cache:api:a".to_string(), "cache:api:b".to_string()]);
        assert_eq!(storage.len().unwrap(), 3);
    }

    #[test]
    fn test_sled_storage_persists_across_reopen() {
        let temp_dir = TempDir::new().unwrap();
        {
            let storage = SledStorage::open(temp_dir.path(), "reopen").unwrap();
            storage.set_item("offline-queue", "[1,2]").unwrap();
            storage.flush().unwrap();
        }

        let storage = SledStorage::open(temp_dir.path(), "reopen").unwrap();
        assert_eq!(storage.get_item("offline-queue").unwrap().as_deref(), Some("[1,2]"));
    }

    #[test]
    fn test_sled_storage_quota() {
        let temp_dir = TempDir::new().unwrap();
        let storage = SledStorage::open_with_quota(temp_dir.path(), "quota", Some(16)).unwrap();

        storage.set_item("k1", "0123456789").unwrap();
        let err = storage.set_item("k2", "0123456789").unwrap_err();
        assert!(err.is_quota_exceeded());

        let stats = storage.stats().unwrap();
        assert_eq!(stats.key_count, 1);
        assert_eq!(stats.quota_bytes, Some(16));
    }
}
