//! Realm SDK - MMORPG 客户端的实时、状态、缓存与离线层
//!
//! 本 SDK 提供：
//! - 📡 实时会话：断线缓冲、重连自动重新订阅、频道分发、心跳
//! - 🧠 状态管理：版本化切片、中间件管线、同步订阅、可选持久化
//! - 🗄️ 缓存：TTL 惰性过期、按数量淘汰，内存/持久化后端
//! - 📮 离线队列：离线写操作的上限、过期与重试记账
//!
//! # 快速开始
//!
//! ```rust,no_run
//! use realm_sdk::{RealmClient, RealmConfig, RegisterOptions, UpdateOptions, Updater};
//! use serde_json::json;
//!
//! # fn main() -> realm_sdk::Result<()> {
//! let config = RealmConfig::builder()
//!     .data_dir("/path/to/data")
//!     .namespace("hero_42")
//!     .build()?;
//! let client = RealmClient::new(config)?;
//!
//! let store = client.store();
//! store.register("counter", json!({"count": 0}), RegisterOptions::default());
//! store.update(
//!     "counter",
//!     Updater::apply(|c| json!({"count": c["count"].as_i64().unwrap_or(0) + 1})),
//!     UpdateOptions::default(),
//! )?;
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod character;
pub mod client;
pub mod config;
pub mod error;
pub mod events;
pub mod offline;
pub mod realtime;
pub mod state;
pub mod storage;
pub mod utils;
pub mod version;

// 重新导出核心类型，方便使用
pub use cache::{CacheBackend, CacheBackendTrait, CacheEntry, CacheService, CacheStats, CacheStorage, SetOptions};
pub use character::{CharacterRealtime, CharacterState};
pub use client::RealmClient;
pub use config::{CacheConfig, OfflineQueueConfig, RealmConfig, RealmConfigBuilder, RealtimeConfig, StoreConfig};
pub use error::{RealmError, Result};
pub use events::{EventBus, RealmEvent};
pub use offline::{HttpMethod, OfflineOperation, OfflineQueue, PendingOperation, ProcessResult, QueueStorage};
pub use realtime::{
    InboundMessage, RealtimeService, RealtimeStats, RealtimeTransport, SubscriptionId, SubscriptionOptions,
    TransportEvent, TransportEventKind,
};
pub use state::{RegisterOptions, SlicePatch, StateManager, StateSlice, UpdateOptions, Updater};
pub use storage::{KeyValueStorage, MemoryStorage, SharedStorage, SledStorage};
pub use utils::{Clock, ManualClock, SystemClock};
pub use version::SDK_VERSION;

/// 安装全局 fmt 日志订阅器；重复调用返回 false
pub fn init_logging(level: &str) -> bool {
    let level = level.parse::<tracing::Level>().unwrap_or(tracing::Level::INFO);
    let installed = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .try_init()
        .is_ok();
    if installed {
        tracing::info!("Realm SDK {} 日志已初始化 ({})", version::version_string(), level);
    }
    installed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_logging_is_idempotent() {
        let first = init_logging("debug");
        let second = init_logging("not-a-level");
        assert!(!(first && second));
        assert!(!second);
    }
}
