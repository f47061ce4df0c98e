//! 状态管理模块 - 版本化、可订阅的键值状态仓库
//!
//! 功能包括：
//! - 按 key 注册状态切片，每次更新版本号恰好加 1
//! - 中间件管线（按注册顺序串联）
//! - 同步通知订阅者（订阅时立即回放当前值）
//! - 全局 `state:changed` 事件
//! - 可选持久化（`state:{key}`）
//!
//! 状态管理器通过构造显式创建并注入，不是全局单例。
//!
//! 所有提交（读取旧值、中间件、写入、通知）在一把可重入的提交锁内串行执行：
//! 其他线程的更新排队等待；同一线程在中间件或订阅者中可以更新其他 key，
//! 但不能再次更新正在提交的 key。订阅者不应阻塞等待其他线程的状态更新。

use parking_lot::{ReentrantMutex, ReentrantMutexGuard, RwLock};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, error, warn};

use crate::error::{RealmError, Result};
use crate::events::{EventBus, RealmEvent};
use crate::storage::{keys, SharedStorage};
use crate::utils::{SharedClock, SystemClock};

pub mod middleware;
mod slice;

pub use middleware::StateMiddleware;
pub use slice::{RegisterOptions, SlicePatch, StateSlice, UpdateOptions, Updater};
use slice::PersistedState;

/// 订阅者回调
pub type StateSubscriber = Arc<dyn Fn(&StateSlice) -> Result<()> + Send + Sync>;

type SubscriberMap = HashMap<String, Vec<(u64, StateSubscriber)>>;

/// 取消订阅句柄，只移除对应的那一个订阅者
#[must_use = "丢弃句柄不会取消订阅，需要调用 unsubscribe()"]
pub struct Unsubscribe {
    subscribers: Weak<RwLock<SubscriberMap>>,
    key: String,
    id: u64,
}

impl Unsubscribe {
    pub fn unsubscribe(self) {
        if let Some(subscribers) = self.subscribers.upgrade() {
            let mut map = subscribers.write();
            if let Some(list) = map.get_mut(&self.key) {
                list.retain(|(id, _)| *id != self.id);
                if list.is_empty() {
                    map.remove(&self.key);
                }
            }
        }
    }
}

impl std::fmt::Debug for Unsubscribe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Unsubscribe")
            .field("key", &self.key)
            .field("id", &self.id)
            .finish()
    }
}

/// 提交锁内记录当前线程正在更新的 key
type InFlightKeys = RefCell<HashSet<String>>;

/// 持有提交锁期间的某个 key 更新，离开作用域时释放
struct CommitGuard<'a> {
    guard: ReentrantMutexGuard<'a, InFlightKeys>,
    key: String,
}

impl Drop for CommitGuard<'_> {
    fn drop(&mut self) {
        self.guard.borrow_mut().remove(&self.key);
    }
}

/// 状态管理器
pub struct StateManager {
    slices: RwLock<HashMap<String, StateSlice>>,
    /// 注册时的初始数据（reset 使用）
    initial: RwLock<HashMap<String, Value>>,
    subscribers: Arc<RwLock<SubscriberMap>>,
    middleware: RwLock<Vec<StateMiddleware>>,
    persisted: RwLock<HashSet<String>>,
    /// 串行化所有提交；同一线程可重入（中间件/订阅者里更新其他 key）
    commit_lock: ReentrantMutex<InFlightKeys>,
    next_subscriber_id: AtomicU64,
    events: Arc<EventBus>,
    storage: Option<SharedStorage>,
    clock: SharedClock,
}

impl std::fmt::Debug for StateManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateManager")
            .field("keys", &self.keys())
            .field("middleware", &self.middleware.read().len())
            .field("persistent", &self.storage.is_some())
            .finish()
    }
}

impl StateManager {
    /// 创建不带持久化的状态管理器
    pub fn new(events: Arc<EventBus>) -> Self {
        Self {
            slices: RwLock::new(HashMap::new()),
            initial: RwLock::new(HashMap::new()),
            subscribers: Arc::new(RwLock::new(HashMap::new())),
            middleware: RwLock::new(Vec::new()),
            persisted: RwLock::new(HashSet::new()),
            commit_lock: ReentrantMutex::new(RefCell::new(HashSet::new())),
            next_subscriber_id: AtomicU64::new(1),
            events,
            storage: None,
            clock: SystemClock::shared(),
        }
    }

    /// 指定持久化存储
    pub fn with_storage(mut self, storage: SharedStorage) -> Self {
        self.storage = Some(storage);
        self
    }

    /// 指定时间源
    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    /// 注册状态切片；重复注册直接覆盖
    pub fn register<V: Into<Value>>(&self, key: &str, initial_data: V, options: RegisterOptions) {
        let data = initial_data.into();
        let slice = StateSlice::new(data.clone(), self.clock.now_ms());
        let _commit = self.commit_lock.lock();

        self.slices.write().insert(key.to_string(), slice);
        self.initial.write().insert(key.to_string(), data);
        debug!("注册状态切片: {} (persist={})", key, options.persist);

        if options.persist {
            self.persisted.write().insert(key.to_string());
            self.load_persisted_state(key);
        }
    }

    /// 更新切片数据
    ///
    /// 未注册的 key 返回 `NotRegistered`；同一 key 在自身中间件/通知阶段被再次更新
    /// 返回 `ReentrantUpdate`。
    pub fn update<'a, U>(&self, key: &str, updater: U, options: UpdateOptions) -> Result<StateSlice>
    where
        U: Into<Updater<'a>>,
    {
        let updater = updater.into();
        let now = self.clock.now_ms();
        self.commit(key, options, |prev| {
            let data = updater.resolve(&prev.data);
            prev.next_with_data(data, now)
        })
    }

    /// 局部合并更新（loading / error / data）
    pub fn update_slice(&self, key: &str, patch: SlicePatch, options: UpdateOptions) -> Result<StateSlice> {
        let now = self.clock.now_ms();
        self.commit(key, options, |prev| prev.next_with_patch(patch, now))
    }

    /// 以强类型方式更新
    pub fn update_with<T, F>(&self, key: &str, f: F, options: UpdateOptions) -> Result<StateSlice>
    where
        T: DeserializeOwned + Serialize,
        F: FnOnce(T) -> T,
    {
        let current: T = match self.select(key) {
            Some(data) => serde_json::from_value(data)?,
            None => return Err(RealmError::NotRegistered(key.to_string())),
        };
        let next = serde_json::to_value(f(current))?;
        self.update(key, next, options)
    }

    /// 获取提交锁；其他线程的提交在此排队，同一线程对同一 key 的嵌套更新被拒绝
    fn enter(&self, key: &str) -> Result<CommitGuard<'_>> {
        let guard = self.commit_lock.lock();
        if !guard.borrow_mut().insert(key.to_string()) {
            warn!("检测到对切片 {} 的重入更新，已拒绝", key);
            return Err(RealmError::ReentrantUpdate(key.to_string()));
        }
        Ok(CommitGuard {
            guard,
            key: key.to_string(),
        })
    }

    fn commit<F>(&self, key: &str, options: UpdateOptions, build: F) -> Result<StateSlice>
    where
        F: FnOnce(&StateSlice) -> StateSlice,
    {
        let _guard = self.enter(key)?;
        let previous = self
            .slices
            .read()
            .get(key)
            .cloned()
            .ok_or_else(|| RealmError::NotRegistered(key.to_string()))?;

        let candidate = build(&previous);
        let mut next = self.apply_middleware(key, &previous, candidate);
        if next.version != previous.version + 1 {
            debug!("中间件修改了 {} 的版本号，已恢复", key);
            next.version = previous.version + 1;
        }

        self.slices.write().insert(key.to_string(), next.clone());

        self.notify(key, &next);
        self.events.emit(RealmEvent::StateChanged {
            key: key.to_string(),
            previous: Some(previous),
            current: next.clone(),
        });

        let persisted = self.persisted.read().contains(key);
        if persisted && options.persist != Some(false) {
            self.persist_state(key, &next);
        }

        Ok(next)
    }

    fn apply_middleware(&self, key: &str, previous: &StateSlice, candidate: StateSlice) -> StateSlice {
        let chain: Vec<StateMiddleware> = self.middleware.read().clone();
        chain.iter().enumerate().fold(candidate, |current, (index, mw)| {
            match mw(key, previous, &current) {
                Ok(next) => next,
                Err(e) => {
                    warn!("状态中间件 #{} 处理 {} 失败，已跳过: {}", index, key, e);
                    current
                }
            }
        })
    }

    fn notify(&self, key: &str, slice: &StateSlice) {
        let targets: Vec<StateSubscriber> = self
            .subscribers
            .read()
            .get(key)
            .map(|list| list.iter().map(|(_, s)| s.clone()).collect())
            .unwrap_or_default();

        for subscriber in targets {
            if let Err(e) = subscriber(slice) {
                error!("状态订阅者处理 {} 失败: {}", key, e);
            }
        }
    }

    /// 读取切片数据
    pub fn select(&self, key: &str) -> Option<Value> {
        self.slices.read().get(key).map(|s| s.data.clone())
    }

    /// 读取并反序列化切片数据
    pub fn select_as<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.select(key).and_then(|data| serde_json::from_value(data).ok())
    }

    /// 读取完整切片
    pub fn select_slice(&self, key: &str) -> Option<StateSlice> {
        self.slices.read().get(key).cloned()
    }

    /// 已注册的 key（按字典序）
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.slices.read().keys().cloned().collect();
        keys.sort();
        keys
    }

    /// 订阅切片变化；key 已存在时立即以当前值回调一次
    pub fn subscribe<F>(&self, key: &str, subscriber: F) -> Unsubscribe
    where
        F: Fn(&StateSlice) -> Result<()> + Send + Sync + 'static,
    {
        let id = self.next_subscriber_id.fetch_add(1, Ordering::Relaxed);
        let subscriber: StateSubscriber = Arc::new(subscriber);
        self.subscribers
            .write()
            .entry(key.to_string())
            .or_default()
            .push((id, subscriber.clone()));

        if let Some(current) = self.select_slice(key) {
            if let Err(e) = subscriber(&current) {
                error!("状态订阅者回放 {} 失败: {}", key, e);
            }
        }

        Unsubscribe {
            subscribers: Arc::downgrade(&self.subscribers),
            key: key.to_string(),
            id,
        }
    }

    /// 追加中间件
    pub fn use_middleware(&self, middleware: StateMiddleware) {
        self.middleware.write().push(middleware);
    }

    fn persist_state(&self, key: &str, slice: &StateSlice) {
        let Some(storage) = &self.storage else {
            return;
        };

        let record = PersistedState {
            data: slice.data.clone(),
            version: slice.version,
            timestamp: self.clock.now_ms(),
        };
        let result = serde_json::to_string(&record)
            .map_err(RealmError::from)
            .and_then(|json| storage.set_item(&keys::state_key(key), &json));

        if let Err(e) = result {
            error!("持久化状态 {} 失败: {}", key, e);
        }
    }

    /// 读取持久化的切片数据并通过正常更新路径应用（不会再次写回）
    ///
    /// 返回是否成功应用。
    pub fn load_persisted_state(&self, key: &str) -> bool {
        let Some(storage) = &self.storage else {
            return false;
        };

        let raw = match storage.get_item(&keys::state_key(key)) {
            Ok(Some(raw)) => raw,
            Ok(None) => return false,
            Err(e) => {
                error!("读取持久化状态 {} 失败: {}", key, e);
                return false;
            }
        };

        let record: PersistedState = match serde_json::from_str(&raw) {
            Ok(record) => record,
            Err(e) => {
                warn!("持久化状态 {} 格式错误，已忽略: {}", key, e);
                return false;
            }
        };

        match self.update(key, record.data, UpdateOptions::skip_persist()) {
            Ok(slice) => {
                debug!("已恢复持久化状态 {} (stored v{}, now v{})", key, record.version, slice.version);
                true
            }
            Err(e) => {
                error!("应用持久化状态 {} 失败: {}", key, e);
                false
            }
        }
    }

    /// 恢复为注册时的初始数据（走更新管线，版本号继续递增）
    pub fn reset(&self, key: &str) -> Result<StateSlice> {
        let initial = self
            .initial
            .read()
            .get(key)
            .cloned()
            .ok_or_else(|| RealmError::NotRegistered(key.to_string()))?;
        let patch = SlicePatch::new().data(initial).loading(false).clear_error();
        self.update_slice(key, patch, UpdateOptions::default())
    }

    /// 重置所有切片
    pub fn reset_all(&self) -> Result<()> {
        for key in self.keys() {
            self.reset(&key)?;
        }
        Ok(())
    }

    /// 一次性清空所有切片、订阅者和持久化标记（不删除存储中的数据）
    pub fn clear(&self) {
        let mut slices = self.slices.write();
        let mut initial = self.initial.write();
        let mut subscribers = self.subscribers.write();
        let mut persisted = self.persisted.write();
        slices.clear();
        initial.clear();
        subscribers.clear();
        persisted.clear();
        debug!("状态管理器已清空");
    }
}
