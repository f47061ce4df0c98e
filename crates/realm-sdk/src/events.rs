//! 事件系统模块 - 本地事件总线
//!
//! 功能包括：
//! - 实时连接事件（断开、错误）
//! - 实时消息事件（`message:{channel}:{event}`）
//! - 状态变更事件（`state:changed`）
//! - 按事件名注册监听器，`*` 监听所有事件
//! - 广播通道订阅（供异步消费者使用）
//!
//! 监听器同步执行；单个监听器返回错误只记录日志，不影响其他监听器。

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::error::Result;
use crate::state::StateSlice;

/// 事件名常量
pub mod names {
    pub const REALTIME_DISCONNECTED: &str = "realtime:disconnected";
    pub const REALTIME_ERROR: &str = "realtime:error";
    pub const STATE_CHANGED: &str = "state:changed";
    /// 通配监听
    pub const ALL: &str = "*";

    /// 实时消息事件名
    pub fn message(channel: &str, event: &str) -> String {
        format!("message:{}:{}", channel, event)
    }
}

/// SDK 本地事件
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum RealmEvent {
    /// 实时连接断开
    RealtimeDisconnected { timestamp: i64 },
    /// 实时连接错误
    RealtimeError { error: String, timestamp: i64 },
    /// 收到实时消息（无论是否有订阅匹配都会发出）
    Message {
        channel: String,
        event: String,
        data: Value,
        timestamp: i64,
    },
    /// 状态切片变更
    StateChanged {
        key: String,
        previous: Option<StateSlice>,
        current: StateSlice,
    },
}

impl RealmEvent {
    /// 获取事件名
    pub fn event_name(&self) -> String {
        match self {
            RealmEvent::RealtimeDisconnected { .. } => names::REALTIME_DISCONNECTED.to_string(),
            RealmEvent::RealtimeError { .. } => names::REALTIME_ERROR.to_string(),
            RealmEvent::Message { channel, event, .. } => names::message(channel, event),
            RealmEvent::StateChanged { .. } => names::STATE_CHANGED.to_string(),
        }
    }

    /// 事件负载：消息事件只携带 `data`
    pub fn payload(&self) -> Value {
        match self {
            RealmEvent::RealtimeDisconnected { .. } => Value::Null,
            RealmEvent::RealtimeError { error, .. } => Value::String(error.clone()),
            RealmEvent::Message { data, .. } => data.clone(),
            RealmEvent::StateChanged { key, previous, current } => serde_json::json!({
                "key": key,
                "previous": previous,
                "current": current,
            }),
        }
    }

    /// 获取事件时间戳
    pub fn timestamp(&self) -> i64 {
        match self {
            RealmEvent::RealtimeDisconnected { timestamp } => *timestamp,
            RealmEvent::RealtimeError { timestamp, .. } => *timestamp,
            RealmEvent::Message { timestamp, .. } => *timestamp,
            RealmEvent::StateChanged { current, .. } => current.last_updated,
        }
    }
}

/// 监听器 ID
pub type ListenerId = u64;

/// 事件监听器类型
pub type EventListener = Arc<dyn Fn(&RealmEvent) -> Result<()> + Send + Sync>;

/// 事件统计信息
#[derive(Debug, Clone, Default)]
pub struct EventStats {
    /// 总事件数
    pub total_events: u64,
    /// 按事件名分组的事件数
    pub events_by_name: HashMap<String, u64>,
    /// 监听器返回错误的次数
    pub listener_errors: u64,
    /// 监听器数量
    pub listener_count: usize,
    /// 最后事件时间
    pub last_event_time: Option<i64>,
}

/// 事件总线
pub struct EventBus {
    /// 广播发送器
    sender: broadcast::Sender<RealmEvent>,
    /// 事件名 -> 监听器（按注册顺序）
    listeners: RwLock<HashMap<String, Vec<(ListenerId, EventListener)>>>,
    next_id: AtomicU64,
    stats: RwLock<EventStats>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("listener_count", &self.listener_count())
            .field("subscriber_count", &self.subscriber_count())
            .finish()
    }
}

impl EventBus {
    /// 创建新的事件总线
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));

        Self {
            sender,
            listeners: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            stats: RwLock::new(EventStats::default()),
        }
    }

    /// 发布事件
    pub fn emit(&self, event: RealmEvent) {
        let name = event.event_name();
        debug!("Emitting event: {}", name);

        {
            let mut stats = self.stats.write();
            stats.total_events += 1;
            *stats.events_by_name.entry(name.clone()).or_insert(0) += 1;
            stats.last_event_time = Some(event.timestamp());
        }

        // 先拷贝出监听器再调用，监听器内部可以继续注册/发布
        let targets: Vec<EventListener> = {
            let listeners = self.listeners.read();
            listeners
                .get(&name)
                .into_iter()
                .chain(listeners.get(names::ALL))
                .flat_map(|list| list.iter().map(|(_, l)| l.clone()))
                .collect()
        };

        let mut failures = 0u64;
        for listener in targets {
            if let Err(e) = listener(&event) {
                failures += 1;
                warn!("事件监听器执行失败 ({}): {}", name, e);
            }
        }
        if failures > 0 {
            self.stats.write().listener_errors += failures;
        }

        // 无订阅者时 send 会失败，属正常场景
        if let Err(e) = self.sender.send(event) {
            debug!("Failed to broadcast event (no active receivers): {}", e);
        }
    }

    /// 添加事件监听器，返回监听器 ID
    pub fn on<F>(&self, event_name: &str, listener: F) -> ListenerId
    where
        F: Fn(&RealmEvent) -> Result<()> + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut listeners = self.listeners.write();
        listeners
            .entry(event_name.to_string())
            .or_default()
            .push((id, Arc::new(listener)));

        self.stats.write().listener_count = listeners.values().map(|v| v.len()).sum();
        debug!("Added listener {} for event: {}", id, event_name);
        id
    }

    /// 移除指定监听器，返回是否存在
    pub fn off(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write();
        let mut removed = false;
        for list in listeners.values_mut() {
            let before = list.len();
            list.retain(|(lid, _)| *lid != id);
            removed |= list.len() != before;
        }
        listeners.retain(|_, list| !list.is_empty());

        self.stats.write().listener_count = listeners.values().map(|v| v.len()).sum();
        removed
    }

    /// 移除所有监听器
    pub fn clear_listeners(&self) {
        self.listeners.write().clear();
        self.stats.write().listener_count = 0;
        debug!("Cleared all event listeners");
    }

    /// 订阅所有事件（广播通道）
    pub fn subscribe(&self) -> broadcast::Receiver<RealmEvent> {
        self.sender.subscribe()
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.read().values().map(|v| v.len()).sum()
    }

    /// 获取活跃广播订阅者数量
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn stats(&self) -> EventStats {
        self.stats.read().clone()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RealmError;
    use std::sync::atomic::AtomicUsize;

    fn message_event(channel: &str, event: &str) -> RealmEvent {
        RealmEvent::Message {
            channel: channel.to_string(),
            event: event.to_string(),
            data: serde_json::json!({"hp": 42}),
            timestamp: 1,
        }
    }

    #[test]
    fn test_event_names() {
        assert_eq!(message_event("combat", "hit").event_name(), "message:combat:hit");
        assert_eq!(
            RealmEvent::RealtimeDisconnected { timestamp: 0 }.event_name(),
            "realtime:disconnected"
        );
        assert_eq!(message_event("combat", "hit").payload(), serde_json::json!({"hp": 42}));
    }

    #[test]
    fn test_listeners_by_name_and_wildcard() {
        let bus = EventBus::new(16);
        let named = Arc::new(AtomicUsize::new(0));
        let all = Arc::new(AtomicUsize::new(0));

        let named_clone = named.clone();
        bus.on("message:combat:hit", move |_| {
            named_clone.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        let all_clone = all.clone();
        bus.on(names::ALL, move |_| {
            all_clone.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        bus.emit(message_event("combat", "hit"));
        bus.emit(message_event("chat", "say"));

        assert_eq!(named.load(Ordering::SeqCst), 1);
        assert_eq!(all.load(Ordering::SeqCst), 2);
        assert_eq!(bus.stats().total_events, 2);
    }

    #[test]
    fn test_failing_listener_does_not_block_others() {
        let bus = EventBus::new(16);
        let counter = Arc::new(AtomicUsize::new(0));

        bus.on(names::REALTIME_ERROR, |_| Err(RealmError::handler("boom")));
        let counter_clone = counter.clone();
        bus.on(names::REALTIME_ERROR, move |_| {
            counter_clone.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        bus.emit(RealmEvent::RealtimeError {
            error: "socket closed".to_string(),
            timestamp: 1,
        });

        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(bus.stats().listener_errors, 1);
    }

    #[test]
    fn test_off_and_clear() {
        let bus = EventBus::new(16);
        let id = bus.on(names::STATE_CHANGED, |_| Ok(()));
        bus.on(names::ALL, |_| Ok(()));
        assert_eq!(bus.listener_count(), 2);

        assert!(bus.off(id));
        assert!(!bus.off(id));
        assert_eq!(bus.listener_count(), 1);

        bus.clear_listeners();
        assert_eq!(bus.listener_count(), 0);
    }

    #[tokio::test]
    async fn test_broadcast_subscription() {
        let bus = EventBus::new(16);
        let mut receiver = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 1);

        bus.emit(message_event("world", "spawn"));

        let received = receiver.recv().await.unwrap();
        assert_eq!(received.event_name(), "message:world:spawn");
    }
}
