//! 实时会话模块 - 在不可靠、会重连的传输层之上维持逻辑上始终可用的消息通道
//!
//! 功能包括：
//! - 频道订阅表，连接建立时自动重新订阅未激活的订阅
//! - 断线期间的发送缓冲，重连后按 FIFO 发送，超过 30 秒的消息直接丢弃
//! - 入站消息分发到订阅回调（精确频道或 `*`），并发出本地 `message:{channel}:{event}` 事件
//! - 周期心跳（断线时跳过，不入队）
//!
//! 每个会话独占自己的传输句柄、订阅表、发送缓冲和本地事件总线。

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::RealtimeConfig;
use crate::error::Result;
use crate::events::{EventBus, ListenerId, RealmEvent};
use crate::utils::time::elapsed_ms;
use crate::utils::{SharedClock, SystemClock};

mod subscription;
pub mod transport;

pub use subscription::{
    QueuedMessage, SubscriptionHandler, SubscriptionId, SubscriptionOptions, WILDCARD_CHANNEL,
};
pub use transport::{
    InboundMessage, RealtimeTransport, TransportEvent, TransportEventKind, TransportListener,
};
use subscription::{generate_subscription_id, Subscription};

/// 缓冲消息的最大存活时间，达到即丢弃
pub const STALE_MESSAGE_MS: i64 = 30_000;

/// 协议消息名
pub mod wire {
    pub const SUBSCRIBE: &str = "subscribe";
    pub const UNSUBSCRIBE: &str = "unsubscribe";
    pub const HEARTBEAT: &str = "heartbeat";
}

/// 会话统计信息
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RealtimeStats {
    pub subscriptions: usize,
    pub active_subscriptions: usize,
    pub backlog_len: usize,
    pub messages_sent: u64,
    pub messages_queued: u64,
    pub messages_dropped: u64,
    pub messages_received: u64,
}

#[derive(Debug, Default)]
struct Counters {
    sent: AtomicU64,
    queued: AtomicU64,
    dropped: AtomicU64,
    received: AtomicU64,
}

#[derive(Debug, Default)]
struct SessionState {
    /// 按订阅顺序
    subscriptions: Vec<Subscription>,
    backlog: VecDeque<QueuedMessage>,
    /// 正在补发缓冲，期间新的 send 排在缓冲末尾
    flushing: bool,
}

/// 实时会话
pub struct RealtimeService {
    name: String,
    transport: Arc<dyn RealtimeTransport>,
    events: Arc<EventBus>,
    config: RealtimeConfig,
    clock: SharedClock,
    state: Mutex<SessionState>,
    transport_listeners: Mutex<Vec<ListenerId>>,
    heartbeat: Mutex<Option<JoinHandle<()>>>,
    destroyed: AtomicBool,
    counters: Counters,
}

impl std::fmt::Debug for RealtimeService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RealtimeService")
            .field("name", &self.name)
            .field("connected", &self.transport.is_connected())
            .field("stats", &self.stats())
            .finish()
    }
}

impl RealtimeService {
    /// 创建会话：注册四个传输层事件监听，按配置启动心跳
    pub fn new(
        name: &str,
        transport: Arc<dyn RealtimeTransport>,
        config: RealtimeConfig,
    ) -> Arc<Self> {
        Self::with_clock(name, transport, config, SystemClock::shared())
    }

    pub fn with_clock(
        name: &str,
        transport: Arc<dyn RealtimeTransport>,
        config: RealtimeConfig,
        clock: SharedClock,
    ) -> Arc<Self> {
        let service = Arc::new_cyclic(|weak: &Weak<Self>| {
            let listener_ids = TransportEventKind::ALL
                .iter()
                .map(|kind| {
                    let weak = weak.clone();
                    let listener: TransportListener = Arc::new(move |event: &TransportEvent| {
                        if let Some(service) = weak.upgrade() {
                            service.handle_transport_event(event);
                        }
                    });
                    transport.on(*kind, listener)
                })
                .collect();

            Self {
                name: name.to_string(),
                transport: transport.clone(),
                events: Arc::new(EventBus::new(config.event_capacity)),
                config,
                clock,
                state: Mutex::new(SessionState::default()),
                transport_listeners: Mutex::new(listener_ids),
                heartbeat: Mutex::new(None),
                destroyed: AtomicBool::new(false),
                counters: Counters::default(),
            }
        });

        if let Some(interval_ms) = service.config.heartbeat_interval_ms.filter(|ms| *ms > 0) {
            service.start_heartbeat(Duration::from_millis(interval_ms));
        }
        info!("实时会话已创建: {}", service.name);
        service
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// 会话的本地事件总线
    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn connect(&self, auth: Option<Value>) -> Result<()> {
        self.transport.connect(auth)
    }

    pub fn disconnect(&self) {
        self.transport.disconnect();
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    fn start_heartbeat(self: &Arc<Self>, period: Duration) {
        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                warn!("[{}] 当前没有 tokio 运行时，心跳未启动", self.name);
                return;
            }
        };

        let weak = Arc::downgrade(self);
        let task = handle.spawn(async move {
            let start = tokio::time::Instant::now() + period;
            let mut interval = tokio::time::interval_at(start, period);
            loop {
                interval.tick().await;
                match weak.upgrade() {
                    Some(service) => service.heartbeat_tick(),
                    None => break,
                }
            }
        });
        *self.heartbeat.lock() = Some(task);
        debug!("[{}] 心跳已启动，间隔 {:?}", self.name, period);
    }

    fn heartbeat_tick(&self) {
        if !self.transport.is_connected() {
            return;
        }
        let payload = json!({ "timestamp": self.clock.now_ms() });
        if let Err(e) = self.transport.send(wire::HEARTBEAT, &payload) {
            debug!("[{}] 心跳发送失败: {}", self.name, e);
        }
    }

    fn handle_transport_event(&self, event: &TransportEvent) {
        if self.destroyed.load(Ordering::SeqCst) {
            return;
        }

        match event {
            TransportEvent::Connected => self.handle_connected(),
            TransportEvent::Disconnected => {
                info!("[{}] 实时连接已断开", self.name);
                self.events.emit(RealmEvent::RealtimeDisconnected {
                    timestamp: self.clock.now_ms(),
                });
            }
            TransportEvent::Error(error) => {
                warn!("[{}] 实时连接错误: {}", self.name, error);
                self.events.emit(RealmEvent::RealtimeError {
                    error: error.clone(),
                    timestamp: self.clock.now_ms(),
                });
            }
            TransportEvent::Message(message) => self.dispatch(message),
        }
    }

    fn handle_connected(&self) {
        info!("[{}] 实时连接已建立", self.name);

        let inactive: Vec<SubscriptionId> = self
            .state
            .lock()
            .subscriptions
            .iter()
            .filter(|s| !s.active)
            .map(|s| s.id.clone())
            .collect();
        for id in inactive {
            self.activate(&id);
        }

        self.flush_backlog();
    }

    /// 发送 `subscribe` 并标记为激活
    ///
    /// 发送前先在锁内标记激活，并发的 connected 事件和 subscribe 不会重复发送；
    /// 发送失败时撤销标记，等待下次连接。
    fn activate(&self, id: &str) {
        let payload = {
            let mut state = self.state.lock();
            match state.subscriptions.iter_mut().find(|s| s.id == id) {
                Some(sub) if !sub.active => {
                    sub.active = true;
                    sub.options.subscribe_payload(&sub.channel)
                }
                _ => return,
            }
        };

        match self.transport.send(wire::SUBSCRIBE, &payload) {
            Ok(()) => debug!("[{}] 订阅已激活: {}", self.name, id),
            Err(e) => {
                if let Some(sub) = self.state.lock().subscriptions.iter_mut().find(|s| s.id == id) {
                    sub.active = false;
                }
                warn!("[{}] 发送订阅 {} 失败，等待下次连接: {}", self.name, id, e);
            }
        }
    }

    /// 按 FIFO 补发缓冲；补发期间新入队的消息在同一轮中随后发出
    fn flush_backlog(&self) {
        {
            let mut state = self.state.lock();
            if state.flushing || state.backlog.is_empty() {
                return;
            }
            state.flushing = true;
        }

        let now = self.clock.now_ms();
        let mut total = 0usize;
        let mut dropped = 0u64;
        loop {
            let batch = {
                let mut state = self.state.lock();
                if state.backlog.is_empty() {
                    state.flushing = false;
                    break;
                }
                std::mem::take(&mut state.backlog)
            };
            total += batch.len();
            if !self.send_batch(batch, now, &mut dropped) {
                break;
            }
        }

        if dropped > 0 {
            self.counters.dropped.fetch_add(dropped, Ordering::Relaxed);
            info!("[{}] 丢弃 {} 条过期的缓冲消息", self.name, dropped);
        }
        debug!("[{}] 缓冲消息补发完成: {} 条", self.name, total);
    }

    /// 发送一批缓冲消息；失败时把剩余部分放回缓冲头部并结束补发
    fn send_batch(&self, mut pending: VecDeque<QueuedMessage>, now: i64, dropped: &mut u64) -> bool {
        while let Some(message) = pending.pop_front() {
            if elapsed_ms(now, message.timestamp) >= STALE_MESSAGE_MS {
                *dropped += 1;
                continue;
            }

            if let Err(e) = self.transport.send(&message.event, &message.data) {
                warn!("[{}] 补发缓冲消息失败，剩余 {} 条放回缓冲: {}", self.name, pending.len() + 1, e);
                pending.push_front(message);
                let mut state = self.state.lock();
                // 补发期间新入队的消息排在后面
                pending.extend(state.backlog.drain(..));
                state.backlog = pending;
                state.flushing = false;
                return false;
            }
            self.counters.sent.fetch_add(1, Ordering::Relaxed);
        }
        true
    }

    fn dispatch(&self, message: &InboundMessage) {
        self.counters.received.fetch_add(1, Ordering::Relaxed);

        let handlers: Vec<SubscriptionHandler> = self
            .state
            .lock()
            .subscriptions
            .iter()
            .filter(|s| s.matches(&message.channel))
            .map(|s| s.handler.clone())
            .collect();

        for handler in handlers {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| handler(&message.event, &message.data)));
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(
                    "[{}] 处理消息 {}:{} 失败: {}",
                    self.name, message.channel, message.event, e
                ),
                Err(_) => error!(
                    "[{}] 处理消息 {}:{} 时回调 panic，已跳过",
                    self.name, message.channel, message.event
                ),
            }
        }

        self.events.emit(RealmEvent::Message {
            channel: message.channel.clone(),
            event: message.event.clone(),
            data: message.data.clone(),
            timestamp: self.clock.now_ms(),
        });
    }

    /// 订阅频道（`*` 接收所有频道），已连接时立即发送 `subscribe`
    pub fn subscribe<F>(&self, channel: &str, handler: F, options: SubscriptionOptions) -> SubscriptionId
    where
        F: Fn(&str, &Value) -> Result<()> + Send + Sync + 'static,
    {
        let id = generate_subscription_id(self.clock.now_ms());
        self.state.lock().subscriptions.push(Subscription {
            id: id.clone(),
            channel: channel.to_string(),
            handler: Arc::new(handler),
            options,
            active: false,
        });
        debug!("[{}] 新增订阅: {} ({})", self.name, channel, id);

        if self.transport.is_connected() {
            self.activate(&id);
        }
        id
    }

    /// 取消订阅；未知 ID 忽略
    pub fn unsubscribe(&self, id: &str) {
        let removed = {
            let mut state = self.state.lock();
            match state.subscriptions.iter().position(|s| s.id == id) {
                Some(index) => state.subscriptions.remove(index),
                None => return,
            }
        };

        if removed.active && self.transport.is_connected() {
            let payload = json!({ "channel": removed.channel });
            if let Err(e) = self.transport.send(wire::UNSUBSCRIBE, &payload) {
                warn!("[{}] 发送取消订阅 {} 失败: {}", self.name, removed.channel, e);
            }
        }
        debug!("[{}] 已取消订阅: {} ({})", self.name, removed.channel, id);
    }

    /// 发送消息；未连接、正在补发缓冲或发送失败时放入缓冲
    pub fn send(&self, event: &str, data: Value) {
        {
            let mut state = self.state.lock();
            if state.flushing || !state.backlog.is_empty() {
                self.push_backlog(&mut state, event, data);
                return;
            }
        }

        if self.transport.is_connected() {
            match self.transport.send(event, &data) {
                Ok(()) => {
                    self.counters.sent.fetch_add(1, Ordering::Relaxed);
                    return;
                }
                Err(e) => warn!("[{}] 发送 {} 失败，放入缓冲: {}", self.name, event, e),
            }
        }
        self.enqueue(event, data);
    }

    fn enqueue(&self, event: &str, data: Value) {
        let mut state = self.state.lock();
        self.push_backlog(&mut state, event, data);
    }

    fn push_backlog(&self, state: &mut SessionState, event: &str, data: Value) {
        if let Some(max) = self.config.max_backlog {
            while state.backlog.len() >= max.max(1) {
                state.backlog.pop_front();
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                debug!("[{}] 缓冲已满，丢弃最旧的消息", self.name);
            }
        }
        state.backlog.push_back(QueuedMessage {
            event: event.to_string(),
            data,
            timestamp: self.clock.now_ms(),
        });
        self.counters.queued.fetch_add(1, Ordering::Relaxed);
    }

    /// 当前缓冲的消息（FIFO 顺序）
    pub fn backlog(&self) -> Vec<QueuedMessage> {
        self.state.lock().backlog.iter().cloned().collect()
    }

    /// 订阅是否已激活；未知 ID 返回 `None`
    pub fn is_subscription_active(&self, id: &str) -> Option<bool> {
        self.state
            .lock()
            .subscriptions
            .iter()
            .find(|s| s.id == id)
            .map(|s| s.active)
    }

    pub fn stats(&self) -> RealtimeStats {
        let state = self.state.lock();
        RealtimeStats {
            subscriptions: state.subscriptions.len(),
            active_subscriptions: state.subscriptions.iter().filter(|s| s.active).count(),
            backlog_len: state.backlog.len(),
            messages_sent: self.counters.sent.load(Ordering::Relaxed),
            messages_queued: self.counters.queued.load(Ordering::Relaxed),
            messages_dropped: self.counters.dropped.load(Ordering::Relaxed),
            messages_received: self.counters.received.load(Ordering::Relaxed),
        }
    }

    fn detach(&self) {
        if let Some(task) = self.heartbeat.lock().take() {
            task.abort();
        }
        for id in self.transport_listeners.lock().drain(..) {
            self.transport.off(id);
        }
    }

    /// 销毁会话：停止心跳，清空订阅和缓冲（不发送任何消息），断开传输层，移除所有监听器
    pub fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            debug!("[{}] 会话已销毁，忽略重复调用", self.name);
            return;
        }

        self.detach();
        {
            let mut state = self.state.lock();
            state.subscriptions.clear();
            state.backlog.clear();
        }
        self.transport.disconnect();
        self.events.clear_listeners();
        info!("[{}] 实时会话已销毁", self.name);
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }
}

impl Drop for RealtimeService {
    fn drop(&mut self) {
        self.detach();
    }
}
