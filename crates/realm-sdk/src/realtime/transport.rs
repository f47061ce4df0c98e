//! 实时传输层接口
//!
//! 实际的 WebSocket/Socket.IO 连接由外部实现，会话只依赖这个 trait。

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

use crate::error::Result;
use crate::events::ListenerId;

/// 传输层事件类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportEventKind {
    Connected,
    Disconnected,
    Error,
    Message,
}

impl TransportEventKind {
    pub const ALL: [TransportEventKind; 4] = [
        TransportEventKind::Connected,
        TransportEventKind::Disconnected,
        TransportEventKind::Error,
        TransportEventKind::Message,
    ];
}

/// 服务端推送的消息 `{channel, event, data}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundMessage {
    pub channel: String,
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

/// 传输层事件
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Connected,
    Disconnected,
    Error(String),
    Message(InboundMessage),
}

impl TransportEvent {
    pub fn kind(&self) -> TransportEventKind {
        match self {
            TransportEvent::Connected => TransportEventKind::Connected,
            TransportEvent::Disconnected => TransportEventKind::Disconnected,
            TransportEvent::Error(_) => TransportEventKind::Error,
            TransportEvent::Message(_) => TransportEventKind::Message,
        }
    }
}

pub type TransportListener = Arc<dyn Fn(&TransportEvent) + Send + Sync>;

/// 实时传输层
///
/// `send` 在未连接时应返回错误；监听器可能在任意线程上被调用。
pub trait RealtimeTransport: Send + Sync {
    fn connect(&self, auth: Option<Value>) -> Result<()>;
    fn disconnect(&self);
    fn send(&self, event: &str, data: &Value) -> Result<()>;
    fn is_connected(&self) -> bool;
    fn on(&self, kind: TransportEventKind, listener: TransportListener) -> ListenerId;
    fn off(&self, id: ListenerId);
}

#[cfg(test)]
pub mod test_helpers {
    use super::*;
    use crate::error::RealmError;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

    type SendHook = Arc<dyn Fn(&str, &Value) + Send + Sync>;

    /// 测试用传输层：记录发送的消息，手动触发事件
    #[derive(Default)]
    pub struct MockTransport {
        connected: AtomicBool,
        fail_sends: AtomicBool,
        sent: Mutex<Vec<(String, Value)>>,
        send_hook: Mutex<Option<SendHook>>,
        listeners: Mutex<Vec<(ListenerId, TransportEventKind, TransportListener)>>,
        next_id: AtomicU64,
    }

    impl MockTransport {
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        /// 改变连接状态并触发 connected / disconnected
        pub fn set_connected(&self, connected: bool) {
            self.connected.store(connected, Ordering::SeqCst);
            self.emit(if connected {
                TransportEvent::Connected
            } else {
                TransportEvent::Disconnected
            });
        }

        /// 保持“已连接”状态但让 send 失败
        pub fn set_fail_sends(&self, fail: bool) {
            self.fail_sends.store(fail, Ordering::SeqCst);
        }

        /// 每次成功发送后调用（在记录之后、锁外）
        pub fn set_send_hook<F>(&self, hook: F)
        where
            F: Fn(&str, &Value) + Send + Sync + 'static,
        {
            *self.send_hook.lock() = Some(Arc::new(hook));
        }

        pub fn clear_send_hook(&self) {
            self.send_hook.lock().take();
        }

        pub fn emit(&self, event: TransportEvent) {
            let kind = event.kind();
            let targets: Vec<TransportListener> = self
                .listeners
                .lock()
                .iter()
                .filter(|(_, k, _)| *k == kind)
                .map(|(_, _, l)| l.clone())
                .collect();
            for listener in targets {
                listener(&event);
            }
        }

        pub fn push_message(&self, channel: &str, event: &str, data: Value) {
            self.emit(TransportEvent::Message(InboundMessage {
                channel: channel.to_string(),
                event: event.to_string(),
                data,
            }));
        }

        pub fn sent(&self) -> Vec<(String, Value)> {
            self.sent.lock().clone()
        }

        pub fn sent_events(&self, event: &str) -> Vec<Value> {
            self.sent
                .lock()
                .iter()
                .filter(|(e, _)| e == event)
                .map(|(_, d)| d.clone())
                .collect()
        }

        pub fn clear_sent(&self) {
            self.sent.lock().clear();
        }

        pub fn listener_count(&self) -> usize {
            self.listeners.lock().len()
        }
    }

    impl RealtimeTransport for MockTransport {
        fn connect(&self, _auth: Option<Value>) -> Result<()> {
            self.set_connected(true);
            Ok(())
        }

        fn disconnect(&self) {
            if self.connected.load(Ordering::SeqCst) {
                self.set_connected(false);
            }
        }

        fn send(&self, event: &str, data: &Value) -> Result<()> {
            if !self.connected.load(Ordering::SeqCst) {
                return Err(RealmError::NotConnected);
            }
            if self.fail_sends.load(Ordering::SeqCst) {
                return Err(RealmError::Transport("socket write failed".to_string()));
            }
            self.sent.lock().push((event.to_string(), data.clone()));
            let hook = self.send_hook.lock().clone();
            if let Some(hook) = hook {
                hook(event, data);
            }
            Ok(())
        }

        fn is_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }

        fn on(&self, kind: TransportEventKind, listener: TransportListener) -> ListenerId {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
            self.listeners.lock().push((id, kind, listener));
            id
        }

        fn off(&self, id: ListenerId) {
            self.listeners.lock().retain(|(lid, _, _)| *lid != id);
        }
    }
}
