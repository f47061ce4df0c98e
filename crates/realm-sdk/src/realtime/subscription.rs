use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;

use crate::error::Result;

/// 订阅 ID
pub type SubscriptionId = String;

/// 订阅回调 `(event, data)`
pub type SubscriptionHandler = Arc<dyn Fn(&str, &Value) -> Result<()> + Send + Sync>;

/// 通配频道
pub const WILDCARD_CHANNEL: &str = "*";

/// 订阅选项，随 `subscribe` 消息一起发送
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<i32>,
}

impl SubscriptionOptions {
    pub fn filter(mut self, filter: Value) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    /// `{channel, ...options}`
    pub(crate) fn subscribe_payload(&self, channel: &str) -> Value {
        let mut payload = match serde_json::to_value(self) {
            Ok(Value::Object(options)) => options,
            _ => Map::new(),
        };
        payload.insert("channel".to_string(), Value::String(channel.to_string()));
        Value::Object(payload)
    }
}

pub(crate) struct Subscription {
    pub id: SubscriptionId,
    pub channel: String,
    pub handler: SubscriptionHandler,
    pub options: SubscriptionOptions,
    /// 已通过在线连接发送过 `subscribe`
    pub active: bool,
}

impl Subscription {
    pub fn matches(&self, channel: &str) -> bool {
        self.channel == channel || self.channel == WILDCARD_CHANNEL
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("channel", &self.channel)
            .field("options", &self.options)
            .field("active", &self.active)
            .finish()
    }
}

/// 断线期间缓存的待发送消息
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedMessage {
    pub event: String,
    pub data: Value,
    pub timestamp: i64,
}

/// `sub_{timestamp}_{random}`
pub(crate) fn generate_subscription_id(now_ms: i64) -> SubscriptionId {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(9)
        .map(char::from)
        .collect();
    format!("sub_{}_{}", now_ms, suffix.to_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_subscribe_payload_flattens_options() {
        let options = SubscriptionOptions::default()
            .filter(json!({"zone": "harbor"}))
            .priority(2);
        assert_eq!(
            options.subscribe_payload("combat"),
            json!({"channel": "combat", "filter": {"zone": "harbor"}, "priority": 2})
        );
        assert_eq!(
            SubscriptionOptions::default().subscribe_payload("chat"),
            json!({"channel": "chat"})
        );
    }

    #[test]
    fn test_subscription_ids_are_unique() {
        let a = generate_subscription_id(1_000);
        let b = generate_subscription_id(1_000);
        assert!(a.starts_with("sub_1000_"));
        assert_ne!(a, b);
    }
}
