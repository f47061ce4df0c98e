//! 角色实时服务
//!
//! 订阅 `character` 频道，把服务端推送写入 `character` 状态切片；角色移动等写操作
//! 通过会话发送（断线时自动缓冲）。

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tracing::debug;

use crate::error::{RealmError, Result};
use crate::realtime::{RealtimeService, SubscriptionId, SubscriptionOptions};
use crate::state::{RegisterOptions, StateManager, UpdateOptions, Updater};

/// 角色频道
pub const CHARACTER_CHANNEL: &str = "character";
/// 角色状态切片
pub const CHARACTER_STATE_KEY: &str = "character";

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

/// 角色状态
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CharacterState {
    pub id: Option<String>,
    pub name: String,
    pub level: u32,
    pub experience: u64,
    pub health: i64,
    pub max_health: i64,
    pub zone: Option<String>,
    pub position: Position,
}

/// 浅合并：`patch` 中的字段覆盖 `current`
fn merge(current: &Value, patch: &Value) -> Value {
    match (current, patch) {
        (Value::Object(base), Value::Object(changes)) => {
            let mut merged: Map<String, Value> = base.clone();
            for (key, value) in changes {
                merged.insert(key.clone(), value.clone());
            }
            Value::Object(merged)
        }
        (_, patch) => patch.clone(),
    }
}

pub struct CharacterRealtime {
    session: Arc<RealtimeService>,
    store: Arc<StateManager>,
    subscription: SubscriptionId,
}

impl CharacterRealtime {
    pub fn new(session: Arc<RealtimeService>, store: Arc<StateManager>) -> Self {
        if store.select_slice(CHARACTER_STATE_KEY).is_none() {
            let initial = serde_json::to_value(CharacterState::default()).unwrap_or(Value::Null);
            store.register(CHARACTER_STATE_KEY, initial, RegisterOptions::persisted());
        }

        let target = store.clone();
        let subscription = session.subscribe(
            CHARACTER_CHANNEL,
            move |event, data| Self::apply(&target, event, data),
            SubscriptionOptions::default(),
        );

        Self {
            session,
            store,
            subscription,
        }
    }

    fn apply(store: &StateManager, event: &str, data: &Value) -> Result<()> {
        let patch = match event {
            "updated" | "level_up" => data.clone(),
            "moved" => json!({
                "position": data.get("position").cloned().unwrap_or(Value::Null),
                "zone": data.get("zone").cloned().unwrap_or(Value::Null),
            }),
            "damaged" => {
                let health = data
                    .get("health")
                    .and_then(Value::as_i64)
                    .ok_or_else(|| RealmError::InvalidArgument("damaged 缺少 health".to_string()))?;
                json!({ "health": health.max(0) })
            }
            other => {
                debug!("忽略角色事件: {}", other);
                return Ok(());
            }
        };

        store.update(
            CHARACTER_STATE_KEY,
            Updater::apply(|current| merge(current, &patch)),
            UpdateOptions::default(),
        )?;
        Ok(())
    }

    pub fn session(&self) -> &Arc<RealtimeService> {
        &self.session
    }

    /// 当前角色状态
    pub fn current(&self) -> Option<CharacterState> {
        self.store.select_as(CHARACTER_STATE_KEY)
    }

    /// 请求移动；断线时进入发送缓冲
    pub fn move_to(&self, zone: &str, position: Position) {
        self.session.send(
            "character:move",
            json!({ "zone": zone, "position": position }),
        );
    }

    /// 取消频道订阅（状态切片保留）
    pub fn detach(self) {
        self.session.unsubscribe(&self.subscription);
    }
}

impl std::fmt::Debug for CharacterRealtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CharacterRealtime")
            .field("subscription", &self.subscription)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RealtimeConfig;
    use crate::events::EventBus;
    use crate::realtime::transport::test_helpers::MockTransport;
    use crate::realtime::wire;
    use crate::utils::ManualClock;

    fn setup() -> (Arc<MockTransport>, CharacterRealtime) {
        let transport = MockTransport::new();
        let config = RealtimeConfig {
            heartbeat_interval_ms: None,
            ..RealtimeConfig::default()
        };
        let session = RealtimeService::with_clock("character", transport.clone(), config, ManualClock::new(0));
        let store = Arc::new(StateManager::new(Arc::new(EventBus::default())));
        (transport, CharacterRealtime::new(session, store))
    }

    #[test]
    fn test_pushes_update_state_slice() {
        let (transport, character) = setup();
        transport.set_connected(true);
        assert_eq!(
            transport.sent_events(wire::SUBSCRIBE),
            vec![json!({"channel": "character"})]
        );

        transport.push_message(
            CHARACTER_CHANNEL,
            "updated",
            json!({"name": "Aria", "level": 3, "health": 40, "maxHealth": 50}),
        );
        transport.push_message(
            CHARACTER_CHANNEL,
            "moved",
            json!({"zone": "harbor", "position": {"x": 1.5, "y": -2.0}}),
        );
        transport.push_message(CHARACTER_CHANNEL, "damaged", json!({"health": -5}));
        transport.push_message(CHARACTER_CHANNEL, "emote", json!({"kind": "wave"}));

        let state = character.current().unwrap();
        assert_eq!(state.name, "Aria");
        assert_eq!(state.level, 3);
        assert_eq!(state.health, 0);
        assert_eq!(state.max_health, 50);
        assert_eq!(state.zone.as_deref(), Some("harbor"));
        assert_eq!(state.position, Position { x: 1.5, y: -2.0 });
    }

    #[test]
    fn test_move_is_buffered_while_offline() {
        let (transport, character) = setup();
        character.move_to("forest", Position { x: 3.0, y: 4.0 });
        assert!(transport.sent().is_empty());

        transport.set_connected(true);
        assert_eq!(
            transport.sent_events("character:move"),
            vec![json!({"zone": "forest", "position": {"x": 3.0, "y": 4.0}})]
        );
    }

    #[test]
    fn test_detach_unsubscribes() {
        let (transport, character) = setup();
        transport.set_connected(true);
        let session = character.session().clone();

        character.detach();
        assert_eq!(
            transport.sent_events(wire::UNSUBSCRIBE),
            vec![json!({"channel": "character"})]
        );
        assert_eq!(session.stats().subscriptions, 0);
    }
}
