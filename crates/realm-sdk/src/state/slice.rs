use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 状态切片
///
/// `version` 从 0 开始，每次 update / update_slice 恰好加 1。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateSlice {
    pub data: Value,
    pub loading: bool,
    pub error: Option<String>,
    /// 最后更新时间（UTC 毫秒）
    pub last_updated: i64,
    pub version: u64,
}

impl StateSlice {
    /// 新注册的切片
    pub fn new(data: Value, now_ms: i64) -> Self {
        Self {
            data,
            loading: false,
            error: None,
            last_updated: now_ms,
            version: 0,
        }
    }

    /// 基于当前切片生成下一个版本（数据替换，loading/error 保留）
    pub(crate) fn next_with_data(&self, data: Value, now_ms: i64) -> Self {
        Self {
            data,
            loading: self.loading,
            error: self.error.clone(),
            last_updated: now_ms,
            version: self.version + 1,
        }
    }

    /// 合并局部字段生成下一个版本
    pub(crate) fn next_with_patch(&self, patch: SlicePatch, now_ms: i64) -> Self {
        Self {
            data: patch.data.unwrap_or_else(|| self.data.clone()),
            loading: patch.loading.unwrap_or(self.loading),
            error: match patch.error {
                Some(error) => error,
                None => self.error.clone(),
            },
            last_updated: now_ms,
            version: self.version + 1,
        }
    }
}

/// 切片局部更新
///
/// `error` 为 `Some(None)` 表示清除错误。
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SlicePatch {
    pub data: Option<Value>,
    pub loading: Option<bool>,
    pub error: Option<Option<String>>,
}

impl SlicePatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn loading(mut self, loading: bool) -> Self {
        self.loading = Some(loading);
        self
    }

    pub fn error<S: Into<String>>(mut self, error: S) -> Self {
        self.error = Some(Some(error.into()));
        self
    }

    pub fn clear_error(mut self) -> Self {
        self.error = Some(None);
        self
    }
}

/// 数据更新方式：直接替换，或基于旧值计算
pub enum Updater<'a> {
    Value(Value),
    Apply(Box<dyn FnOnce(&Value) -> Value + 'a>),
}

impl<'a> Updater<'a> {
    pub fn value<V: Into<Value>>(value: V) -> Self {
        Updater::Value(value.into())
    }

    pub fn apply<F>(f: F) -> Self
    where
        F: FnOnce(&Value) -> Value + 'a,
    {
        Updater::Apply(Box::new(f))
    }

    pub(crate) fn resolve(self, current: &Value) -> Value {
        match self {
            Updater::Value(value) => value,
            Updater::Apply(f) => f(current),
        }
    }
}

impl From<Value> for Updater<'_> {
    fn from(value: Value) -> Self {
        Updater::Value(value)
    }
}

impl std::fmt::Debug for Updater<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Updater::Value(value) => f.debug_tuple("Value").field(value).finish(),
            Updater::Apply(_) => f.write_str("Apply(..)"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegisterOptions {
    /// 是否持久化该切片
    pub persist: bool,
}

impl RegisterOptions {
    pub fn persisted() -> Self {
        Self { persist: true }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpdateOptions {
    /// `Some(false)` 跳过本次持久化；未设置时持久化切片照常写入
    pub persist: Option<bool>,
}

impl UpdateOptions {
    pub fn skip_persist() -> Self {
        Self {
            persist: Some(false),
        }
    }
}

/// 持久化格式 `{data, version, timestamp}`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct PersistedState {
    pub data: Value,
    pub version: u64,
    pub timestamp: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_next_with_data_keeps_flags() {
        let mut slice = StateSlice::new(json!({"gold": 1}), 10);
        slice.loading = true;
        slice.error = Some("timeout".to_string());

        let next = slice.next_with_data(json!({"gold": 2}), 20);
        assert_eq!(next.version, 1);
        assert_eq!(next.last_updated, 20);
        assert!(next.loading);
        assert_eq!(next.error.as_deref(), Some("timeout"));
    }

    #[test]
    fn test_patch_merges_only_given_fields() {
        let slice = StateSlice::new(json!([1, 2]), 0);
        let next = slice.next_with_patch(SlicePatch::new().loading(true).error("offline"), 5);
        assert_eq!(next.data, json!([1, 2]));
        assert!(next.loading);
        assert_eq!(next.error.as_deref(), Some("offline"));

        let cleared = next.next_with_patch(SlicePatch::new().clear_error(), 6);
        assert_eq!(cleared.error, None);
        assert_eq!(cleared.version, 2);
    }

    #[test]
    fn test_updater_resolve() {
        let current = json!({"count": 1});
        assert_eq!(Updater::value(json!(7)).resolve(&current), json!(7));
        let inc = Updater::apply(|v| json!({"count": v["count"].as_i64().unwrap_or(0) + 1}));
        assert_eq!(inc.resolve(&current), json!({"count": 2}));
    }
}
