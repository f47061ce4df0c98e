//! 内置状态中间件
//!
//! 中间件签名 `(key, previous, next) -> Result<StateSlice>`，按注册顺序串联执行，
//! 前一个的输出是后一个的输入。返回错误的中间件会被跳过（输入原样传给下一个）。

use std::sync::Arc;
use tracing::debug;

use super::StateSlice;
use crate::error::Result;

/// 状态中间件
pub type StateMiddleware =
    Arc<dyn Fn(&str, &StateSlice, &StateSlice) -> Result<StateSlice> + Send + Sync>;

/// 记录每次状态迁移
pub fn logging() -> StateMiddleware {
    Arc::new(|key: &str, previous: &StateSlice, next: &StateSlice| {
        debug!(
            "state {}: v{} -> v{} (loading={}, error={:?})",
            key, previous.version, next.version, next.loading, next.error
        );
        Ok(next.clone())
    })
}

/// 新数据到达时清除旧错误
pub fn clear_error_on_data() -> StateMiddleware {
    Arc::new(|_key: &str, previous: &StateSlice, next: &StateSlice| {
        let mut next = next.clone();
        if next.error.is_some() && next.error == previous.error && next.data != previous.data {
            next.error = None;
        }
        Ok(next)
    })
}
