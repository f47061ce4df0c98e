//! 时间工具模块
//!
//! # 设计原则
//!
//! - 所有时间字段统一使用 UTC 毫秒时间戳（i64）
//! - 业务代码不直接调用 `Utc::now()`，而是通过注入的 [`Clock`] 获取时间，
//!   测试中可用 [`ManualClock`] 模拟时间流逝（心跳、过期、陈旧消息等）

use chrono::Utc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

/// 当前 UTC 毫秒时间戳
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// 时间源
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// 当前 UTC 毫秒时间戳
    fn now_ms(&self) -> i64;
}

/// 共享时间源
pub type SharedClock = Arc<dyn Clock>;

/// 系统时钟
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl SystemClock {
    pub fn shared() -> SharedClock {
        Arc::new(SystemClock)
    }
}

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        now_millis()
    }
}

/// 手动时钟（测试用），只在显式推进时前进
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub fn new(start_ms: i64) -> Arc<Self> {
        Arc::new(Self {
            now: AtomicI64::new(start_ms),
        })
    }

    /// 推进指定毫秒数
    pub fn advance(&self, delta_ms: i64) {
        self.now.fetch_add(delta_ms, Ordering::SeqCst);
    }

    /// 直接设置当前时间
    pub fn set(&self, now_ms: i64) {
        self.now.store(now_ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// 计算 `then` 到 `now` 的经过毫秒数（时钟回拨时按 0 处理）
pub fn elapsed_ms(now: i64, then: i64) -> i64 {
    (now - then).max(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_advances_only_on_demand() {
        let clock = ManualClock::new(1_000);
        assert_eq!(clock.now_ms(), 1_000);

        clock.advance(29_999);
        assert_eq!(clock.now_ms(), 30_999);

        clock.set(5);
        assert_eq!(clock.now_ms(), 5);
    }

    #[test]
    fn test_system_clock_is_close_to_chrono() {
        let clock = SystemClock;
        let diff = (clock.now_ms() - now_millis()).abs();
        assert!(diff < 1_000);
    }

    #[test]
    fn test_elapsed_never_negative() {
        assert_eq!(elapsed_ms(100, 40), 60);
        assert_eq!(elapsed_ms(40, 100), 0);
    }
}
