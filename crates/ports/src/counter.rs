//! 计数存储 trait 定义

use async_trait::async_trait;
use glimmr_errors::AppResult;

/// 一次计数的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterOutcome {
    /// 计数后是否仍在限额内
    pub allowed: bool,
    /// 剩余配额
    pub remaining: u64,
    /// 窗口重置时间（Unix 毫秒）
    pub reset_at: u64,
}

impl CounterOutcome {
    /// 是否被限流
    pub fn is_limited(&self) -> bool {
        !self.allowed
    }

    /// 距离窗口重置的秒数（向上取整，至少为 1）
    pub fn retry_after_secs(&self, now_ms: u64) -> u64 {
        self.reset_at.saturating_sub(now_ms).div_ceil(1000).max(1)
    }
}

/// 限流计数存储
///
/// 实现必须保证同一 key 上的 `increment` 对并发调用者是原子的，
/// 并自行限制每次调用的耗时。
#[cfg_attr(feature = "mock", mockall::automock)]
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// 对 key 计数一次，并与限额比较
    async fn increment(&self, key: &str, window_ms: u64, limit: u64) -> AppResult<CounterOutcome>;

    /// 存储是否可用
    async fn ping(&self) -> AppResult<()>;

    /// 存储名称（用于健康检查和日志）
    fn name(&self) -> &'static str;
}
