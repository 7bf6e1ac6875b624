//! 进程内计数存储
//!
//! 固定窗口，仅用于开发环境和测试；多实例部署应使用 Redis

use std::collections::HashMap;

use async_trait::async_trait;
use glimmr_errors::AppResult;
use glimmr_ports::{CounterOutcome, CounterStore};
use parking_lot::Mutex;

use super::now_millis;

/// 超过该数量时清理过期窗口
const PRUNE_THRESHOLD: usize = 10_000;

#[derive(Debug, Clone, Copy)]
struct Window {
    count: u64,
    reset_at: u64,
}

/// 进程内计数存储
#[derive(Debug, Default)]
pub struct MemoryCounterStore {
    windows: Mutex<HashMap<String, Window>>,
}

impl MemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn increment_at(&self, key: &str, window_ms: u64, limit: u64, now_ms: u64) -> CounterOutcome {
        let mut windows = self.windows.lock();

        if windows.len() >= PRUNE_THRESHOLD {
            windows.retain(|_, window| window.reset_at > now_ms);
        }

        let window = windows.entry(key.to_string()).or_insert(Window {
            count: 0,
            reset_at: now_ms.saturating_add(window_ms),
        });
        if window.reset_at <= now_ms {
            *window = Window {
                count: 0,
                reset_at: now_ms.saturating_add(window_ms),
            };
        }
        window.count = window.count.saturating_add(1);

        CounterOutcome {
            allowed: window.count <= limit,
            remaining: limit.saturating_sub(window.count),
            reset_at: window.reset_at,
        }
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn increment(&self, key: &str, window_ms: u64, limit: u64) -> AppResult<CounterOutcome> {
        Ok(self.increment_at(key, window_ms, limit, now_millis()))
    }

    async fn ping(&self) -> AppResult<()> {
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
