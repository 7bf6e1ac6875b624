//! 限流算法
//!
//! 计数本身委托给 [`CounterStore`]，这里只负责把计数结果转换为结论，
//! 以及在存储不可用时给出基础判定

use std::sync::Arc;

use async_trait::async_trait;
use glimmr_config::FailureMode;
use glimmr_ports::CounterStore;
use tracing::{debug, warn};

use super::key::BucketKey;
use super::types::{RatePolicy, Verdict};

/// 限流算法接口
#[async_trait]
pub trait ThrottleAlgorithm: Send + Sync {
    /// 对桶键计数并给出结论
    async fn evaluate(&self, key: &BucketKey, policy: &RatePolicy) -> Verdict;

    /// 无法计数时的基础判定
    fn base_decision(&self, policy: &RatePolicy) -> Verdict;
}

/// 基于计数存储的固定窗口限流
#[derive(Clone)]
pub struct StoreLimiter {
    store: Arc<dyn CounterStore>,
    failure_mode: FailureMode,
}

impl StoreLimiter {
    pub fn new(store: Arc<dyn CounterStore>, failure_mode: FailureMode) -> Self {
        Self {
            store,
            failure_mode,
        }
    }
}

#[async_trait]
impl ThrottleAlgorithm for StoreLimiter {
    async fn evaluate(&self, key: &BucketKey, policy: &RatePolicy) -> Verdict {
        match self
            .store
            .increment(key.as_str(), policy.window_ms, policy.limit)
            .await
        {
            Ok(outcome) => {
                debug!(
                    key = %key,
                    allowed = outcome.allowed,
                    remaining = outcome.remaining,
                    "Counter store decision"
                );
                Verdict::counted(policy, outcome)
            }
            Err(e) => {
                warn!(
                    store = self.store.name(),
                    key = %key,
                    error = %e,
                    failure_mode = ?self.failure_mode,
                    "Counter store unavailable, using base decision"
                );
                self.base_decision(policy)
            }
        }
    }

    fn base_decision(&self, policy: &RatePolicy) -> Verdict {
        Verdict::base(policy, self.failure_mode == FailureMode::Open)
    }
}
