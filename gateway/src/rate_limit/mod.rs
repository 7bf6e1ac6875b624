//! 准入控制（限流）
//!
//! 由桶键、策略注册表和限流算法组合而成；计数状态全部保存在 [`glimmr_ports::CounterStore`] 中

pub mod bypass;
pub mod key;
pub mod limiter;
pub mod memory;
pub mod middleware;
pub mod policy;
pub mod types;

use thiserror::Error;

pub use bypass::OperationalAllowlist;
pub use key::BucketKey;
pub use limiter::{StoreLimiter, ThrottleAlgorithm};
pub use memory::MemoryCounterStore;
pub use middleware::{Admission, AdmissionController, ThrottleRoute, throttle_middleware, throttled};
pub use policy::PolicyRegistry;
pub use types::{Decision, RatePolicy, Verdict};

/// 准入控制错误
#[derive(Debug, Error)]
pub enum ThrottleError {
    /// 判定时拿不到请求上下文
    #[error("Request context unavailable at admission time")]
    MalformedRequestContext,

    #[error("Default rate limit policy '{0}' is not configured")]
    MissingDefaultPolicy(String),

    #[error("Invalid operational allowlist: {0}")]
    InvalidAllowlist(#[from] regex::Error),
}

/// 当前 Unix 时间（毫秒）
pub(crate) fn now_millis() -> u64 {
    u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or_default()
}
