//! 限流类型定义

use axum::http::{HeaderMap, HeaderValue, header};
use glimmr_config::PolicyConfig;
use glimmr_ports::CounterOutcome;

pub const X_RATELIMIT_LIMIT: &str = "x-ratelimit-limit";
pub const X_RATELIMIT_WINDOW: &str = "x-ratelimit-window";
pub const X_RATELIMIT_REMAINING: &str = "x-ratelimit-remaining";
pub const X_RATELIMIT_RESET: &str = "x-ratelimit-reset";

/// 限流策略
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RatePolicy {
    /// 策略名称
    pub name: String,
    /// 时间窗口（毫秒）
    pub window_ms: u64,
    /// 窗口内最大请求数
    pub limit: u64,
}

impl RatePolicy {
    pub fn new(name: impl Into<String>, window_ms: u64, limit: u64) -> Self {
        Self {
            name: name.into(),
            window_ms,
            limit,
        }
    }

    pub fn from_config(name: impl Into<String>, config: &PolicyConfig) -> Self {
        Self::new(name, config.window_ms, config.limit)
    }

    /// 窗口长度（秒，向上取整）
    pub fn window_secs(&self) -> u64 {
        self.window_ms.div_ceil(1000).max(1)
    }
}

/// 一次策略评估的结论
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    pub policy: RatePolicy,
    pub allowed: bool,
    /// 计数存储的返回；为 `None` 表示使用了基础判定
    pub outcome: Option<CounterOutcome>,
}

impl Verdict {
    /// 根据计数结果得出结论
    pub fn counted(policy: &RatePolicy, outcome: CounterOutcome) -> Self {
        Self {
            policy: policy.clone(),
            allowed: outcome.allowed,
            outcome: Some(outcome),
        }
    }

    /// 不经过计数存储的基础判定
    pub fn base(policy: &RatePolicy, allowed: bool) -> Self {
        Self {
            policy: policy.clone(),
            allowed,
            outcome: None,
        }
    }
}

/// 准入判定
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// 运维路径白名单，直接放行
    Bypass,
    /// 限流已关闭
    Disabled,
    /// 经过策略评估
    Evaluated(Verdict),
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        match self {
            Self::Bypass | Self::Disabled => true,
            Self::Evaluated(verdict) => verdict.allowed,
        }
    }

    /// 实际评估的策略名
    pub fn policy_name(&self) -> Option<&str> {
        match self {
            Self::Evaluated(verdict) => Some(&verdict.policy.name),
            Self::Bypass | Self::Disabled => None,
        }
    }

    /// 指标标签 `outcome`；关闭限流时不计数
    pub fn metric_outcome(&self) -> Option<&'static str> {
        match self {
            Self::Bypass => Some("bypassed"),
            Self::Disabled => None,
            Self::Evaluated(Verdict { outcome: None, .. }) => Some("degraded"),
            Self::Evaluated(Verdict { allowed: true, .. }) => Some("allowed"),
            Self::Evaluated(Verdict { allowed: false, .. }) => Some("denied"),
        }
    }

    /// 写入限流提示头
    ///
    /// limit/window 始终取自实际评估的策略；白名单和关闭限流时不写入任何头
    pub fn stamp_headers(&self, headers: &mut HeaderMap, now_ms: u64) {
        let Self::Evaluated(verdict) = self else {
            return;
        };
        let policy = &verdict.policy;

        headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(policy.limit));
        headers.insert(X_RATELIMIT_WINDOW, HeaderValue::from(policy.window_ms));

        if let Some(outcome) = &verdict.outcome {
            headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(outcome.remaining));
            headers.insert(X_RATELIMIT_RESET, HeaderValue::from(outcome.reset_at));
        }

        if !verdict.allowed {
            let retry_after = verdict
                .outcome
                .map(|outcome| outcome.retry_after_secs(now_ms))
                .unwrap_or_else(|| policy.window_secs());
            headers.insert(header::RETRY_AFTER, HeaderValue::from(retry_after));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn auth_policy() -> RatePolicy {
        RatePolicy::new("auth", 900_000, 5)
    }

    #[test]
    fn test_headers_reflect_evaluated_policy() {
        let decision = Decision::Evaluated(Verdict::counted(
            &auth_policy(),
            CounterOutcome {
                allowed: true,
                remaining: 4,
                reset_at: 1_900_000,
            },
        ));

        let mut headers = HeaderMap::new();
        decision.stamp_headers(&mut headers, 1_000_000);

        assert_eq!(headers[X_RATELIMIT_LIMIT], "5");
        assert_eq!(headers[X_RATELIMIT_WINDOW], "900000");
        assert_eq!(headers[X_RATELIMIT_REMAINING], "4");
        assert_eq!(headers[X_RATELIMIT_RESET], "1900000");
        assert!(!headers.contains_key(header::RETRY_AFTER));
    }

    #[test]
    fn test_denied_sets_retry_after() {
        let decision = Decision::Evaluated(Verdict::counted(
            &auth_policy(),
            CounterOutcome {
                allowed: false,
                remaining: 0,
                reset_at: 1_002_500,
            },
        ));

        let mut headers = HeaderMap::new();
        decision.stamp_headers(&mut headers, 1_000_000);

        assert_eq!(headers[header::RETRY_AFTER], "3");
        assert_eq!(headers[X_RATELIMIT_LIMIT], "5");
    }

    #[test]
    fn test_base_decision_headers() {
        let decision = Decision::Evaluated(Verdict::base(&auth_policy(), false));

        let mut headers = HeaderMap::new();
        decision.stamp_headers(&mut headers, 0);

        assert_eq!(headers[X_RATELIMIT_LIMIT], "5");
        assert_eq!(headers[X_RATELIMIT_WINDOW], "900000");
        assert!(!headers.contains_key(X_RATELIMIT_REMAINING));
        assert_eq!(headers[header::RETRY_AFTER], "900");
        assert_eq!(decision.metric_outcome(), Some("degraded"));
    }

    #[test]
    fn test_bypass_and_disabled_leave_headers_untouched() {
        for decision in [Decision::Bypass, Decision::Disabled] {
            let mut headers = HeaderMap::new();
            decision.stamp_headers(&mut headers, 0);
            assert!(headers.is_empty());
            assert!(decision.is_allowed());
        }
        assert_eq!(Decision::Bypass.metric_outcome(), Some("bypassed"));
        assert_eq!(Decision::Disabled.metric_outcome(), None);
    }
}
