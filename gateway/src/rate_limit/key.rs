//! 限流桶键

use std::fmt;

/// 桶键前缀
pub const KEY_PREFIX: &str = "throttle";

/// 限流桶键
///
/// 格式：`throttle:{policy}:{method}:{route}:{identity}:{suffix}`，
/// 只由这五个输入决定
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BucketKey(String);

impl BucketKey {
    pub fn new(policy: &str, method: &str, route: &str, identity: &str, suffix: &str) -> Self {
        Self(format!(
            "{}:{}:{}:{}:{}:{}",
            KEY_PREFIX, policy, method, route, identity, suffix
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BucketKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
