//! 运维路径白名单
//!
//! `/health`、`/health/ready`、`/health/live`、`/metrics` 精确匹配，
//! 也接受带 API 前缀的形式（如 `/api/v1/health`）

use regex::Regex;

/// 运维路径白名单
#[derive(Debug, Clone)]
pub struct OperationalAllowlist {
    pattern: Regex,
}

impl OperationalAllowlist {
    pub fn new(api_prefix: &str) -> Result<Self, regex::Error> {
        let prefix = api_prefix.trim_end_matches('/');
        let pattern = if prefix.is_empty() {
            r"^/(?:health(?:/ready|/live)?|metrics)$".to_string()
        } else {
            format!(
                r"^(?:{})?/(?:health(?:/ready|/live)?|metrics)$",
                regex::escape(prefix)
            )
        };

        Ok(Self {
            pattern: Regex::new(&pattern)?,
        })
    }

    /// 路径是否在白名单中
    pub fn contains(&self, path: &str) -> bool {
        self.pattern.is_match(path)
    }
}
