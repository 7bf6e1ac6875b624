//! 限流策略注册表

use std::collections::HashMap;

use glimmr_config::ThrottleConfig;

use super::ThrottleError;
use super::types::RatePolicy;

/// 按名称查找限流策略
#[derive(Debug, Clone)]
pub struct PolicyRegistry {
    policies: HashMap<String, RatePolicy>,
    default_policy: String,
}

impl PolicyRegistry {
    pub fn from_config(config: &ThrottleConfig) -> Result<Self, ThrottleError> {
        let policies: HashMap<String, RatePolicy> = config
            .policies
            .iter()
            .map(|(name, policy)| (name.clone(), RatePolicy::from_config(name.clone(), policy)))
            .collect();

        if !policies.contains_key(&config.default_policy) {
            return Err(ThrottleError::MissingDefaultPolicy(
                config.default_policy.clone(),
            ));
        }

        Ok(Self {
            policies,
            default_policy: config.default_policy.clone(),
        })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.policies.contains_key(name)
    }

    /// 获取策略
    ///
    /// 未知名称回退到默认策略
    pub fn resolve(&self, name: &str) -> &RatePolicy {
        self.policies
            .get(name)
            .unwrap_or_else(|| self.default_policy())
    }

    pub fn default_policy(&self) -> &RatePolicy {
        &self.policies[&self.default_policy]
    }
}
