//! glimmr-config - 配置加载库
//!
//! 加载顺序：`{dir}/default.toml` → `{dir}/{APP_ENV}.toml` → `GLIMMR_` 前缀的环境变量
//! （以 `__` 分隔嵌套层级）。所有配置段均有默认值，空配置即可启动。

use std::collections::HashMap;

use figment::{
    Figment,
    providers::{Env, Format, Toml},
};
use secrecy::Secret;
use serde::Deserialize;
use thiserror::Error;

/// 环境变量前缀
pub const ENV_PREFIX: &str = "GLIMMR_";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load config: {0}")]
    Load(#[from] figment::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// 服务器配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

/// 遥测配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub log_level: String,
    /// 是否输出 JSON 格式日志（生产环境）
    pub json: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json: false,
        }
    }
}

/// 网关配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// `X-API-Version` 响应头的值
    pub api_version: String,
    /// API 路由前缀，同时用于运维路径的白名单匹配
    pub api_prefix: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            api_version: "v1".to_string(),
            api_prefix: "/api/v1".to_string(),
        }
    }
}

/// Redis 配置
#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    pub url: Secret<String>,
    /// 单次计数命令的超时（毫秒）
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,
}

fn default_command_timeout_ms() -> u64 {
    250
}

/// 计数存储不可用时的基础判定
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureMode {
    /// 放行
    #[default]
    Open,
    /// 拒绝
    Closed,
}

/// 单个限流策略
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PolicyConfig {
    /// 时间窗口（毫秒）
    pub window_ms: u64,
    /// 窗口内最大请求数
    pub limit: u64,
}

/// 限流配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ThrottleConfig {
    /// 是否启用限流
    pub enabled: bool,
    /// 未知策略名回退到的策略
    pub default_policy: String,
    pub failure_mode: FailureMode,
    pub policies: HashMap<String, PolicyConfig>,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            default_policy: "default".to_string(),
            failure_mode: FailureMode::Open,
            policies: default_policies(),
        }
    }
}

fn default_policies() -> HashMap<String, PolicyConfig> {
    HashMap::from([
        (
            "default".to_string(),
            PolicyConfig {
                window_ms: 60_000,
                limit: 100,
            },
        ),
        (
            "expensive".to_string(),
            PolicyConfig {
                window_ms: 60_000,
                limit: 10,
            },
        ),
        (
            "auth".to_string(),
            PolicyConfig {
                window_ms: 900_000,
                limit: 5,
            },
        ),
    ])
}

/// 应用配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub app_name: String,
    pub app_env: String,
    pub server: ServerConfig,
    pub telemetry: TelemetryConfig,
    pub gateway: GatewayConfig,
    /// 未配置时使用进程内计数存储
    pub redis: Option<RedisConfig>,
    pub throttle: ThrottleConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            app_name: "glimmr-gateway".to_string(),
            app_env: "development".to_string(),
            server: ServerConfig::default(),
            telemetry: TelemetryConfig::default(),
            gateway: GatewayConfig::default(),
            redis: None,
            throttle: ThrottleConfig::default(),
        }
    }
}

impl AppConfig {
    /// 从配置文件和环境变量加载配置
    pub fn load(config_dir: &str) -> Result<Self, ConfigError> {
        let env = std::env::var("APP_ENV").unwrap_or_else(|_| "development".to_string());

        let config: Self = Self::figment(config_dir, &env).extract()?;
        config.validate()?;

        Ok(config)
    }

    /// 构建配置源
    pub fn figment(config_dir: &str, env: &str) -> Figment {
        Figment::new()
            .merge(Toml::file(format!("{}/default.toml", config_dir)))
            .merge(Toml::file(format!("{}/{}.toml", config_dir, env)))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// 语义校验
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self
            .throttle
            .policies
            .contains_key(&self.throttle.default_policy)
        {
            return Err(ConfigError::Invalid(format!(
                "default policy '{}' is not defined",
                self.throttle.default_policy
            )));
        }

        for (name, policy) in &self.throttle.policies {
            if policy.limit == 0 || policy.window_ms == 0 {
                return Err(ConfigError::Invalid(format!(
                    "policy '{}' must have a positive limit and window",
                    name
                )));
            }
        }

        let prefix = &self.gateway.api_prefix;
        if !prefix.is_empty() && !prefix.starts_with('/') {
            return Err(ConfigError::Invalid(format!(
                "api_prefix '{}' must start with '/'",
                prefix
            )));
        }

        // 每个响应都会回写 x-api-version，只允许合法的头字符
        let version = &self.gateway.api_version;
        let visible = version
            .bytes()
            .all(|b| b == b'\t' || (0x20..0x7f).contains(&b));
        if version.is_empty() || !visible {
            return Err(ConfigError::Invalid(format!(
                "api_version {:?} is not a valid header value",
                version
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests;
