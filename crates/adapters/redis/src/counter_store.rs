//! 基于 Redis 的限流计数存储
//!
//! 固定窗口：首次计数时设置过期时间，整个过程由 Lua 脚本保证原子性

use std::time::Duration;

use async_trait::async_trait;
use glimmr_errors::{AppError, AppResult};
use glimmr_ports::{CounterOutcome, CounterStore};
use redis::Script;
use redis::aio::ConnectionManager;
use tracing::debug;

use crate::connection::check_connection;

/// Lua 脚本：固定窗口计数
///
/// # 参数
/// - KEYS[1]: 桶键
/// - ARGV[1]: 最大请求数
/// - ARGV[2]: 窗口大小（毫秒）
///
/// # 返回值
/// - array[0]: 是否允许 (1/0)
/// - array[1]: 剩余请求数
/// - array[2]: 窗口剩余时间（毫秒）
static FIXED_WINDOW_SCRIPT: &str = r#"
local key = KEYS[1]
local limit = tonumber(ARGV[1])
local window_ms = tonumber(ARGV[2])

local current = redis.call('INCR', key)
if current == 1 then
    redis.call('PEXPIRE', key, window_ms)
end

local ttl = redis.call('PTTL', key)
if ttl < 0 then
    -- 键丢失了过期时间（例如被外部 PERSIST），重新设置
    redis.call('PEXPIRE', key, window_ms)
    ttl = window_ms
end

local remaining = limit - current
if remaining < 0 then
    remaining = 0
end

return {current <= limit and 1 or 0, remaining, ttl}
"#;

/// Redis 计数存储
#[derive(Clone)]
pub struct RedisCounterStore {
    conn: ConnectionManager,
    script: Script,
    command_timeout: Duration,
}

impl RedisCounterStore {
    /// 创建新的计数存储
    pub fn new(conn: ConnectionManager, command_timeout: Duration) -> Self {
        Self {
            conn,
            script: Script::new(FIXED_WINDOW_SCRIPT),
            command_timeout,
        }
    }

    async fn run_script(&self, key: &str, window_ms: u64, limit: u64) -> AppResult<Vec<i64>> {
        let mut conn = self.conn.clone();
        let mut invocation = self.script.key(key);
        invocation.arg(limit).arg(window_ms);

        let result: Result<redis::RedisResult<Vec<i64>>, _> =
            tokio::time::timeout(self.command_timeout, invocation.invoke_async(&mut conn)).await;

        match result {
            Ok(values) => values
                .map_err(|e| AppError::external_service(format!("Rate limit script failed: {}", e))),
            Err(_) => Err(AppError::external_service(format!(
                "Rate limit script timed out after {}ms",
                self.command_timeout.as_millis()
            ))),
        }
    }
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn increment(&self, key: &str, window_ms: u64, limit: u64) -> AppResult<CounterOutcome> {
        let now_ms = u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or_default();
        let values = self.run_script(key, window_ms, limit).await?;

        let outcome = parse_script_result(&values, now_ms)?;

        debug!(
            key,
            allowed = outcome.allowed,
            remaining = outcome.remaining,
            limit,
            "Fixed window rate limit check"
        );

        Ok(outcome)
    }

    async fn ping(&self) -> AppResult<()> {
        let mut conn = self.conn.clone();
        match tokio::time::timeout(self.command_timeout, check_connection(&mut conn)).await {
            Ok(result) => result,
            Err(_) => Err(AppError::external_service("Redis health check timed out")),
        }
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}

/// 解析脚本返回的 `[allowed, remaining, ttl_ms]`
fn parse_script_result(values: &[i64], now_ms: u64) -> AppResult<CounterOutcome> {
    let [allowed, remaining, ttl_ms] = values else {
        return Err(AppError::internal(format!(
            "Unexpected script result length: {}",
            values.len()
        )));
    };

    Ok(CounterOutcome {
        allowed: *allowed == 1,
        remaining: u64::try_from(*remaining).unwrap_or_default(),
        reset_at: now_ms.saturating_add(u64::try_from(*ttl_ms).unwrap_or_default()),
    })
}
