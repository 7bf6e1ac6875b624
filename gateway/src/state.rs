//! 应用状态

use std::sync::Arc;
use std::time::Duration;

use glimmr_adapter_redis::{RedisCounterStore, create_connection_manager};
use glimmr_config::AppConfig;
use glimmr_errors::AppResult;
use glimmr_ports::CounterStore;
use metrics_exporter_prometheus::PrometheusHandle;
use secrecy::ExposeSecret;
use thiserror::Error;
use tracing::info;

use crate::context::{ContextError, ContextState};
use crate::context::log::LogSink;
use crate::rate_limit::{AdmissionController, MemoryCounterStore, StoreLimiter, ThrottleError};

/// 状态构建错误（配置不可用）
#[derive(Debug, Error)]
pub enum StateError {
    #[error(transparent)]
    Throttle(#[from] ThrottleError),

    #[error(transparent)]
    Context(#[from] ContextError),
}

/// 共享状态
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn CounterStore>,
    pub controller: AdmissionController,
    pub context: Arc<ContextState>,
    pub metrics: PrometheusHandle,
    pub api_prefix: String,
}

impl AppState {
    pub fn from_config(
        config: &AppConfig,
        store: Arc<dyn CounterStore>,
        sink: Arc<dyn LogSink>,
        metrics: PrometheusHandle,
    ) -> Result<Self, StateError> {
        let limiter = StoreLimiter::new(Arc::clone(&store), config.throttle.failure_mode);
        let controller = AdmissionController::from_config(
            Arc::new(limiter),
            &config.throttle,
            &config.gateway.api_prefix,
        )?;

        Ok(Self {
            store,
            controller,
            context: Arc::new(ContextState::new(&config.gateway.api_version, sink)?),
            metrics,
            api_prefix: config.gateway.api_prefix.trim_end_matches('/').to_string(),
        })
    }
}

/// 创建计数存储
///
/// 配置了 `[redis]` 时使用 Redis，否则使用进程内存储
pub async fn counter_store(config: &AppConfig) -> AppResult<Arc<dyn CounterStore>> {
    match &config.redis {
        Some(redis) => {
            let conn = create_connection_manager(redis.url.expose_secret()).await?;
            info!(
                command_timeout_ms = redis.command_timeout_ms,
                "Using Redis counter store"
            );
            Ok(Arc::new(RedisCounterStore::new(
                conn,
                Duration::from_millis(redis.command_timeout_ms),
            )))
        }
        None => {
            info!("No Redis configured, using in-process counter store");
            Ok(Arc::new(MemoryCounterStore::new()))
        }
    }
}
