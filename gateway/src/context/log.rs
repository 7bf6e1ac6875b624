//! 请求日志记录与分级

use std::fmt;

use thiserror::Error;
use tracing::{Level, event};

use super::RequestContext;
use super::completion::ResponseOutcome;

/// 日志级别
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Error => "error",
            Self::Warn => "warn",
            Self::Info => "info",
            Self::Debug => "debug",
        };
        f.write_str(name)
    }
}

/// 分级结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    pub level: LogLevel,
    pub message: &'static str,
}

/// 慢请求阈值（毫秒）
pub const SLOW_REQUEST_MS: u64 = 1000;
/// 严重慢请求阈值（毫秒）
pub const VERY_SLOW_REQUEST_MS: u64 = 2000;

/// 日志分级
///
/// # 规则（按顺序）
/// 1. 状态码 >= 500: error
/// 2. 状态码 4xx: warn
/// 3. 耗时 > 2000ms: warn
/// 4. 耗时 > 1000ms: info
/// 5. 其他: debug
///
/// 没有状态码（客户端提前断开）时只按耗时分级
pub fn classify(status: Option<u16>, duration_ms: u64) -> Classification {
    let (level, message) = match status {
        Some(status) if status >= 500 => (LogLevel::Error, "Request failed"),
        Some(status) if status >= 400 => (LogLevel::Warn, "Request rejected"),
        _ if duration_ms > VERY_SLOW_REQUEST_MS => (LogLevel::Warn, "Slow request"),
        _ if duration_ms > SLOW_REQUEST_MS => (LogLevel::Info, "Slow"),
        _ => (LogLevel::Debug, "Request completed"),
    };

    Classification { level, message }
}

#[derive(Debug, Error)]
pub enum LogRecordError {
    #[error("Malformed content-length: {0:?}")]
    MalformedContentLength(String),
}

/// 请求日志记录
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestLogRecord {
    pub request_id: String,
    pub method: String,
    pub url: String,
    pub status: Option<u16>,
    pub duration_ms: u64,
    pub client_ip: String,
    pub user_agent: Option<String>,
    pub content_length: Option<u64>,
    pub level: LogLevel,
    pub message: &'static str,
}

impl RequestLogRecord {
    pub fn build(
        context: &RequestContext,
        user_agent: Option<&str>,
        outcome: &ResponseOutcome,
        duration_ms: u64,
    ) -> Result<Self, LogRecordError> {
        let content_length = outcome
            .content_length
            .as_ref()
            .map(|raw| {
                raw.to_str()
                    .ok()
                    .and_then(|v| v.trim().parse::<u64>().ok())
                    .ok_or_else(|| {
                        LogRecordError::MalformedContentLength(
                            String::from_utf8_lossy(raw.as_bytes()).into_owned(),
                        )
                    })
            })
            .transpose()?;

        let Classification { level, message } = classify(outcome.status, duration_ms);

        Ok(Self {
            request_id: context.request_id.clone(),
            method: context.method.to_string(),
            url: context.url.clone(),
            status: outcome.status,
            duration_ms,
            client_ip: context.client_ip.clone(),
            user_agent: user_agent.map(str::to_string),
            content_length,
            level,
            message,
        })
    }
}

/// 结构化日志输出
pub trait LogSink: Send + Sync {
    fn emit(&self, record: &RequestLogRecord);

    /// 构建日志记录失败时输出的次级错误记录
    fn emit_failure(&self, request_id: &str, error: &LogRecordError);
}

/// 输出到 tracing
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingLogSink;

macro_rules! request_event {
    ($level:expr, $record:ident) => {
        event!(
            $level,
            request_id = %$record.request_id,
            method = %$record.method,
            url = %$record.url,
            status = $record.status,
            duration_ms = $record.duration_ms,
            client_ip = %$record.client_ip,
            user_agent = $record.user_agent.as_deref(),
            content_length = $record.content_length,
            "{}",
            $record.message
        )
    };
}

impl LogSink for TracingLogSink {
    fn emit(&self, record: &RequestLogRecord) {
        match record.level {
            LogLevel::Error => request_event!(Level::ERROR, record),
            LogLevel::Warn => request_event!(Level::WARN, record),
            LogLevel::Info => request_event!(Level::INFO, record),
            LogLevel::Debug => request_event!(Level::DEBUG, record),
        }
    }

    fn emit_failure(&self, request_id: &str, error: &LogRecordError) {
        tracing::error!(request_id, error = %error, "Failed to build request log record");
    }
}
