//! 请求上下文中间件
//!
//! 为每个请求分配请求 ID、解析客户端 IP、写入基础响应头，
//! 并在响应完成时输出分级的结构化日志

pub mod completion;
pub mod log;

use std::sync::Arc;
use std::time::Instant;

use axum::{
    body::Body,
    extract::{Request, State},
    http::{HeaderMap, HeaderValue, Method, header},
    middleware::Next,
    response::Response,
};
use metrics::{counter, histogram};
use rand::{Rng, distributions::Alphanumeric};
use thiserror::Error;
use tracing::debug;

use crate::identity::resolve_client_ip;
use crate::security_headers::{BaselineHeaders, X_API_VERSION};
use self::completion::{
    CompletionBody, CompletionGuard, FinalizeCall, HostFinalize, InstrumentedFinalize,
};
use self::log::LogSink;

pub const X_REQUEST_ID: &str = "x-request-id";
pub const X_CORRELATION_ID: &str = "x-correlation-id";
pub const X_TRACE_ID: &str = "x-trace-id";

/// 请求 ID 来源头，按优先级排列
const REQUEST_ID_HEADERS: [&str; 3] = [X_REQUEST_ID, X_CORRELATION_ID, X_TRACE_ID];

/// 生成的请求 ID 中随机部分的长度
const REQUEST_ID_SUFFIX_LEN: usize = 9;

/// 请求上下文配置错误
#[derive(Debug, Error)]
pub enum ContextError {
    #[error("Invalid value for {header} header: {reason}")]
    InvalidHeaderValue { header: &'static str, reason: String },
}

/// 请求上下文
///
/// 请求进入时创建一次，之后不再修改；处理器可从请求扩展中读取 `Arc<RequestContext>`
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub request_id: String,
    pub started_at: Instant,
    pub client_ip: String,
    pub method: Method,
    pub url: String,
}

impl RequestContext {
    pub fn new(
        request_id: impl Into<String>,
        client_ip: impl Into<String>,
        method: Method,
        url: impl Into<String>,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            started_at: Instant::now(),
            client_ip: client_ip.into(),
            method,
            url: url.into(),
        }
    }

    pub fn from_request(request: &Request) -> Self {
        Self::new(
            resolve_request_id(request.headers()),
            resolve_client_ip(request.headers(), request.extensions()),
            request.method().clone(),
            request.uri().to_string(),
        )
    }
}

/// 解析请求 ID
///
/// 依次读取 `x-request-id`、`x-correlation-id`、`x-trace-id`，都没有时生成新的 ID。
/// 空白或不是可见 ASCII 的头视为不存在
pub fn resolve_request_id(headers: &HeaderMap) -> String {
    for name in REQUEST_ID_HEADERS {
        let Some(value) = headers.get(name) else {
            continue;
        };
        match value.to_str() {
            Ok(value) if !value.trim().is_empty() => return value.trim().to_string(),
            Ok(_) => {}
            Err(_) => debug!(header = name, "Ignoring malformed request id header"),
        }
    }

    generate_request_id()
}

/// 生成请求 ID：`req_{毫秒时间戳}_{随机后缀}`
pub fn generate_request_id() -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(REQUEST_ID_SUFFIX_LEN)
        .map(|b| char::from(b).to_ascii_lowercase())
        .collect();

    format!("req_{}_{}", chrono::Utc::now().timestamp_millis(), suffix)
}

/// 请求上下文中间件状态
#[derive(Clone)]
pub struct ContextState {
    pub api_version: HeaderValue,
    pub sink: Arc<dyn LogSink>,
}

impl ContextState {
    /// `api_version` 在这里一次性转换为头值，请求处理中不会再失败
    pub fn new(api_version: &str, sink: Arc<dyn LogSink>) -> Result<Self, ContextError> {
        let api_version =
            HeaderValue::from_str(api_version).map_err(|e| ContextError::InvalidHeaderValue {
                header: X_API_VERSION,
                reason: e.to_string(),
            })?;

        Ok(Self { api_version, sink })
    }
}

/// Axum 中间件函数
///
/// 响应头在处理器返回时写入；日志和完成回调在响应 body 发送完毕（或被丢弃）时执行
pub async fn request_context_middleware(
    State(state): State<Arc<ContextState>>,
    mut request: Request,
    next: Next,
) -> Response {
    let context = Arc::new(RequestContext::from_request(&request));
    let baseline = BaselineHeaders::new(&context.request_id, state.api_version.clone());

    let user_agent = request
        .headers()
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    request.extensions_mut().insert(Arc::clone(&context));

    let guard = CompletionGuard::new(InstrumentedFinalize::new(
        HostFinalize,
        Arc::clone(&state.sink),
        Arc::clone(&context),
        user_agent,
    ));

    let mut response = next.run(request).await;
    baseline.apply(response.headers_mut());

    let status = response.status().as_u16().to_string();
    counter!(
        "gateway_http_requests_total",
        "method" => context.method.to_string(),
        "status" => status
    )
    .increment(1);
    histogram!(
        "gateway_http_request_duration_ms",
        "method" => context.method.to_string()
    )
    .record(context.started_at.elapsed().as_secs_f64() * 1000.0);

    let call = FinalizeCall::from_response(&mut response);
    response.map(|body| Body::new(CompletionBody::new(body, guard, call)))
}
