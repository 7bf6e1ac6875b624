//! 基础安全响应头

use axum::http::{HeaderMap, HeaderValue, header};
use tracing::warn;

use crate::context::X_REQUEST_ID;

pub const X_API_VERSION: &str = "x-api-version";
pub const X_XSS_PROTECTION: &str = "x-xss-protection";

/// 每个响应都会带上的头
///
/// - X-Request-Id: 请求 ID 回显
/// - X-Content-Type-Options: 防止 MIME 类型嗅探
/// - X-Frame-Options: 防止点击劫持
/// - X-XSS-Protection: 旧版浏览器的 XSS 过滤器
/// - X-API-Version: API 版本
#[derive(Debug, Clone)]
pub struct BaselineHeaders {
    request_id: Option<HeaderValue>,
    api_version: HeaderValue,
}

impl BaselineHeaders {
    /// 请求 ID 不能作为头值时只跳过回显，其余头照常写入
    pub fn new(request_id: &str, api_version: HeaderValue) -> Self {
        let request_id = match HeaderValue::from_str(request_id) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(request_id, error = %e, "Request id cannot be echoed");
                None
            }
        };

        Self {
            request_id,
            api_version,
        }
    }

    pub fn apply(&self, headers: &mut HeaderMap) {
        if let Some(request_id) = &self.request_id {
            headers.insert(X_REQUEST_ID, request_id.clone());
        }
        headers.insert(
            header::X_CONTENT_TYPE_OPTIONS,
            HeaderValue::from_static("nosniff"),
        );
        headers.insert(header::X_FRAME_OPTIONS, HeaderValue::from_static("DENY"));
        headers.insert(X_XSS_PROTECTION, HeaderValue::from_static("1; mode=block"));
        headers.insert(X_API_VERSION, self.api_version.clone());
    }
}
