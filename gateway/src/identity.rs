//! 客户端身份解析
//!
//! 将请求映射为稳定的身份字符串：
//! - 已认证用户: `user:{id}`
//! - 未认证用户: `ip:{ip}`

use std::fmt;
use std::net::{IpAddr, SocketAddr};

use axum::extract::ConnectInfo;
use axum::http::{Extensions, HeaderMap};

pub const X_FORWARDED_FOR: &str = "x-forwarded-for";
pub const X_REAL_IP: &str = "x-real-ip";
pub const X_CLIENT_IP: &str = "x-client-ip";

/// 无法确定客户端地址时的占位值
pub const UNKNOWN_IP: &str = "unknown";

/// 已认证主体
///
/// 由上游认证层写入请求扩展，本层只读取
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub id: String,
}

impl Principal {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

/// 框架解析出的客户端地址（已考虑受信代理）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedClientIp(pub IpAddr);

/// 请求身份
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestIdentity {
    Authenticated(String),
    Anonymous(String),
}

impl RequestIdentity {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Authenticated(_) => "user",
            Self::Anonymous(_) => "ip",
        }
    }

    pub fn value(&self) -> &str {
        match self {
            Self::Authenticated(id) | Self::Anonymous(id) => id,
        }
    }
}

impl fmt::Display for RequestIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind(), self.value())
    }
}

/// 解析请求身份
///
/// 已认证主体（id 非空）总是优先于任何 IP 来源
pub fn resolve_identity(headers: &HeaderMap, extensions: &Extensions) -> RequestIdentity {
    if let Some(principal) = extensions.get::<Principal>() {
        if !principal.id.is_empty() {
            return RequestIdentity::Authenticated(principal.id.clone());
        }
    }

    RequestIdentity::Anonymous(resolve_client_ip(headers, extensions))
}

/// 解析客户端 IP
///
/// # 优先级
/// 1. `X-Forwarded-For` 的第一项
/// 2. `X-Real-IP`
/// 3. `X-Client-IP`
/// 4. 框架解析出的地址 ([`ResolvedClientIp`])
/// 5. 连接的对端地址 (`ConnectInfo<SocketAddr>`)
/// 6. `unknown`
pub fn resolve_client_ip(headers: &HeaderMap, extensions: &Extensions) -> String {
    header_str(headers, X_FORWARDED_FOR)
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .or_else(|| header_str(headers, X_REAL_IP))
        .or_else(|| header_str(headers, X_CLIENT_IP))
        .map(str::to_string)
        .or_else(|| {
            extensions
                .get::<ResolvedClientIp>()
                .map(|ip| ip.0.to_string())
        })
        .or_else(|| {
            extensions
                .get::<ConnectInfo<SocketAddr>>()
                .map(|ConnectInfo(addr)| addr.ip().to_string())
        })
        .unwrap_or_else(|| UNKNOWN_IP.to_string())
}

/// 读取非空的头部值；非 ASCII 值视为缺失
fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use std::net::Ipv4Addr;

    fn header_map(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(*name, HeaderValue::from_static(*value));
        }
        map
    }

    #[test]
    fn test_principal_takes_precedence() {
        let headers = header_map(&[
            (X_FORWARDED_FOR, "203.0.113.7"),
            (X_REAL_IP, "198.51.100.1"),
        ]);
        let mut extensions = Extensions::new();
        extensions.insert(Principal::new("user123"));

        let identity = resolve_identity(&headers, &extensions);
        assert_eq!(identity, RequestIdentity::Authenticated("user123".to_string()));
        assert_eq!(identity.to_string(), "user:user123");
    }

    #[test]
    fn test_empty_principal_falls_back_to_ip() {
        let headers = header_map(&[(X_REAL_IP, "198.51.100.1")]);
        let mut extensions = Extensions::new();
        extensions.insert(Principal::new(""));

        let identity = resolve_identity(&headers, &extensions);
        assert_eq!(identity.to_string(), "ip:198.51.100.1");
    }

    #[test]
    fn test_long_subject_id_preserved() {
        let id = "u".repeat(4096);
        let mut extensions = Extensions::new();
        extensions.insert(Principal::new(id.clone()));

        let identity = resolve_identity(&HeaderMap::new(), &extensions);
        assert_eq!(identity.to_string(), format!("user:{}", id));
    }

    #[test]
    fn test_forwarded_for_first_entry() {
        let headers = header_map(&[
            (X_FORWARDED_FOR, " 203.0.113.7 , 10.0.0.1, 10.0.0.2"),
            (X_REAL_IP, "198.51.100.1"),
        ]);

        assert_eq!(resolve_client_ip(&headers, &Extensions::new()), "203.0.113.7");
    }

    #[test]
    fn test_empty_forwarded_for_falls_through() {
        let headers = header_map(&[(X_FORWARDED_FOR, " , 10.0.0.1"), (X_REAL_IP, "198.51.100.1")]);

        assert_eq!(resolve_client_ip(&headers, &Extensions::new()), "198.51.100.1");
    }

    #[test]
    fn test_real_ip_before_client_ip() {
        let headers = header_map(&[(X_CLIENT_IP, "192.0.2.9"), (X_REAL_IP, "198.51.100.1")]);
        assert_eq!(resolve_client_ip(&headers, &Extensions::new()), "198.51.100.1");

        let headers = header_map(&[(X_CLIENT_IP, "192.0.2.9")]);
        assert_eq!(resolve_client_ip(&headers, &Extensions::new()), "192.0.2.9");
    }

    #[test]
    fn test_resolved_ip_before_socket_address() {
        let mut extensions = Extensions::new();
        extensions.insert(ConnectInfo(SocketAddr::from(([127, 0, 0, 1], 4000))));
        extensions.insert(ResolvedClientIp(IpAddr::V4(Ipv4Addr::new(10, 1, 2, 3))));

        assert_eq!(resolve_client_ip(&HeaderMap::new(), &extensions), "10.1.2.3");
    }

    #[test]
    fn test_socket_address_fallback() {
        let mut extensions = Extensions::new();
        extensions.insert(ConnectInfo(SocketAddr::from(([127, 0, 0, 1], 4000))));

        let identity = resolve_identity(&HeaderMap::new(), &extensions);
        assert_eq!(identity.to_string(), "ip:127.0.0.1");
    }

    #[test]
    fn test_unknown_sentinel() {
        let identity = resolve_identity(&HeaderMap::new(), &Extensions::new());
        assert_eq!(identity, RequestIdentity::Anonymous("unknown".to_string()));
        assert_eq!(identity.to_string(), "ip:unknown");
    }

    #[test]
    fn test_non_ascii_header_treated_as_missing() {
        let mut map = HeaderMap::new();
        map.insert(X_FORWARDED_FOR, HeaderValue::from_bytes(b"\xff\xfe").unwrap());
        map.insert(X_CLIENT_IP, HeaderValue::from_static("192.0.2.9"));

        assert_eq!(resolve_client_ip(&map, &Extensions::new()), "192.0.2.9");
    }
}
