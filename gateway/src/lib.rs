//! Glimmr API Gateway
//!
//! 请求边界中间件：客户端身份解析、准入控制（限流）、请求上下文与响应日志

pub mod context;
pub mod identity;
pub mod rate_limit;
pub mod routing;
pub mod security_headers;
pub mod state;

pub use routing::build_router;
pub use state::AppState;
