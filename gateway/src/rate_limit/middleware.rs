//! 准入控制中间件
//!
//! 判定分两步：[`AdmissionController::prepare`] 同步地从请求中取出桶键和策略，
//! [`AdmissionController::decide`] 再异步地查询计数存储

use std::sync::Arc;

use axum::{
    extract::{MatchedPath, OriginalUri, Request, State},
    http,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    Router,
};
use glimmr_config::ThrottleConfig;
use glimmr_errors::AppError;
use metrics::counter;
use tracing::{debug, warn};

use super::bypass::OperationalAllowlist;
use super::key::BucketKey;
use super::limiter::ThrottleAlgorithm;
use super::policy::PolicyRegistry;
use super::types::{Decision, RatePolicy};
use super::{ThrottleError, now_millis};
use crate::context::RequestContext;
use crate::identity::resolve_identity;

/// 从请求中取出的判定输入
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Bypass,
    Disabled,
    /// 正常计数
    Keyed { key: BucketKey, policy: RatePolicy },
    /// 无法构造桶键，交给基础判定
    Unkeyed { policy: RatePolicy },
}

/// 准入控制器
///
/// 自身无状态，跨请求的计数全部由限流算法背后的存储维护
#[derive(Clone)]
pub struct AdmissionController {
    algorithm: Arc<dyn ThrottleAlgorithm>,
    policies: Arc<PolicyRegistry>,
    allowlist: Arc<OperationalAllowlist>,
    enabled: bool,
}

impl AdmissionController {
    pub fn new(
        algorithm: Arc<dyn ThrottleAlgorithm>,
        policies: PolicyRegistry,
        allowlist: OperationalAllowlist,
        enabled: bool,
    ) -> Self {
        Self {
            algorithm,
            policies: Arc::new(policies),
            allowlist: Arc::new(allowlist),
            enabled,
        }
    }

    /// 根据配置创建
    pub fn from_config(
        algorithm: Arc<dyn ThrottleAlgorithm>,
        config: &ThrottleConfig,
        api_prefix: &str,
    ) -> Result<Self, ThrottleError> {
        Ok(Self::new(
            algorithm,
            PolicyRegistry::from_config(config)?,
            OperationalAllowlist::new(api_prefix)?,
            config.enabled,
        ))
    }

    /// 路由使用的策略名
    ///
    /// 未知名称在挂载路由时告警一次，之后按默认策略计数和上报
    pub fn route_policy(&self, name: &str) -> String {
        if self.policies.contains(name) {
            return name.to_string();
        }

        let fallback = self.policies.default_policy().name.clone();
        warn!(
            policy = name,
            fallback = %fallback,
            "Unknown rate limit policy, using default"
        );
        fallback
    }

    /// 准备判定输入
    ///
    /// # 顺序
    /// 1. 运维路径白名单：直接放行，不查询存储
    /// 2. 限流关闭：直接放行
    /// 3. 构造桶键；失败时退回基础判定
    pub fn prepare<B>(&self, request: &http::Request<B>, policy_name: &str, suffix: &str) -> Admission {
        let path = request
            .extensions()
            .get::<OriginalUri>()
            .map(|uri| uri.0.path())
            .unwrap_or_else(|| request.uri().path());

        if self.allowlist.contains(path) {
            return Admission::Bypass;
        }

        if !self.enabled {
            return Admission::Disabled;
        }

        let policy = self.policies.resolve(policy_name).clone();

        match bucket_key(request, path, &policy, suffix) {
            Ok(key) => Admission::Keyed { key, policy },
            Err(e) => {
                warn!(
                    error = %e,
                    policy = %policy.name,
                    path,
                    "Cannot build rate limit key, using base decision"
                );
                Admission::Unkeyed { policy }
            }
        }
    }

    /// 执行判定
    pub async fn decide(&self, admission: Admission) -> Decision {
        match admission {
            Admission::Bypass => Decision::Bypass,
            Admission::Disabled => Decision::Disabled,
            Admission::Keyed { key, policy } => {
                Decision::Evaluated(self.algorithm.evaluate(&key, &policy).await)
            }
            Admission::Unkeyed { policy } => {
                Decision::Evaluated(self.algorithm.base_decision(&policy))
            }
        }
    }
}

/// 构造桶键
///
/// 路由优先使用框架匹配到的模板，否则使用原始路径
fn bucket_key<B>(
    request: &http::Request<B>,
    path: &str,
    policy: &RatePolicy,
    suffix: &str,
) -> Result<BucketKey, ThrottleError> {
    let context = request
        .extensions()
        .get::<Arc<RequestContext>>()
        .ok_or(ThrottleError::MalformedRequestContext)?;

    let route = request
        .extensions()
        .get::<MatchedPath>()
        .map(MatchedPath::as_str)
        .unwrap_or(path);

    let identity = resolve_identity(request.headers(), request.extensions());

    Ok(BucketKey::new(
        &policy.name,
        context.method.as_str(),
        route,
        &identity.to_string(),
        suffix,
    ))
}

/// 单个受限路由的中间件状态
///
/// `policy` 保存解析后的策略名
#[derive(Clone)]
pub struct ThrottleRoute {
    pub controller: AdmissionController,
    pub policy: String,
    pub suffix: String,
}

impl ThrottleRoute {
    pub fn new(
        controller: AdmissionController,
        policy: impl Into<String>,
        suffix: impl Into<String>,
    ) -> Self {
        let policy: String = policy.into();
        let policy = controller.route_policy(&policy);
        Self {
            controller,
            policy,
            suffix: suffix.into(),
        }
    }
}

/// Axum 中间件函数
pub async fn throttle_middleware(
    State(route): State<ThrottleRoute>,
    request: Request,
    next: Next,
) -> Response {
    let admission = route
        .controller
        .prepare(&request, &route.policy, &route.suffix);
    let decision = route.controller.decide(admission).await;
    let policy = decision
        .policy_name()
        .unwrap_or(&route.policy)
        .to_string();

    if let Some(outcome) = decision.metric_outcome() {
        counter!(
            "gateway_throttle_decisions_total",
            "policy" => policy.clone(),
            "outcome" => outcome
        )
        .increment(1);
    }

    let now_ms = now_millis();

    if !decision.is_allowed() {
        warn!(
            policy = %policy,
            endpoint = %request.uri().path(),
            method = %request.method(),
            "Rate limit exceeded"
        );

        let mut response = AppError::resource_exhausted(format!(
            "Rate limit exceeded for policy '{}'",
            policy
        ))
        .into_response();
        decision.stamp_headers(response.headers_mut(), now_ms);
        return response;
    }

    debug!(
        policy = %policy,
        endpoint = %request.uri().path(),
        "Request admitted"
    );

    let mut response = next.run(request).await;
    decision.stamp_headers(response.headers_mut(), now_ms);
    response
}

/// 为路由挂上限流
///
/// 使用 `route_layer`，只作用于已匹配的路由，因此能拿到路由模板
pub fn throttled<S>(
    router: Router<S>,
    controller: AdmissionController,
    policy: &str,
    suffix: &str,
) -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    router.route_layer(middleware::from_fn_with_state(
        ThrottleRoute::new(controller, policy, suffix),
        throttle_middleware,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rate_limit::limiter::StoreLimiter;
    use crate::rate_limit::types::{X_RATELIMIT_LIMIT, X_RATELIMIT_REMAINING, X_RATELIMIT_WINDOW};
    use axum::{
        body::Body,
        http::{HeaderValue, Method, StatusCode, header},
        routing::get,
    };
    use glimmr_config::FailureMode;
    use glimmr_ports::{CounterOutcome, MockCounterStore};
    use tower::ServiceExt;

    fn controller(store: MockCounterStore, enabled: bool) -> AdmissionController {
        let config = ThrottleConfig {
            enabled,
            ..ThrottleConfig::default()
        };
        AdmissionController::from_config(
            Arc::new(StoreLimiter::new(Arc::new(store), FailureMode::Open)),
            &config,
            "/api/v1",
        )
        .unwrap()
    }

    fn allowed(remaining: u64) -> CounterOutcome {
        CounterOutcome {
            allowed: true,
            remaining,
            reset_at: now_millis() + 60_000,
        }
    }

    async fn attach_context(mut request: Request, next: Next) -> Response {
        let context = RequestContext::new(
            "req-test",
            "203.0.113.7",
            request.method().clone(),
            request.uri().to_string(),
        );
        request.extensions_mut().insert(Arc::new(context));
        next.run(request).await
    }

    fn app(controller: AdmissionController, policy: &str) -> Router {
        let items = Router::new().route("/items/{id}", get(|| async { "item" }));
        throttled(items, controller, policy, "items")
            .layer(axum::middleware::from_fn(attach_context))
    }

    fn get_request(uri: &str) -> http::Request<Body> {
        http::Request::builder()
            .uri(uri)
            .header("x-forwarded-for", "203.0.113.7")
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn test_bypass_never_touches_store() {
        let mut store = MockCounterStore::new();
        store.expect_increment().times(0);
        let controller = controller(store, true);

        for path in [
            "/health",
            "/health/ready",
            "/health/live",
            "/metrics",
            "/api/v1/health",
            "/api/v1/health/ready",
            "/api/v1/health/live",
            "/api/v1/metrics",
        ] {
            let mut request = http::Request::builder().uri(path).body(()).unwrap();
            request.headers_mut().insert(
                "x-forwarded-for",
                HeaderValue::from_bytes(b"\xff\xfe").unwrap(),
            );

            let admission = controller.prepare(&request, "default", "ops");
            assert_eq!(admission, Admission::Bypass, "{path}");
            assert_eq!(controller.decide(admission).await, Decision::Bypass);
        }
    }

    #[tokio::test]
    async fn test_disabled_allows_without_store() {
        let mut store = MockCounterStore::new();
        store.expect_increment().times(0);
        let controller = controller(store, false);

        let request = http::Request::builder().uri("/items/1").body(()).unwrap();
        let admission = controller.prepare(&request, "default", "items");
        assert_eq!(controller.decide(admission).await, Decision::Disabled);
    }

    #[tokio::test]
    async fn test_missing_context_uses_base_decision() {
        let mut store = MockCounterStore::new();
        store.expect_increment().times(0);
        let controller = controller(store, true);

        let request = http::Request::builder()
            .method(Method::POST)
            .uri("/login")
            .body(())
            .unwrap();

        let admission = controller.prepare(&request, "auth", "login");
        assert!(matches!(&admission, Admission::Unkeyed { policy } if policy.name == "auth"));

        let decision = controller.decide(admission).await;
        assert!(decision.is_allowed());
        assert_eq!(decision.metric_outcome(), Some("degraded"));
    }

    #[tokio::test]
    async fn test_key_uses_route_template() {
        let mut store = MockCounterStore::new();
        store
            .expect_increment()
            .withf(|key, _, _| key == "throttle:default:GET:/items/{id}:ip:203.0.113.7:items")
            .times(1)
            .returning(|_, _, _| Ok(allowed(99)));

        let response = app(controller(store, true), "default")
            .oneshot(get_request("/items/42"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[X_RATELIMIT_LIMIT], "100");
        assert_eq!(response.headers()[X_RATELIMIT_WINDOW], "60000");
        assert_eq!(response.headers()[X_RATELIMIT_REMAINING], "99");
    }

    #[tokio::test]
    async fn test_headers_follow_evaluated_policy() {
        let mut store = MockCounterStore::new();
        store
            .expect_increment()
            .withf(|_, window_ms, limit| *window_ms == 900_000 && *limit == 5)
            .times(1)
            .returning(|_, _, _| Ok(allowed(4)));

        let response = app(controller(store, true), "auth")
            .oneshot(get_request("/items/42"))
            .await
            .unwrap();

        assert_eq!(response.headers()[X_RATELIMIT_LIMIT], "5");
        assert_eq!(response.headers()[X_RATELIMIT_WINDOW], "900000");
    }

    #[tokio::test]
    async fn test_unknown_policy_uses_default() {
        let mut store = MockCounterStore::new();
        store
            .expect_increment()
            .withf(|key, window_ms, limit| {
                key.starts_with("throttle:default:") && *window_ms == 60_000 && *limit == 100
            })
            .times(1)
            .returning(|_, _, _| Ok(allowed(99)));

        let response = app(controller(store, true), "no-such-policy")
            .oneshot(get_request("/items/42"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[X_RATELIMIT_LIMIT], "100");
    }

    #[tokio::test]
    async fn test_denied_request_returns_429() {
        let mut store = MockCounterStore::new();
        store.expect_increment().times(1).returning(|_, _, _| {
            Ok(CounterOutcome {
                allowed: false,
                remaining: 0,
                reset_at: now_millis() + 30_000,
            })
        });

        let response = app(controller(store, true), "expensive")
            .oneshot(get_request("/items/42"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            glimmr_errors::PROBLEM_JSON
        );
        assert_eq!(response.headers()[X_RATELIMIT_LIMIT], "10");
        assert_eq!(response.headers()[X_RATELIMIT_REMAINING], "0");
        assert!(response.headers().contains_key(header::RETRY_AFTER));
    }

    #[tokio::test]
    async fn test_unknown_policy_reported_as_default() {
        let mut store = MockCounterStore::new();
        store.expect_increment().times(1).returning(|_, _, _| {
            Ok(CounterOutcome {
                allowed: false,
                remaining: 0,
                reset_at: now_millis() + 30_000,
            })
        });
        let controller = controller(store, true);

        let route = ThrottleRoute::new(controller.clone(), "no-such-policy", "items");
        assert_eq!(route.policy, "default");

        let response = app(controller, "no-such-policy")
            .oneshot(get_request("/items/42"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let problem: serde_json::Value = serde_json::from_slice(&body).unwrap();
        let detail = problem["detail"].as_str().unwrap();
        assert!(detail.contains("'default'"), "{detail}");
        assert!(!detail.contains("no-such-policy"), "{detail}");
    }
}
