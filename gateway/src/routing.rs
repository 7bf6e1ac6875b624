//! 路由
//!
//! 运维路由（健康检查、指标）不经过限流；API 路由挂在 `api_prefix` 下并按策略限流

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Request, State},
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::get,
};
use glimmr_errors::{AppError, AppResult};
use glimmr_telemetry::HealthStatus;
use serde::Serialize;
use tower_http::trace::TraceLayer;

use crate::context::{RequestContext, request_context_middleware};
use crate::identity::resolve_identity;
use crate::rate_limit::throttled;
use crate::state::AppState;

/// 构建完整路由
pub fn build_router(state: AppState) -> Router {
    let ops = ops_routes();
    let api = api_routes(&state);

    let app = if state.api_prefix.is_empty() {
        ops.merge(api)
    } else {
        ops.clone()
            .nest(&state.api_prefix, ops.merge(api))
    };

    app.layer(middleware::from_fn_with_state(
        Arc::clone(&state.context),
        request_context_middleware,
    ))
    .layer(TraceLayer::new_for_http())
    .with_state(state)
}

fn ops_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health_check))
        .route("/health/live", get(liveness_check))
        .route("/health/ready", get(readiness_check))
        .route("/metrics", get(metrics))
}

fn api_routes(state: &AppState) -> Router<AppState> {
    let status = Router::new().route("/status", get(request_status));
    throttled(status, state.controller.clone(), "default", "status")
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

async fn liveness_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "alive".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

async fn readiness_check(State(state): State<AppState>) -> Response {
    let mut status = HealthStatus::new();
    match state.store.ping().await {
        Ok(()) => status.add_check(state.store.name(), true, None),
        Err(e) => status.add_check(state.store.name(), false, Some(e.to_string())),
    }

    let code = if status.healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(status)).into_response()
}

async fn metrics(State(state): State<AppState>) -> String {
    state.metrics.render()
}

/// 当前请求的上下文和身份
#[derive(Debug, Serialize)]
pub struct RequestStatus {
    pub request_id: String,
    pub client_ip: String,
    pub identity: String,
}

async fn request_status(request: Request) -> AppResult<Json<RequestStatus>> {
    let context = request
        .extensions()
        .get::<Arc<RequestContext>>()
        .ok_or_else(|| AppError::internal("Request context missing"))?;

    Ok(Json(RequestStatus {
        request_id: context.request_id.clone(),
        client_ip: context.client_ip.clone(),
        identity: resolve_identity(request.headers(), request.extensions()).to_string(),
    }))
}
