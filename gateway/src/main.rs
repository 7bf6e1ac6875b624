//! Glimmr API Gateway

use std::net::SocketAddr;
use std::sync::Arc;

use glimmr_config::AppConfig;
use glimmr_gateway::build_router;
use glimmr_gateway::context::log::TracingLogSink;
use glimmr_gateway::state::{AppState, counter_store};
use glimmr_telemetry::{init_metrics, init_tracing, init_tracing_json};
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();

    // 加载配置
    let config_dir = std::env::var("APP_CONFIG_DIR").unwrap_or_else(|_| "config".to_string());
    let config = AppConfig::load(&config_dir)?;

    // 初始化 tracing
    if config.telemetry.json {
        init_tracing_json(&config.telemetry.log_level);
    } else {
        init_tracing(&config.telemetry.log_level);
    }

    let metrics = init_metrics()?;
    let store = counter_store(&config).await?;
    let state = AppState::from_config(&config, store, Arc::new(TracingLogSink), metrics)?;

    let app = build_router(state);

    // 启动服务器
    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;

    info!(
        %addr,
        app = %config.app_name,
        env = %config.app_env,
        throttle_enabled = config.throttle.enabled,
        "Starting gateway"
    );

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    info!("Gateway stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
