/// Easy VM - 守护进程
///
/// 单机 bhyve 控制面：请求队列、虚拟机控制器、虚拟交换机和启动对账，
/// 对外提供 HTTP/JSON 接口

mod api;
mod app_state;
mod config;
mod db;
mod processor;
mod reconciler;
mod services;

use axum::{routing::get, Router};
use host::{BhyveLaunch, CommandRunner, SystemRunner};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{error, info};

use crate::{
    app_state::AppState, db::establish_connection, processor::RequestProcessor,
    reconciler::Reconciler, services::{SwitchService, VmService},
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 加载环境变量
    dotenvy::dotenv().ok();
    let cfg = config::Config::from_env()?;

    // 初始化日志
    tracing_subscriber::fmt()
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cfg.log_level)),
        )
        .init();

    info!("🚀 启动 Easy VM 守护进程...");

    let sea_db = establish_connection(&cfg.database_url).await?;
    info!("✅ 数据库连接成功");

    let runner: Arc<dyn CommandRunner> = Arc::new(SystemRunner::new(cfg.sudo.clone(), cfg.command_timeout()));
    let launcher = Arc::new(BhyveLaunch::new(
        cfg.bhyve_path.clone(),
        cfg.bhyvectl_path.clone(),
        runner.clone(),
    ));
    let listen_addr: SocketAddr = cfg.listen_addr.parse()?;

    let (app_state, events) = AppState::new(sea_db, cfg, runner, launcher);
    let event_loop = services::vm_service::spawn_event_loop(app_state.clone(), events);

    // 对账完成前不接受任何请求
    Reconciler::new(app_state.clone()).run().await;
    match SwitchService::new(app_state.clone()).bring_up_all().await {
        Ok(n) => info!("✅ 已恢复 {} 个交换机", n),
        Err(e) => error!("恢复交换机失败: {}", e),
    }

    let shutdown = CancellationToken::new();
    let processor = tokio::spawn(RequestProcessor::new(app_state.clone()).run(shutdown.clone()));

    // 设置CORS
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/", get(root_handler))
        .route("/health", get(health_handler))
        .nest("/api", api::api_routes())
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(app_state.clone());

    info!("🎯 服务器监听在 http://{}", listen_addr);
    let listener = tokio::net::TcpListener::bind(listen_addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await?;

    shutdown.cancel();
    if let Err(e) = processor.await {
        error!("请求处理器异常退出: {}", e);
    }

    VmService::new(app_state).shutdown_all().await;
    event_loop.abort();
    info!("👋 守护进程已退出");

    Ok(())
}

async fn shutdown_signal(shutdown: CancellationToken) {
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                error!("监听退出信号失败: {}", e);
            }
            info!("收到退出信号");
        }
        _ = shutdown.cancelled() => {}
    }
}

async fn root_handler() -> &'static str {
    "Easy VM daemon API v1"
}

async fn health_handler() -> &'static str {
    "OK"
}
