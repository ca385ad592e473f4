//! HTTP 服务器
//!
//! WebSocket 终端端点、健康检查、会话列表以及前端静态文件。

use axum::{
    extract::State,
    response::{Html, IntoResponse, Response},
    routing::get,
    Json, Router,
};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::{
    cors::{Any, CorsLayer},
    services::{ServeDir, ServeFile},
    trace::TraceLayer,
};

use crate::config::ServerConfig;
use crate::frontend::FRONTEND_NOT_BUILT_PAGE;
use crate::pty::registry::SessionRegistry;
use crate::transport::socket::websocket_handler;
use crate::transport::types::SessionInfo;

/// 各路由共享的状态
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<SessionRegistry>,
    pub static_dir: PathBuf,
}

/// 创建路由
pub fn create_router(state: AppState) -> Router {
    let index_file = state.static_dir.join("index.html");
    // 未知路径回退到 index.html，由前端路由处理
    let static_files = ServeDir::new(&state.static_dir).fallback(ServeFile::new(index_file));

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/", get(serve_index))
        .route("/health", get(health))
        .route("/sessions", get(list_sessions))
        .route("/ws", get(websocket_handler))
        .fallback_service(static_files)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// GET /health
async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "healthy" }))
}

/// GET /sessions
async fn list_sessions(State(state): State<AppState>) -> Json<Vec<SessionInfo>> {
    Json(state.registry.list_sessions().await)
}

/// GET / - 前端未构建时返回说明页面
async fn serve_index(State(state): State<AppState>) -> Response {
    let index_file = state.static_dir.join("index.html");
    match tokio::fs::read_to_string(&index_file).await {
        Ok(html) => Html(html).into_response(),
        Err(e) => {
            tracing::debug!("读取 {} 失败: {}", index_file.display(), e);
            Html(FRONTEND_NOT_BUILT_PAGE).into_response()
        }
    }
}

/// 运行服务器，直到 `shutdown` 完成
pub async fn serve(
    config: &ServerConfig,
    registry: Arc<SessionRegistry>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let state = AppState {
        registry,
        static_dir: config.static_dir.clone(),
    };
    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
    tracing::info!("Web Terminal 监听 http://{}", listener.local_addr()?);
    tracing::info!("WebSocket 端点: ws://{}/ws", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;

    Ok(())
}
