//! Web Terminal 入口点
//!
//! 启动 HTTP/WebSocket 服务器，每个浏览器连接对应一个本地 shell 会话。
//! Ctrl-C 时先停止接受连接，再关闭所有会话。

use clap::Parser;
use std::sync::Arc;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use web_terminal::config::{Cli, ServerConfig};
use web_terminal::frontend::ensure_frontend;
use web_terminal::pty::SessionRegistry;
use web_terminal::transport::serve;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 初始化日志系统，输出到 stderr
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(log_filter())
        .init();

    let config = ServerConfig::from(Cli::parse());
    tracing::info!("Web Terminal 启动");

    ensure_frontend(&config.static_dir, config.build_frontend).await;

    let registry = Arc::new(SessionRegistry::new(config.session.clone()));

    serve(&config, registry.clone(), shutdown_signal()).await?;

    registry.shutdown().await;
    tracing::info!("Web Terminal 已退出");
    Ok(())
}

/// RUST_LOG 未设置或无法解析时默认 info
fn log_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("监听 Ctrl-C 失败: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("收到 Ctrl-C，正在关闭");
}
