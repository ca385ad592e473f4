//! 前端构建检查
//!
//! 启动时确认前端构建产物是否存在，缺失时给出构建说明，
//! 可选地尝试执行一次 `npm run build`。

use std::path::Path;
use tokio::process::Command;

/// 前端未构建时 `/` 返回的页面
pub const FRONTEND_NOT_BUILT_PAGE: &str = "<html><body style='font-family: sans-serif; padding: 20px; line-height: 1.6;'>\
<h1 style='color: #e53e3e;'>Error: Frontend not built</h1>\
<p>The web terminal frontend has not been built. To use this terminal, you need to:</p>\
<ol>\
<li>Make sure Node.js and npm are installed</li>\
<li>Run <code>npm install</code> to install dependencies</li>\
<li>Run <code>npm run build</code> to build the frontend</li>\
</ol>\
<p>After building the frontend, restart this server.</p>\
</body></html>";

/// 检查结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrontendStatus {
    /// 构建产物存在
    Ready,
    /// 刚刚构建成功
    Built,
    /// 缺失（服务器照常启动）
    Missing,
}

/// 检查前端构建产物，`build` 为 true 时尝试构建
pub async fn ensure_frontend(static_dir: &Path, build: bool) -> FrontendStatus {
    if static_dir.exists() {
        return FrontendStatus::Ready;
    }

    tracing::error!("前端构建目录不存在: {}", static_dir.display());

    if build {
        if !npm_available().await {
            tracing::error!("未找到 Node.js/npm，请安装后执行 `npm install` 和 `npm run build`");
            return FrontendStatus::Missing;
        }

        tracing::warn!("尝试构建前端...");
        match Command::new("npm").args(["run", "build"]).status().await {
            Ok(status) if status.success() && static_dir.exists() => {
                tracing::info!("前端构建成功");
                return FrontendStatus::Built;
            }
            Ok(status) => {
                tracing::error!("前端构建失败 ({})，请手动执行 `npm run build`", status);
            }
            Err(e) => {
                tracing::error!("执行 npm 失败: {}，请手动执行 `npm run build`", e);
            }
        }
    } else {
        tracing::warn!("构建前端：先执行 `npm install`，再执行 `npm run build`");
        tracing::warn!("或使用 --build-frontend 在启动时自动构建");
    }

    tracing::warn!("在前端构建完成之前，终端界面不可用");
    FrontendStatus::Missing
}

async fn npm_available() -> bool {
    Command::new("npm")
        .arg("--version")
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .await
        .map(|status| status.success())
        .unwrap_or(false)
}
