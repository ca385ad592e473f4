//! Shell 检测
//!
//! 检测系统默认 shell。

use std::env;
use std::path::Path;

/// 没有 SHELL 环境变量时依次尝试的 shell
const FALLBACK_SHELLS: &[&str] = &["/bin/bash", "/bin/sh"];

/// 检测系统默认 shell
///
/// 优先使用 SHELL 环境变量，否则使用第一个存在的后备 shell。
pub fn detect_default_shell() -> String {
    if let Ok(shell) = env::var("SHELL") {
        if !shell.is_empty() {
            return shell;
        }
    }

    FALLBACK_SHELLS
        .iter()
        .find(|candidate| Path::new(candidate).exists())
        .unwrap_or(&"/bin/sh")
        .to_string()
}

/// 获取 shell 名称
pub fn get_shell_name(shell_path: &str) -> &str {
    Path::new(shell_path)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("shell")
}
