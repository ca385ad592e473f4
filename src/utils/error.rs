//! 错误类型定义
//!
//! 定义终端服务的错误类型，提供描述性错误消息。
//!
//! ## 功能
//! - 定义 TerminalError 枚举，涵盖会话生命周期内可能出现的错误
//! - 实现错误转换（From trait）
//! - 提供错误分类和辅助方法
//! - 支持转换为 WebSocket 错误帧

use thiserror::Error;

use crate::transport::types::ErrorPayload;

/// 终端错误类型
#[derive(Debug, Error)]
pub enum TerminalError {
    /// PTY 分配或 shell 进程启动失败，会话从未进入运行状态
    #[error("PTY 创建失败: {0}")]
    SpawnFailed(String),

    /// 会话运行中读写 PTY 失败，对该会话是致命的
    #[error("PTY IO 错误: {0}")]
    IoFailure(#[from] std::io::Error),

    /// 调整终端尺寸失败（非致命）
    #[error("调整终端尺寸失败: {0}")]
    ResizeFailed(String),

    /// 会话已关闭
    #[error("会话已关闭: {0}")]
    SessionClosed(String),

    /// 无效的客户端消息
    #[error("无效的消息: {0}")]
    InvalidMessage(String),

    /// 序列化错误
    #[error("序列化错误: {0}")]
    SerializationError(#[from] serde_json::Error),
}

impl From<TerminalError> for ErrorPayload {
    fn from(err: TerminalError) -> Self {
        ErrorPayload {
            code: err.code(),
            error_type: err.error_type().to_string(),
            message: err.to_string(),
        }
    }
}

impl TerminalError {
    /// 获取错误码
    pub fn code(&self) -> i32 {
        match self {
            TerminalError::SpawnFailed(_) => 1001,
            TerminalError::IoFailure(_) => 1002,
            TerminalError::ResizeFailed(_) => 1003,
            TerminalError::SessionClosed(_) => 1004,
            TerminalError::InvalidMessage(_) => 1005,
            TerminalError::SerializationError(_) => 1006,
        }
    }

    /// 获取错误类型名称
    pub fn error_type(&self) -> &'static str {
        match self {
            TerminalError::SpawnFailed(_) => "spawn_failed",
            TerminalError::IoFailure(_) => "io_failure",
            TerminalError::ResizeFailed(_) => "resize_failed",
            TerminalError::SessionClosed(_) => "session_closed",
            TerminalError::InvalidMessage(_) => "invalid_message",
            TerminalError::SerializationError(_) => "serialization_error",
        }
    }

    /// 检查错误是否会终止所属会话
    ///
    /// 读写失败一律视为会话结束，不做重试；尺寸调整只是建议性的。
    pub fn is_fatal(&self) -> bool {
        matches!(self, TerminalError::IoFailure(_))
    }

    /// 创建 shell 启动失败错误（包含 shell 路径）
    pub fn spawn_failed(shell: &str, reason: impl std::fmt::Display) -> Self {
        TerminalError::SpawnFailed(format!("无法启动 {}: {}", shell, reason))
    }

    /// 创建会话关闭错误
    pub fn session_closed(connection_id: &str, reason: &str) -> Self {
        TerminalError::SessionClosed(format!("连接 {} 的会话已关闭: {}", connection_id, reason))
    }
}
