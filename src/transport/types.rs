//! 传输层数据类型定义
//!
//! 定义 WebSocket 帧、会话事件和会话信息的数据结构。
//! 帧格式沿用前端约定的事件信封：`{"event": <名称>, "data": <负载>}`。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::utils::state::SessionState;

/// 终端尺寸
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct TermSize {
    pub rows: u16,
    pub cols: u16,
}

impl Default for TermSize {
    fn default() -> Self {
        Self { rows: 24, cols: 80 }
    }
}

/// 会话信息
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInfo {
    pub connection_id: String,
    pub session_id: String,
    pub state: SessionState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shell: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    pub started_at: DateTime<Utc>,
}

// ============ 客户端 -> 服务器 ============

/// 客户端消息
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ClientMessage {
    /// 终端输入
    TerminalInput(String),
    /// 调整终端尺寸
    Resize(TermSize),
    /// 心跳
    Ping,
}

// ============ 服务器 -> 客户端 ============

/// 服务器消息
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ServerMessage {
    /// 终端输出（每个读取块一条，按顺序发送）
    TerminalOutput(String),
    /// 心跳响应
    Pong,
    /// 会话已结束
    SessionEnded {
        #[serde(skip_serializing_if = "Option::is_none")]
        exit_code: Option<u32>,
    },
    /// 错误
    Error(ErrorPayload),
}

/// 错误负载
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorPayload {
    pub code: i32,
    pub error_type: String,
    pub message: String,
}

// ============ 会话事件 ============

/// 会话发往传输层的事件
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// 一个输出块
    Output { connection_id: String, data: String },
    /// 会话已停止
    Exited {
        connection_id: String,
        exit_code: Option<u32>,
    },
}

impl SessionEvent {
    /// 事件所属的连接 ID
    pub fn connection_id(&self) -> &str {
        match self {
            SessionEvent::Output { connection_id, .. } => connection_id,
            SessionEvent::Exited { connection_id, .. } => connection_id,
        }
    }
}

impl From<SessionEvent> for ServerMessage {
    fn from(event: SessionEvent) -> Self {
        match event {
            SessionEvent::Output { data, .. } => ServerMessage::TerminalOutput(data),
            SessionEvent::Exited { exit_code, .. } => ServerMessage::SessionEnded { exit_code },
        }
    }
}


/// Property-based tests for message envelopes
#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        /// 任意合法尺寸的 resize 帧都能被解析
        #[test]
        fn prop_resize_frame_parses(rows in 1u16..=u16::MAX, cols in 1u16..=u16::MAX) {
            let frame = format!(r#"{{"event":"resize","data":{{"rows":{},"cols":{}}}}}"#, rows, cols);
            let msg: ClientMessage = serde_json::from_str(&frame).unwrap();
            prop_assert_eq!(msg, ClientMessage::Resize(TermSize { rows, cols }));
        }

        /// 任意输入文本都能原样解析出来
        #[test]
        fn prop_terminal_input_preserves_text(text in "\\PC{0,64}") {
            let frame = serde_json::json!({"event": "terminal-input", "data": text.clone()});
            let msg: ClientMessage = serde_json::from_value(frame).unwrap();
            prop_assert_eq!(msg, ClientMessage::TerminalInput(text));
        }
    }
}
