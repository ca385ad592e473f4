//! 会话状态管理
//!
//! 提供会话状态转换逻辑。状态保存在 watch 通道中，控制路径、输出泵
//! 和注册表都读取同一份状态，注册表还可以等待会话进入 Stopped。
//!
//! 状态转换规则：
//! - Idle -> Running, Stopped
//! - Running -> Stopped
//! - Stopped -> (终态，不能转换)

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

/// 会话状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    /// 尚未启动
    Idle,
    /// 运行中
    Running,
    /// 已停止（终态）
    Stopped,
}

/// 状态转换结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateTransitionResult {
    /// 转换成功，携带转换前的状态
    Success { from: SessionState },
    /// 已处于目标状态
    Unchanged,
    /// 转换无效（当前状态不允许转换到目标状态）
    Invalid {
        from: SessionState,
        to: SessionState,
        reason: String,
    },
}

impl StateTransitionResult {
    /// 检查转换是否成功
    pub fn is_success(&self) -> bool {
        matches!(self, StateTransitionResult::Success { .. })
    }

    /// 检查转换是否失败
    pub fn is_invalid(&self) -> bool {
        matches!(self, StateTransitionResult::Invalid { .. })
    }
}

/// 会话状态单元
///
/// 单调状态机，状态的唯一来源。每次操作描述符之前都先检查这里。
#[derive(Debug)]
pub struct SessionStateCell {
    tx: watch::Sender<SessionState>,
    /// 连接 ID（用于日志）
    connection_id: String,
}

impl SessionStateCell {
    /// 创建处于 Idle 状态的状态单元
    pub fn new(connection_id: impl Into<String>) -> Self {
        let (tx, _rx) = watch::channel(SessionState::Idle);
        Self {
            tx,
            connection_id: connection_id.into(),
        }
    }

    /// 获取当前状态
    pub fn current(&self) -> SessionState {
        *self.tx.borrow()
    }

    /// 是否处于运行状态
    pub fn is_running(&self) -> bool {
        self.current() == SessionState::Running
    }

    /// 尝试转换到目标状态
    ///
    /// 检查与写入在同一临界区内完成，并发调用者中只有一个会看到
    /// `Success`。
    pub fn transition_to(&self, target: SessionState) -> StateTransitionResult {
        let mut result = StateTransitionResult::Unchanged;
        self.tx.send_if_modified(|current| {
            let from = *current;
            if from == target {
                result = StateTransitionResult::Unchanged;
                return false;
            }
            if Self::is_valid_transition(from, target) {
                *current = target;
                result = StateTransitionResult::Success { from };
                true
            } else {
                result = StateTransitionResult::Invalid {
                    from,
                    to: target,
                    reason: Self::get_invalid_transition_reason(from, target),
                };
                false
            }
        });

        match &result {
            StateTransitionResult::Success { from } => {
                tracing::debug!(
                    "连接 {} 状态转换: {:?} -> {:?}",
                    self.connection_id,
                    from,
                    target
                );
            }
            StateTransitionResult::Invalid { from, to, reason } => {
                tracing::warn!(
                    "连接 {} 无效状态转换: {:?} -> {:?}, 原因: {}",
                    self.connection_id,
                    from,
                    to,
                    reason
                );
            }
            StateTransitionResult::Unchanged => {}
        }

        result
    }

    /// 创建只读观察者（供输出泵和注册表使用）
    pub fn watcher(&self) -> StateWatcher {
        StateWatcher {
            rx: self.tx.subscribe(),
        }
    }

    /// 检查状态转换是否有效
    pub fn is_valid_transition(from: SessionState, to: SessionState) -> bool {
        match from {
            SessionState::Idle => matches!(to, SessionState::Running | SessionState::Stopped),
            SessionState::Running => to == SessionState::Stopped,
            SessionState::Stopped => false,
        }
    }

    /// 获取无效转换的原因
    fn get_invalid_transition_reason(from: SessionState, to: SessionState) -> String {
        match from {
            SessionState::Stopped => "会话已停止，不能再转换状态".to_string(),
            _ => format!("不允许从 {:?} 转换到 {:?}", from, to),
        }
    }
}

/// 会话状态观察者
#[derive(Debug, Clone)]
pub struct StateWatcher {
    rx: watch::Receiver<SessionState>,
}

impl StateWatcher {
    /// 当前状态
    pub fn current(&self) -> SessionState {
        *self.rx.borrow()
    }

    /// 会话是否仍在运行
    ///
    /// 状态单元被丢弃时视为已停止。
    pub fn is_running(&self) -> bool {
        self.rx.has_changed().is_ok() && self.current() == SessionState::Running
    }

    /// 等待会话进入 Stopped
    pub async fn wait_stopped(&mut self) {
        let _ = self.rx.wait_for(|state| *state == SessionState::Stopped).await;
    }
}
