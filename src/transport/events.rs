//! 会话事件发送器
//!
//! 输出泵和会话通过它把输出块和退出通知交给传输层。

use tokio::sync::mpsc;

use super::types::SessionEvent;

/// 事件发送器，可以克隆并在多个地方使用
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: mpsc::UnboundedSender<SessionEvent>,
}

impl EventSender {
    /// 创建发送器及对应的接收端
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// 发送事件
    pub fn send(&self, event: SessionEvent) -> Result<(), mpsc::error::SendError<SessionEvent>> {
        self.tx.send(event)
    }

    /// 发送终端输出
    pub fn send_output(
        &self,
        connection_id: &str,
        data: String,
    ) -> Result<(), mpsc::error::SendError<SessionEvent>> {
        self.send(SessionEvent::Output {
            connection_id: connection_id.to_string(),
            data,
        })
    }

    /// 发送会话退出通知
    pub fn send_exited(
        &self,
        connection_id: &str,
        exit_code: Option<u32>,
    ) -> Result<(), mpsc::error::SendError<SessionEvent>> {
        self.send(SessionEvent::Exited {
            connection_id: connection_id.to_string(),
            exit_code,
        })
    }

    /// 接收端是否已关闭
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}
