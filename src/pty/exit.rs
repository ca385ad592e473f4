//! 进程退出监控器
//!
//! 在阻塞任务中等待 PTY 子进程退出，并通过 watch 通道发布退出状态。
//! 停止会话时用它代替忙等待：发送 SIGTERM 后只需等待这里的通知。
//!
//! 信号也经由这里发送。监控任务先用 `waitid(WNOWAIT)` 等到子进程变成
//! 僵尸进程，再在锁内回收；发送信号时持同一把锁并确认尚未回收，
//! 所以信号不会落到被系统复用的 PID 上。

use portable_pty::Child;
use std::io;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;

use crate::utils::error::TerminalError;

/// 子进程状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildStatus {
    /// 仍在运行
    Running,
    /// 已退出（无法获取退出码时为 None）
    Exited { code: Option<u32> },
}

/// 进程退出监控器
pub struct ExitMonitor {
    pid: Option<u32>,
    /// 子进程是否已被回收
    reaped: Arc<Mutex<bool>>,
    status: watch::Receiver<ChildStatus>,
}

impl ExitMonitor {
    /// 启动监控器，接管子进程句柄
    pub fn spawn(connection_id: String, mut child: Box<dyn Child + Send + Sync>) -> Self {
        let (tx, rx) = watch::channel(ChildStatus::Running);
        let pid = child.process_id();
        let reaped = Arc::new(Mutex::new(false));
        let reaped_flag = reaped.clone();

        tokio::task::spawn_blocking(move || {
            let result = match pid.map(wait_exited_no_reap) {
                Some(Ok(())) => {
                    // 已是僵尸进程，wait 立即返回
                    let mut reaped = reaped_flag.lock().unwrap_or_else(PoisonError::into_inner);
                    let result = child.wait();
                    *reaped = true;
                    result
                }
                other => {
                    if let Some(Err(e)) = other {
                        tracing::debug!("waitid 失败，直接等待子进程: {}: {}", connection_id, e);
                    }
                    let result = child.wait();
                    *reaped_flag.lock().unwrap_or_else(PoisonError::into_inner) = true;
                    result
                }
            };

            let code = match result {
                Ok(status) => {
                    tracing::debug!("子进程退出: {} (code {})", connection_id, status.exit_code());
                    Some(status.exit_code())
                }
                Err(e) => {
                    tracing::warn!("等待子进程失败: {}: {}", connection_id, e);
                    None
                }
            };
            tx.send_replace(ChildStatus::Exited { code });
        });

        Self {
            pid,
            reaped,
            status: rx,
        }
    }

    /// 向子进程发送信号；子进程已被回收时什么也不做
    pub fn signal(&self, signal: libc::c_int) -> Result<(), TerminalError> {
        let pid = match self.pid {
            Some(pid) if pid != 0 && pid <= i32::MAX as u32 => pid as libc::pid_t,
            other => {
                return Err(TerminalError::IoFailure(io::Error::other(format!(
                    "无效的 PID: {:?}",
                    other
                ))))
            }
        };

        let reaped = self.reaped.lock().unwrap_or_else(PoisonError::into_inner);
        if *reaped {
            return Ok(());
        }

        // SAFETY: kill(2) 不涉及内存安全；持锁期间 pid 仍属于我们的子进程
        let rc = unsafe { libc::kill(pid, signal) };
        if rc != 0 {
            return Err(TerminalError::IoFailure(io::Error::last_os_error()));
        }
        Ok(())
    }

    /// 子进程是否已退出
    pub fn has_exited(&self) -> bool {
        matches!(*self.status.borrow(), ChildStatus::Exited { .. })
    }

    /// 退出码（尚未退出或未知时为 None）
    pub fn exit_code(&self) -> Option<u32> {
        match *self.status.borrow() {
            ChildStatus::Exited { code } => code,
            ChildStatus::Running => None,
        }
    }

    /// 最多等待 `timeout`，返回子进程是否已退出
    pub async fn wait_timeout(&mut self, timeout: Duration) -> bool {
        let exited = self
            .status
            .wait_for(|status| matches!(status, ChildStatus::Exited { .. }));
        match tokio::time::timeout(timeout, exited).await {
            Ok(Ok(_)) => true,
            // 发送端提前消失说明监控任务已经结束
            Ok(Err(_)) => true,
            Err(_) => false,
        }
    }
}

/// 等待子进程退出但不回收
fn wait_exited_no_reap(pid: u32) -> io::Result<()> {
    loop {
        // SAFETY: siginfo_t 是纯数据结构，全零是合法值
        let mut info: libc::siginfo_t = unsafe { std::mem::zeroed() };
        // SAFETY: info 在调用期间有效
        let rc = unsafe {
            libc::waitid(
                libc::P_PID,
                pid as libc::id_t,
                &mut info,
                libc::WEXITED | libc::WNOWAIT,
            )
        };
        if rc == 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}
