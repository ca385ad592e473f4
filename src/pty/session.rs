//! PTY 会话
//!
//! 一个连接对应的 PTY 与 shell 进程。状态单调变化：Idle -> Running -> Stopped。
//!
//! 描述符、子进程和输入写入器放在同一个 `Option<ActivePty>` 里，启动时
//! 一起设置，停止时一起取出，调用方看不到只拆了一半的会话。持有这把锁
//! 时不做任何可能阻塞的 I/O：输入由独立线程写入，信号经退出监控器发送。

use chrono::{DateTime, Utc};
use std::fs::File;
use std::io::{self, Write};
use std::sync::{Arc, Weak};
use tokio::sync::{oneshot, watch, Mutex};

use crate::config::SessionConfig;
use crate::shell::detect::get_shell_name;
use crate::transport::events::EventSender;
use crate::transport::types::{SessionInfo, TermSize};
use crate::utils::error::TerminalError;
use crate::utils::state::{SessionState, SessionStateCell, StateTransitionResult, StateWatcher};

use super::exit::ExitMonitor;
use super::input::{start_input_writer, InputWriterHandle};
use super::local::LocalPty;
use super::output::{start_output_pump, OutputPumpHandle};

/// 运行中会话持有的资源
struct ActivePty {
    pty: LocalPty,
    exit: ExitMonitor,
    input: InputWriterHandle,
}

/// 新分配的 PTY，以及输出泵和写入线程各自独占的描述符
struct SpawnedPty {
    pty: LocalPty,
    source: File,
    writer: Box<dyn Write + Send>,
}

/// PTY 会话
pub struct PtySession {
    /// 会话实例 ID
    session_id: String,
    /// 连接 ID，输出按它路由回远端
    connection_id: String,
    config: SessionConfig,
    events: EventSender,
    state: SessionStateCell,
    active: Mutex<Option<ActivePty>>,
    /// 输出泵是否已结束
    pump_finished: watch::Sender<bool>,
    started_at: DateTime<Utc>,
}

impl PtySession {
    /// 创建新会话（不启动 PTY）
    pub fn new(connection_id: impl Into<String>, config: SessionConfig, events: EventSender) -> Self {
        let connection_id = connection_id.into();
        let (pump_finished, _rx) = watch::channel(false);

        Self {
            session_id: uuid::Uuid::new_v4().to_string(),
            state: SessionStateCell::new(connection_id.clone()),
            connection_id,
            config,
            events,
            active: Mutex::new(None),
            pump_finished,
            started_at: Utc::now(),
        }
    }

    /// 启动会话
    ///
    /// 已在运行时为空操作；已停止的会话不能再启动。启动失败时会话直接
    /// 进入 Stopped。
    pub async fn start(self: &Arc<Self>) -> Result<(), TerminalError> {
        let mut active = self.active.lock().await;

        match self.state.current() {
            SessionState::Running => return Ok(()),
            SessionState::Stopped => {
                return Err(TerminalError::session_closed(&self.connection_id, "不能重新启动"));
            }
            SessionState::Idle => {}
        }

        // openpty 和 fork/exec 都是阻塞调用
        let config = self.config.clone();
        let spawned = tokio::task::spawn_blocking(move || Self::spawn_pty(&config))
            .await
            .map_err(|e| TerminalError::SpawnFailed(format!("启动任务异常: {}", e)))
            .and_then(|spawned| spawned);

        let SpawnedPty {
            mut pty,
            source,
            writer,
        } = match spawned {
            Ok(spawned) => spawned,
            Err(e) => {
                self.state.transition_to(SessionState::Stopped);
                tracing::error!("启动会话失败: {}: {}", self.connection_id, e);
                return Err(e);
            }
        };

        let exit = match pty.take_child() {
            Some(child) => ExitMonitor::spawn(self.connection_id.clone(), child),
            None => {
                self.state.transition_to(SessionState::Stopped);
                return Err(TerminalError::SpawnFailed("子进程句柄不可用".to_string()));
            }
        };

        let (input, input_failed) =
            match start_input_writer(self.connection_id.clone(), writer, self.state.watcher()) {
                Ok(started) => started,
                Err(e) => {
                    self.state.transition_to(SessionState::Stopped);
                    let _ = exit.signal(libc::SIGKILL);
                    tracing::error!("启动输入写入线程失败: {}: {}", self.connection_id, e);
                    return Err(e);
                }
            };

        if !self.state.transition_to(SessionState::Running).is_success() {
            let _ = exit.signal(libc::SIGKILL);
            return Err(TerminalError::session_closed(&self.connection_id, "启动时会话已停止"));
        }

        tracing::info!(
            "启动会话: {} ({}, pid {:?})",
            self.connection_id,
            get_shell_name(pty.shell()),
            pty.pid()
        );

        *active = Some(ActivePty { pty, exit, input });
        drop(active);

        let pump = start_output_pump(
            self.connection_id.clone(),
            source,
            self.state.watcher(),
            self.events.clone(),
            self.config.pump.clone(),
        );
        self.spawn_supervisor(pump);
        self.spawn_input_watcher(input_failed);

        Ok(())
    }

    fn spawn_pty(config: &SessionConfig) -> Result<SpawnedPty, TerminalError> {
        let mut pty = LocalPty::spawn(config)?;

        let prepared = pty.clone_output_source().and_then(|source| {
            pty.take_writer()
                .map(|writer| (source, writer))
                .ok_or_else(|| TerminalError::SpawnFailed("PTY writer 不可用".to_string()))
        });

        match prepared {
            Ok((source, writer)) => Ok(SpawnedPty {
                pty,
                source,
                writer,
            }),
            Err(e) => {
                if let Some(mut child) = pty.take_child() {
                    let _ = child.kill();
                    let _ = child.wait();
                }
                Err(e)
            }
        }
    }

    /// 输出泵结束后停止会话（无论输出泵因何结束）
    fn spawn_supervisor(self: &Arc<Self>, pump: OutputPumpHandle) {
        let session: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let exit = pump.join().await;
            let Some(session) = session.upgrade() else {
                return;
            };
            session.pump_finished.send_replace(true);
            if !exit.is_requested() {
                tracing::info!("输出泵结束，停止会话: {}", session.connection_id);
            }
            session.stop().await;
        });
    }

    /// 写入线程报告失败时停止会话
    fn spawn_input_watcher(self: &Arc<Self>, failed: oneshot::Receiver<io::Error>) {
        let session: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let Ok(e) = failed.await else {
                return;
            };
            let Some(session) = session.upgrade() else {
                return;
            };
            let err = TerminalError::from(e);
            if err.is_fatal() && session.state.is_running() {
                tracing::warn!("写入 PTY 失败，停止会话 {}: {}", session.connection_id, err);
                session.stop().await;
            }
        });
    }

    /// 写入输入
    ///
    /// 数据按调用顺序交给写入线程，调用本身不会阻塞。会话未运行时静默
    /// 丢弃；写入失败会停止会话，错误不返回给调用方。
    pub async fn write_input(&self, data: &[u8]) {
        if !self.state.is_running() {
            return;
        }

        let active = self.active.lock().await;
        let Some(active) = active.as_ref() else {
            return;
        };
        if !self.state.is_running() {
            return;
        }

        if active.input.send(data) {
            tracing::trace!("排队写入会话 {}: {} bytes", self.connection_id, data.len());
        } else {
            tracing::debug!("写入线程已退出，丢弃输入: {}", self.connection_id);
        }
    }

    /// 调整终端大小（失败只记录日志）
    pub async fn resize(&self, term_size: TermSize) {
        if !self.state.is_running() {
            return;
        }

        let active = self.active.lock().await;
        let Some(active) = active.as_ref() else {
            return;
        };

        match active.pty.resize(term_size) {
            Ok(()) => tracing::debug!(
                "调整会话 {} 大小: {}x{}",
                self.connection_id,
                term_size.cols,
                term_size.rows
            ),
            Err(e) => tracing::warn!("{} (会话 {})", e, self.connection_id),
        }
    }

    /// 停止会话
    ///
    /// 幂等。顺序：标记 Stopped，SIGTERM，等待宽限期，必要时 SIGKILL，
    /// 等待输出泵结束，关闭 master。每一步失败都不影响后续步骤，每次
    /// 等待都有上限。
    pub async fn stop(&self) {
        match self.state.transition_to(SessionState::Stopped) {
            StateTransitionResult::Success {
                from: SessionState::Running,
            } => {}
            _ => return,
        }

        let Some(ActivePty {
            pty,
            mut exit,
            input,
        }) = self.active.lock().await.take()
        else {
            return;
        };

        // 写入线程处理完手头的写入后退出；阻塞中的写入在 slave 关闭后返回
        drop(input);

        if !exit.has_exited() {
            if let Err(e) = exit.signal(libc::SIGTERM) {
                tracing::debug!("发送 SIGTERM 失败: {}: {}", self.connection_id, e);
            }
        }

        if !exit.wait_timeout(self.config.grace_period).await {
            tracing::debug!("宽限期结束，强制终止: {}", self.connection_id);
            if let Err(e) = exit.signal(libc::SIGKILL) {
                tracing::debug!("发送 SIGKILL 失败: {}: {}", self.connection_id, e);
            }
            if !exit.wait_timeout(self.config.join_timeout).await {
                tracing::warn!("子进程未能及时退出: {}", self.connection_id);
            }
        }

        let mut pump_finished = self.pump_finished.subscribe();
        let joined = tokio::time::timeout(
            self.config.join_timeout,
            pump_finished.wait_for(|finished| *finished),
        )
        .await;
        if joined.is_err() {
            tracing::warn!("等待输出泵结束超时: {}", self.connection_id);
        }

        drop(pty);

        let exit_code = exit.exit_code();
        let _ = self.events.send_exited(&self.connection_id, exit_code);
        tracing::info!("关闭会话: {} (exit code {:?})", self.connection_id, exit_code);
    }

    /// 当前终端大小（会话未运行时为 None）
    pub async fn size(&self) -> Option<TermSize> {
        let active = self.active.lock().await;
        active.as_ref().and_then(|active| active.pty.size().ok())
    }

    /// 子进程 PID
    pub async fn pid(&self) -> Option<u32> {
        let active = self.active.lock().await;
        active.as_ref().and_then(|active| active.pty.pid())
    }

    /// 会话信息快照
    pub async fn info(&self) -> SessionInfo {
        let active = self.active.lock().await;
        SessionInfo {
            connection_id: self.connection_id.clone(),
            session_id: self.session_id.clone(),
            state: self.state.current(),
            shell: active.as_ref().map(|active| active.pty.shell().to_string()),
            pid: active.as_ref().and_then(|active| active.pty.pid()),
            started_at: self.started_at,
        }
    }

    /// 当前状态
    pub fn state(&self) -> SessionState {
        self.state.current()
    }

    /// 订阅状态变化
    pub fn watch_state(&self) -> StateWatcher {
        self.state.watcher()
    }

    /// 获取会话 ID
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// 获取连接 ID
    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }
}

impl Drop for PtySession {
    fn drop(&mut self) {
        if let Some(active) = self.active.get_mut().take() {
            self.state.transition_to(SessionState::Stopped);
            if !active.exit.has_exited() {
                let _ = active.exit.signal(libc::SIGKILL);
            }
        }
    }
}
