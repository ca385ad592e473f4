//! 本地 PTY 实现
//!
//! 使用 portable-pty 创建和管理本地伪终端。

use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use std::fs::File;
use std::io::Write;
use std::os::fd::{BorrowedFd, OwnedFd};

use crate::config::SessionConfig;
use crate::shell::detect::detect_default_shell;
use crate::transport::types::TermSize;
use crate::utils::error::TerminalError;

/// 本地 PTY 实例
pub struct LocalPty {
    /// PTY master
    master: Box<dyn MasterPty + Send>,
    /// PTY writer（启动后交给输入写入线程）
    writer: Option<Box<dyn Write + Send>>,
    /// 子进程（启动后交给退出监控器）
    child: Option<Box<dyn Child + Send + Sync>>,
    /// 子进程 PID
    pid: Option<u32>,
    /// 实际启动的 shell
    shell: String,
}

impl LocalPty {
    /// 分配 PTY 并在 slave 端启动 shell
    pub fn spawn(config: &SessionConfig) -> Result<Self, TerminalError> {
        let pty_system = native_pty_system();

        let pair = pty_system
            .openpty(to_pty_size(config.term_size))
            .map_err(|e| TerminalError::SpawnFailed(format!("无法分配 PTY: {}", e)))?;

        // 构建命令：继承环境变量，只覆盖 TERM
        let shell = config
            .shell_path
            .clone()
            .unwrap_or_else(detect_default_shell);
        let mut cmd = CommandBuilder::new(&shell);

        if let Some(dir) = &config.cwd {
            cmd.cwd(dir);
        }

        cmd.env("TERM", &config.term);

        for (key, value) in &config.env {
            cmd.env(key, value);
        }

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| TerminalError::spawn_failed(&shell, e))?;

        // slave 端只属于子进程；父进程持有它会让 master 读不到 EIO
        drop(pair.slave);

        let writer = match pair.master.take_writer() {
            Ok(writer) => writer,
            Err(e) => {
                kill_orphan(child);
                return Err(TerminalError::SpawnFailed(format!("无法获取 PTY writer: {}", e)));
            }
        };

        let pid = child.process_id();

        Ok(Self {
            master: pair.master,
            writer: Some(writer),
            child: Some(child),
            pid,
            shell,
        })
    }

    /// 复制一个 master 描述符供输出泵独占读取
    ///
    /// 输出泵持有自己的描述符，会话关闭 master 不会影响它正在轮询的
    /// 描述符号。
    pub fn clone_output_source(&self) -> Result<File, TerminalError> {
        let raw = self.master.as_raw_fd().ok_or_else(|| {
            TerminalError::IoFailure(std::io::Error::other("PTY master 没有可用的描述符"))
        })?;
        // SAFETY: raw 属于 self.master，在本函数返回前一直有效
        let borrowed = unsafe { BorrowedFd::borrow_raw(raw) };
        let owned: OwnedFd = borrowed.try_clone_to_owned()?;
        Ok(File::from(owned))
    }

    /// 取出 writer（只能取一次）
    pub fn take_writer(&mut self) -> Option<Box<dyn Write + Send>> {
        self.writer.take()
    }

    /// 调整 PTY 大小
    pub fn resize(&self, term_size: TermSize) -> Result<(), TerminalError> {
        self.master
            .resize(to_pty_size(term_size))
            .map_err(|e| TerminalError::ResizeFailed(e.to_string()))
    }

    /// 当前 PTY 大小
    pub fn size(&self) -> Result<TermSize, TerminalError> {
        let size = self
            .master
            .get_size()
            .map_err(|e| TerminalError::IoFailure(std::io::Error::other(e.to_string())))?;
        Ok(TermSize {
            rows: size.rows,
            cols: size.cols,
        })
    }

    /// 取出子进程句柄（只能取一次）
    pub fn take_child(&mut self) -> Option<Box<dyn Child + Send + Sync>> {
        self.child.take()
    }

    /// 子进程 PID
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// 实际启动的 shell 路径
    pub fn shell(&self) -> &str {
        &self.shell
    }
}

fn to_pty_size(term_size: TermSize) -> PtySize {
    PtySize {
        rows: term_size.rows,
        cols: term_size.cols,
        pixel_width: 0,
        pixel_height: 0,
    }
}

/// 启动中途失败时清理已经创建的子进程
fn kill_orphan(mut child: Box<dyn Child + Send + Sync>) {
    if let Err(e) = child.kill() {
        tracing::warn!("清理子进程失败: {}", e);
    }
    let _ = child.wait();
}
