//! PTY 输出泵
//!
//! 在后台阻塞任务中轮询 PTY master，读取输出并按顺序交给事件发送器。
//! 轮询带超时，会话停止后最多一个轮询间隔内就会退出。

use std::io::{self, Read};
use std::os::fd::{AsRawFd, RawFd};
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::transport::events::EventSender;
use crate::utils::state::StateWatcher;

/// 输出泵配置
#[derive(Debug, Clone)]
pub struct OutputPumpConfig {
    /// 每次读取的最大字节数
    pub chunk_size: usize,
    /// 轮询间隔
    pub poll_interval: Duration,
}

impl Default for OutputPumpConfig {
    fn default() -> Self {
        Self {
            chunk_size: 20 * 1024,
            poll_interval: Duration::from_millis(100),
        }
    }
}

/// 输出泵退出原因
#[derive(Debug)]
pub enum PumpExit {
    /// 会话已停止
    Stopped,
    /// 读到 EOF
    Eof,
    /// 读取或轮询失败
    ReadFailed(io::Error),
    /// 事件接收端已关闭
    SinkClosed,
}

impl PumpExit {
    /// 是否由会话自身停止引起
    pub fn is_requested(&self) -> bool {
        matches!(self, PumpExit::Stopped)
    }
}

/// 输出泵句柄
pub struct OutputPumpHandle {
    task_handle: JoinHandle<PumpExit>,
}

impl OutputPumpHandle {
    /// 等待输出泵结束
    pub async fn join(self) -> PumpExit {
        match self.task_handle.await {
            Ok(exit) => exit,
            Err(e) => PumpExit::ReadFailed(io::Error::other(format!("输出泵任务异常: {}", e))),
        }
    }

    #[cfg(test)]
    fn is_finished(&self) -> bool {
        self.task_handle.is_finished()
    }
}

/// 启动输出泵
///
/// `source` 为输出泵独占的描述符。状态离开 Running、读到 EOF、
/// 读取出错或事件接收端关闭时退出。
pub fn start_output_pump<S>(
    connection_id: String,
    source: S,
    state: StateWatcher,
    events: EventSender,
    config: OutputPumpConfig,
) -> OutputPumpHandle
where
    S: Read + AsRawFd + Send + 'static,
{
    let task_handle = tokio::task::spawn_blocking(move || {
        let mut source = source;
        let mut buffer = vec![0u8; config.chunk_size];
        let mut decoder = Utf8Decoder::default();

        let exit = loop {
            if !state.is_running() {
                break PumpExit::Stopped;
            }
            if events.is_closed() {
                break PumpExit::SinkClosed;
            }

            match wait_readable(source.as_raw_fd(), config.poll_interval) {
                Ok(false) => continue,
                Ok(true) => {}
                Err(e) => break PumpExit::ReadFailed(e),
            }

            if !state.is_running() {
                break PumpExit::Stopped;
            }

            match source.read(&mut buffer) {
                Ok(0) => break PumpExit::Eof,
                Ok(n) => {
                    let text = decoder.decode(&buffer[..n]);
                    if text.is_empty() {
                        continue;
                    }
                    tracing::trace!("读取 PTY 输出: {} bytes", n);
                    if events.send_output(&connection_id, text).is_err() {
                        break PumpExit::SinkClosed;
                    }
                }
                Err(ref e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock
                    ) =>
                {
                    continue;
                }
                Err(e) => break PumpExit::ReadFailed(e),
            }
        };

        if let Some(rest) = decoder.finish() {
            let _ = events.send_output(&connection_id, rest);
        }

        match &exit {
            PumpExit::Stopped => tracing::debug!("输出泵收到停止信号: {}", connection_id),
            PumpExit::Eof => tracing::info!("PTY 输出 EOF，进程已退出: {}", connection_id),
            PumpExit::ReadFailed(e) if is_slave_closed(e) => {
                tracing::info!("PTY slave 端已关闭: {}", connection_id)
            }
            PumpExit::ReadFailed(e) => {
                tracing::error!("读取 PTY 输出错误: {}: {}", connection_id, e)
            }
            PumpExit::SinkClosed => tracing::debug!("输出接收端已关闭: {}", connection_id),
        }

        exit
    });

    OutputPumpHandle { task_handle }
}

/// 等待描述符可读，超时返回 `Ok(false)`
///
/// 挂起和错误事件也按可读处理，由随后的 read 给出具体结果。
fn wait_readable(fd: RawFd, timeout: Duration) -> io::Result<bool> {
    let mut pollfd = libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    };
    let timeout_ms = timeout.as_millis().min(libc::c_int::MAX as u128) as libc::c_int;

    // SAFETY: pollfd 在调用期间有效，数量为 1
    let rc = unsafe { libc::poll(&mut pollfd, 1, timeout_ms) };
    if rc < 0 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::Interrupted {
            return Ok(false);
        }
        return Err(err);
    }
    if rc == 0 {
        return Ok(false);
    }
    if pollfd.revents & libc::POLLNVAL != 0 {
        return Err(io::Error::from_raw_os_error(libc::EBADF));
    }
    Ok(true)
}

/// EIO 表示 slave 端已全部关闭（Linux 上子进程退出后的读取结果）
fn is_slave_closed(err: &io::Error) -> bool {
    err.raw_os_error() == Some(libc::EIO)
}

/// 增量 UTF-8 解码器
///
/// 无效字节替换为 U+FFFD；块末尾不完整的多字节序列留到下一块再解码。
#[derive(Debug, Default)]
struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    fn decode(&mut self, chunk: &[u8]) -> String {
        self.pending.extend_from_slice(chunk);
        let complete = incomplete_tail_start(&self.pending);
        let tail = self.pending.split_off(complete);
        let text = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending = tail;
        text
    }

    fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let text = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        Some(text)
    }
}

/// 返回末尾不完整 UTF-8 序列的起始位置，没有则返回长度
fn incomplete_tail_start(buf: &[u8]) -> usize {
    let len = buf.len();
    for back in 1..=len.min(3) {
        let idx = len - back;
        let byte = buf[idx];
        if byte & 0xC0 == 0x80 {
            continue;
        }
        let needed = match byte {
            0xC2..=0xDF => 2,
            0xE0..=0xEF => 3,
            0xF0..=0xF4 => 4,
            _ => 1,
        };
        return if needed > back { idx } else { len };
    }
    len
}
