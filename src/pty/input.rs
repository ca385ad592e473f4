//! PTY 输入写入器
//!
//! 子进程不读输入时，写入 PTY master 会一直阻塞。写入因此放在会话
//! 独占的线程里按顺序执行，调用方只负责排队；阻塞的写入既不占用
//! 异步运行时的工作线程，也不会挡住会话停止。

use std::io::{self, Write};
use tokio::sync::{mpsc, oneshot};

use crate::utils::error::TerminalError;
use crate::utils::state::StateWatcher;

/// 输入写入器句柄，丢弃后写入线程在处理完已排队的数据后退出
#[derive(Debug)]
pub struct InputWriterHandle {
    tx: mpsc::UnboundedSender<Vec<u8>>,
}

impl InputWriterHandle {
    /// 排队写入，写入线程已退出时返回 false
    pub fn send(&self, data: &[u8]) -> bool {
        self.tx.send(data.to_vec()).is_ok()
    }
}

/// 启动写入线程
///
/// 返回的接收端在写入失败时收到错误；线程正常结束时发送端被丢弃。
/// 会话离开 Running 后，排队中的数据不再写入。
pub fn start_input_writer<W>(
    connection_id: String,
    writer: W,
    state: StateWatcher,
) -> Result<(InputWriterHandle, oneshot::Receiver<io::Error>), TerminalError>
where
    W: Write + Send + 'static,
{
    let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let (failed_tx, failed_rx) = oneshot::channel();

    std::thread::Builder::new()
        .name(format!("pty-writer-{}", connection_id))
        .spawn(move || {
            let mut writer = writer;
            while let Some(data) = rx.blocking_recv() {
                if !state.is_running() {
                    break;
                }
                if let Err(e) = writer.write_all(&data).and_then(|()| writer.flush()) {
                    tracing::debug!("写入 PTY 失败: {}: {}", connection_id, e);
                    let _ = failed_tx.send(e);
                    return;
                }
                tracing::trace!("写入 PTY: {} ({} bytes)", connection_id, data.len());
            }
            tracing::debug!("输入写入线程退出: {}", connection_id);
        })?;

    Ok((InputWriterHandle { tx }, failed_rx))
}
