//! Web Terminal 库
//!
//! 通过 WebSocket 把浏览器连接到本地 PTY 中运行的 shell。

pub mod config;
pub mod frontend;
pub mod pty;
pub mod shell;
pub mod transport;
pub mod utils;
