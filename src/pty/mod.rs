//! PTY 模块
//!
//! 本地伪终端、输入写入线程、输出泵、会话以及按连接管理会话的注册表。

pub mod exit;
pub mod input;
pub mod local;
pub mod output;
pub mod registry;
pub mod session;

pub use local::LocalPty;
pub use output::{start_output_pump, OutputPumpConfig, OutputPumpHandle};
pub use registry::SessionRegistry;
pub use session::PtySession;
