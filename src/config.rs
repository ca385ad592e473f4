//! 配置
//!
//! 命令行参数（除可重复的 `--env` 外均可通过 `WEB_TERMINAL_*` 环境变量
//! 设置）以及由此得到的服务器配置和会话配置。

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::pty::output::OutputPumpConfig;
use crate::transport::types::TermSize;

/// 默认 TERM 值
pub const DEFAULT_TERM: &str = "xterm-256color";

/// 命令行参数
#[derive(Debug, Clone, Parser)]
#[command(name = "web-terminal", version, about = "通过 WebSocket 把浏览器连接到本地 shell")]
pub struct Cli {
    /// 监听地址
    #[arg(long, env = "WEB_TERMINAL_HOST", default_value = "0.0.0.0")]
    pub host: IpAddr,

    /// 监听端口
    #[arg(short, long, env = "WEB_TERMINAL_PORT", default_value_t = 8080)]
    pub port: u16,

    /// 前端构建产物目录
    #[arg(long, env = "WEB_TERMINAL_STATIC_DIR", default_value = "./dist")]
    pub static_dir: PathBuf,

    /// 前端未构建时尝试执行 `npm run build`
    #[arg(long, env = "WEB_TERMINAL_BUILD_FRONTEND")]
    pub build_frontend: bool,

    /// shell 路径（默认使用系统 shell）
    #[arg(long, env = "WEB_TERMINAL_SHELL")]
    pub shell: Option<String>,

    /// shell 的工作目录
    #[arg(long, env = "WEB_TERMINAL_CWD")]
    pub cwd: Option<String>,

    /// 传给 shell 的 TERM 值
    #[arg(long, env = "WEB_TERMINAL_TERM", default_value = DEFAULT_TERM)]
    pub term: String,

    /// 额外的环境变量，格式 KEY=VALUE，可重复（只能在命令行给出）
    #[arg(long = "env", value_name = "KEY=VALUE", value_parser = parse_env_pair)]
    pub env: Vec<(String, String)>,

    /// SIGTERM 之后等待进程退出的时间（毫秒）
    #[arg(long, env = "WEB_TERMINAL_GRACE_MS", default_value_t = 200)]
    pub grace_period_ms: u64,

    /// 停止会话时等待输出泵和子进程的上限（毫秒）
    #[arg(long, env = "WEB_TERMINAL_JOIN_TIMEOUT_MS", default_value_t = 1000)]
    pub join_timeout_ms: u64,

    /// 输出泵的轮询间隔（毫秒）
    #[arg(long, env = "WEB_TERMINAL_POLL_MS", default_value_t = 100)]
    pub poll_interval_ms: u64,

    /// 每次读取的最大字节数
    #[arg(long, env = "WEB_TERMINAL_CHUNK_SIZE", default_value_t = 20 * 1024)]
    pub chunk_size: usize,
}

fn parse_env_pair(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("环境变量格式应为 KEY=VALUE: {}", raw)),
    }
}

/// 服务器配置
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,
    pub static_dir: PathBuf,
    pub build_frontend: bool,
    pub session: SessionConfig,
}

/// 会话配置
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// shell 路径，None 表示自动检测
    pub shell_path: Option<String>,
    /// 工作目录
    pub cwd: Option<String>,
    /// TERM 环境变量
    pub term: String,
    /// 额外环境变量
    pub env: HashMap<String, String>,
    /// 初始终端尺寸
    pub term_size: TermSize,
    /// SIGTERM 与 SIGKILL 之间的宽限期
    pub grace_period: Duration,
    /// 等待输出泵结束、等待子进程回收的上限
    pub join_timeout: Duration,
    /// 输出泵配置
    pub pump: OutputPumpConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            shell_path: None,
            cwd: None,
            term: DEFAULT_TERM.to_string(),
            env: HashMap::new(),
            term_size: TermSize::default(),
            grace_period: Duration::from_millis(200),
            join_timeout: Duration::from_secs(1),
            pump: OutputPumpConfig::default(),
        }
    }
}

impl SessionConfig {
    /// 指定 shell
    pub fn with_shell(mut self, shell_path: impl Into<String>) -> Self {
        self.shell_path = Some(shell_path.into());
        self
    }
}

impl From<Cli> for ServerConfig {
    fn from(cli: Cli) -> Self {
        let session = SessionConfig {
            shell_path: cli.shell,
            cwd: cli.cwd,
            term: cli.term,
            env: cli.env.into_iter().collect(),
            term_size: TermSize::default(),
            grace_period: Duration::from_millis(cli.grace_period_ms),
            join_timeout: Duration::from_millis(cli.join_timeout_ms),
            pump: OutputPumpConfig {
                chunk_size: cli.chunk_size.max(1),
                poll_interval: Duration::from_millis(cli.poll_interval_ms.max(1)),
            },
        };

        Self {
            bind_addr: SocketAddr::new(cli.host, cli.port),
            static_dir: cli.static_dir,
            build_frontend: cli.build_frontend,
            session,
        }
    }
}
