//! 传输层
//!
//! WebSocket 连接、HTTP 路由以及会话事件的投递。

pub mod events;
pub mod server;
pub mod socket;
pub mod types;

pub use events::EventSender;
pub use server::{create_router, serve, AppState};
pub use types::{ClientMessage, ServerMessage, SessionEvent, SessionInfo, TermSize};
