//! WebSocket 终端连接
//!
//! 每个 WebSocket 连接分配一个连接 ID，对应注册表中的一个会话。

use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};

use crate::pty::registry::SessionRegistry;
use crate::transport::events::EventSender;
use crate::transport::server::AppState;
use crate::transport::types::{ClientMessage, ServerMessage, SessionEvent};
use crate::utils::error::TerminalError;

/// GET /ws
pub async fn websocket_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let connection_id = uuid::Uuid::new_v4().to_string();
    let registry = state.registry;
    let (events, mut event_rx) = EventSender::channel();
    let (mut sink, mut stream) = socket.split();

    tracing::info!("客户端连接: {}", connection_id);

    if let Err(e) = registry.on_connect(&connection_id, events).await {
        let _ = send_message(&mut sink, &ServerMessage::Error(e.into())).await;
        let _ = sink.close().await;
        return;
    }

    loop {
        tokio::select! {
            incoming = stream.next() => match incoming {
                Some(Ok(WsMessage::Text(text))) => {
                    if let Some(reply) = handle_client_text(&registry, &connection_id, &text).await {
                        if !send_message(&mut sink, &reply).await {
                            break;
                        }
                    }
                }
                Some(Ok(WsMessage::Binary(data))) => {
                    registry.on_input(&connection_id, &data).await;
                }
                Some(Ok(WsMessage::Close(_))) | None => break,
                // ping/pong 帧由 axum 处理
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::debug!("WebSocket 读取失败: {}: {}", connection_id, e);
                    break;
                }
            },
            event = event_rx.recv() => match event {
                Some(event) => {
                    let ended = matches!(event, SessionEvent::Exited { .. });
                    if !send_message(&mut sink, &ServerMessage::from(event)).await {
                        break;
                    }
                    if ended {
                        let _ = sink.close().await;
                        break;
                    }
                }
                None => break,
            },
        }
    }

    registry.on_disconnect(&connection_id).await;
    tracing::info!("客户端断开: {}", connection_id);
}

/// 处理一条文本帧，返回需要回复给客户端的消息
pub(crate) async fn handle_client_text(
    registry: &SessionRegistry,
    connection_id: &str,
    text: &str,
) -> Option<ServerMessage> {
    let message = match serde_json::from_str::<ClientMessage>(text) {
        Ok(message) => message,
        Err(e) => {
            tracing::warn!("无法解析客户端消息: {}: {}", connection_id, e);
            return Some(ServerMessage::Error(
                TerminalError::InvalidMessage(e.to_string()).into(),
            ));
        }
    };

    match message {
        ClientMessage::TerminalInput(data) => {
            registry.on_input(connection_id, data.as_bytes()).await;
            None
        }
        ClientMessage::Resize(size) if size.rows == 0 || size.cols == 0 => {
            Some(ServerMessage::Error(
                TerminalError::InvalidMessage(format!("无效的终端尺寸: {}x{}", size.cols, size.rows))
                    .into(),
            ))
        }
        ClientMessage::Resize(size) => {
            registry.on_resize(connection_id, size).await;
            None
        }
        ClientMessage::Ping => Some(ServerMessage::Pong),
    }
}

/// 发送一条服务器消息，返回连接是否仍可写
async fn send_message(sink: &mut SplitSink<WebSocket, WsMessage>, message: &ServerMessage) -> bool {
    let json = match serde_json::to_string(message) {
        Ok(json) => json,
        Err(e) => {
            tracing::error!("序列化服务器消息失败: {}", e);
            return true;
        }
    };
    sink.send(WsMessage::Text(json)).await.is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionConfig;
    use std::time::{Duration, Instant};

    fn sh_registry() -> SessionRegistry {
        SessionRegistry::new(SessionConfig::default().with_shell("/bin/sh"))
    }

    #[tokio::test]
    async fn test_ping_replies_pong() {
        let registry = sh_registry();
        let reply = handle_client_text(&registry, "A", r#"{"event":"ping"}"#).await;
        assert_eq!(reply, Some(ServerMessage::Pong));
    }

    #[tokio::test]
    async fn test_invalid_frame_replies_error() {
        let registry = sh_registry();
        let reply = handle_client_text(&registry, "A", "not json").await;
        match reply {
            Some(ServerMessage::Error(payload)) => {
                assert_eq!(payload.error_type, "invalid_message");
                assert_eq!(payload.code, 1005);
            }
            other => panic!("unexpected reply: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_zero_resize_is_rejected() {
        let registry = sh_registry();
        let reply =
            handle_client_text(&registry, "A", r#"{"event":"resize","data":{"rows":0,"cols":80}}"#)
                .await;
        assert!(matches!(reply, Some(ServerMessage::Error(_))));
    }

    #[tokio::test]
    async fn test_input_and_resize_reach_session() {
        let registry = sh_registry();
        let (events, mut rx) = EventSender::channel();
        registry.on_connect("A", events).await.unwrap();

        let reply = handle_client_text(
            &registry,
            "A",
            r#"{"event":"resize","data":{"rows":40,"cols":120}}"#,
        )
        .await;
        assert!(reply.is_none());

        let reply = handle_client_text(
            &registry,
            "A",
            r#"{"event":"terminal-input","data":"stty size\n"}"#,
        )
        .await;
        assert!(reply.is_none());

        let deadline = Instant::now() + Duration::from_secs(3);
        let mut output = String::new();
        while Instant::now() < deadline && !output.contains("40 120") {
            if let Ok(Some(SessionEvent::Output { data, .. })) =
                tokio::time::timeout(Duration::from_millis(100), rx.recv()).await
            {
                output.push_str(&data);
            }
        }
        assert!(output.contains("40 120"), "got: {output}");

        let sessions = registry.list_sessions().await;
        assert_eq!(sessions.len(), 1);
        registry.on_disconnect("A").await;
    }
}
