//! 会话注册表
//!
//! 按连接 ID 管理 PTY 会话：连接时创建并启动，断开时停止并移除。
//! 同一连接 ID 任意时刻最多对应一个会话。
//!
//! 同一连接 ID 的连接和断开按到达顺序逐个执行（每个 ID 一把锁）；
//! 会话表的锁只在增删条目时短暂持有，启动和停止会话都不在锁内进行。

use futures::future::join_all;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::Mutex;

use crate::config::SessionConfig;
use crate::transport::events::EventSender;
use crate::transport::types::{SessionInfo, TermSize};
use crate::utils::error::TerminalError;

use super::session::PtySession;

type SessionMap = HashMap<String, Arc<PtySession>>;

/// 会话注册表
pub struct SessionRegistry {
    /// 连接 ID -> 会话
    sessions: Arc<Mutex<SessionMap>>,
    /// 连接 ID -> 串行化连接/断开的锁
    key_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    /// 新会话使用的配置
    config: SessionConfig,
}

impl SessionRegistry {
    /// 创建新的注册表
    pub fn new(config: SessionConfig) -> Self {
        Self {
            sessions: Arc::new(Mutex::new(HashMap::new())),
            key_locks: Mutex::new(HashMap::new()),
            config,
        }
    }

    /// 新连接：创建并启动会话，返回会话 ID
    ///
    /// 同一连接 ID 已有会话时，先停止旧会话再启动新会话。启动失败不会
    /// 留下条目。
    pub async fn on_connect(
        &self,
        connection_id: &str,
        events: EventSender,
    ) -> Result<String, TerminalError> {
        let key_lock = self.key_lock(connection_id).await;
        let result = {
            let _guard = key_lock.lock().await;
            self.connect_locked(connection_id, events).await
        };
        self.release_key_lock(connection_id, key_lock).await;

        match &result {
            Ok(session_id) => tracing::info!("创建会话: {} -> {}", connection_id, session_id),
            Err(e) => tracing::error!("连接 {} 创建会话失败: {}", connection_id, e),
        }
        result
    }

    async fn connect_locked(
        &self,
        connection_id: &str,
        events: EventSender,
    ) -> Result<String, TerminalError> {
        let previous = self.sessions.lock().await.remove(connection_id);
        if let Some(previous) = previous {
            tracing::warn!("连接 {} 已有会话，先关闭旧会话", connection_id);
            previous.stop().await;
        }

        let session = Arc::new(PtySession::new(connection_id, self.config.clone(), events));
        session.start().await?;

        self.sessions
            .lock()
            .await
            .insert(connection_id.to_string(), session.clone());
        self.spawn_reaper(&session);
        Ok(session.session_id().to_string())
    }

    async fn key_lock(&self, connection_id: &str) -> Arc<Mutex<()>> {
        self.key_locks
            .lock()
            .await
            .entry(connection_id.to_string())
            .or_default()
            .clone()
    }

    /// 没有其他调用方在等待时移除这个 ID 的锁
    async fn release_key_lock(&self, connection_id: &str, key_lock: Arc<Mutex<()>>) {
        let mut key_locks = self.key_locks.lock().await;
        // 表里一份，这里一份；克隆只在 key_locks 锁内发生
        if Arc::strong_count(&key_lock) == 2 {
            key_locks.remove(connection_id);
        }
    }

    /// 会话自行停止后（shell 退出、I/O 失败）把它从表中移除
    fn spawn_reaper(&self, session: &Arc<PtySession>) {
        let sessions: Weak<Mutex<SessionMap>> = Arc::downgrade(&self.sessions);
        let connection_id = session.connection_id().to_string();
        let session_id = session.session_id().to_string();
        let mut watcher = session.watch_state();

        tokio::spawn(async move {
            watcher.wait_stopped().await;

            let Some(sessions) = sessions.upgrade() else {
                return;
            };
            let mut sessions = sessions.lock().await;
            // 条目可能已经被断开或替换
            let owned = sessions
                .get(&connection_id)
                .is_some_and(|current| current.session_id() == session_id);
            if owned {
                sessions.remove(&connection_id);
                tracing::debug!("移除已停止的会话: {}", connection_id);
            }
        });
    }

    /// 连接断开：停止并移除会话（未知 ID 忽略）
    pub async fn on_disconnect(&self, connection_id: &str) {
        let key_lock = self.key_lock(connection_id).await;
        {
            let _guard = key_lock.lock().await;
            let session = self.sessions.lock().await.remove(connection_id);
            match session {
                Some(session) => {
                    session.stop().await;
                    tracing::info!("连接断开，会话已关闭: {}", connection_id);
                }
                None => tracing::debug!("断开的连接没有会话: {}", connection_id),
            }
        }
        self.release_key_lock(connection_id, key_lock).await;
    }

    /// 转发输入（未知 ID 丢弃）
    pub async fn on_input(&self, connection_id: &str, data: &[u8]) {
        if let Some(session) = self.get(connection_id).await {
            session.write_input(data).await;
        }
    }

    /// 转发窗口大小变化（未知 ID 忽略）
    pub async fn on_resize(&self, connection_id: &str, term_size: TermSize) {
        if let Some(session) = self.get(connection_id).await {
            session.resize(term_size).await;
        }
    }

    async fn get(&self, connection_id: &str) -> Option<Arc<PtySession>> {
        self.sessions.lock().await.get(connection_id).cloned()
    }

    /// 列出所有会话
    pub async fn list_sessions(&self) -> Vec<SessionInfo> {
        let sessions: Vec<_> = self.sessions.lock().await.values().cloned().collect();
        let mut infos = Vec::with_capacity(sessions.len());
        for session in sessions {
            infos.push(session.info().await);
        }
        infos.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        infos
    }

    /// 获取会话数量
    pub async fn session_count(&self) -> usize {
        self.sessions.lock().await.len()
    }

    /// 连接是否有会话
    pub async fn contains(&self, connection_id: &str) -> bool {
        self.sessions.lock().await.contains_key(connection_id)
    }

    /// 停止所有会话
    pub async fn shutdown(&self) {
        let sessions: Vec<_> = self.sessions.lock().await.drain().map(|(_, s)| s).collect();
        if sessions.is_empty() {
            return;
        }

        tracing::info!("关闭 {} 个会话", sessions.len());
        join_all(sessions.iter().map(|session| session.stop())).await;
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new(SessionConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::types::SessionEvent;
    use crate::utils::state::SessionState;
    use std::collections::HashSet;
    use std::time::{Duration, Instant};
    use tokio::sync::mpsc;
    use tokio_test::{assert_err, assert_ok};

    fn sh_registry() -> SessionRegistry {
        SessionRegistry::new(SessionConfig::default().with_shell("/bin/sh"))
    }

    async fn collect_output(
        rx: &mut mpsc::UnboundedReceiver<SessionEvent>,
        needle: &str,
        timeout: Duration,
    ) -> String {
        let deadline = Instant::now() + timeout;
        let mut output = String::new();
        while Instant::now() < deadline && !output.contains(needle) {
            match tokio::time::timeout(Duration::from_millis(100), rx.recv()).await {
                Ok(Some(SessionEvent::Output { data, .. })) => output.push_str(&data),
                Ok(Some(SessionEvent::Exited { .. })) | Ok(None) => break,
                Err(_) => {}
            }
        }
        output
    }

    async fn wait_evicted(registry: &SessionRegistry, connection_id: &str, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if !registry.contains(connection_id).await {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_echo_then_disconnect() {
        let registry = sh_registry();
        let (events, mut rx) = EventSender::channel();

        assert_ok!(registry.on_connect("A", events).await);
        assert!(registry.contains("A").await);

        registry.on_input("A", b"echo hi\n").await;
        let output = collect_output(&mut rx, "hi\r\n", Duration::from_secs(3)).await;
        assert!(output.contains("hi"), "got: {output}");

        registry.on_disconnect("A").await;
        assert!(!registry.contains("A").await);

        // 断开后的输入直接丢弃，不会再有输出
        while rx.try_recv().is_ok() {}
        registry.on_input("A", b"echo again\n").await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_spawn_failure_leaves_no_entry() {
        let registry =
            SessionRegistry::new(SessionConfig::default().with_shell("/nonexistent/shell"));
        let (events, _rx) = EventSender::channel();

        let result = registry.on_connect("A", events).await;
        assert!(matches!(assert_err!(result), TerminalError::SpawnFailed(_)));
        assert!(!registry.contains("A").await);
        assert_eq!(registry.session_count().await, 0);
    }

    #[tokio::test]
    async fn test_shell_exit_evicts_session() {
        let registry = sh_registry();
        let (events, mut rx) = EventSender::channel();
        assert_ok!(registry.on_connect("A", events).await);

        registry.on_input("A", b"exit\n").await;
        assert!(wait_evicted(&registry, "A", Duration::from_secs(5)).await);

        let mut exited = false;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, SessionEvent::Exited { .. }) {
                exited = true;
            }
        }
        assert!(exited);

        // 之后的事件对已移除的连接无效
        registry.on_input("A", b"echo x\n").await;
        registry.on_resize("A", TermSize { rows: 10, cols: 10 }).await;
        registry.on_disconnect("A").await;
    }

    #[tokio::test]
    async fn test_reconnect_replaces_session() {
        let registry = sh_registry();
        let (first_events, _first_rx) = EventSender::channel();
        let (second_events, _second_rx) = EventSender::channel();

        let first = assert_ok!(registry.on_connect("A", first_events).await);
        let second = assert_ok!(registry.on_connect("A", second_events).await);
        assert_ne!(first, second);
        assert_eq!(registry.session_count().await, 1);

        // 旧会话的收尾不能把新会话移除
        tokio::time::sleep(Duration::from_millis(300)).await;
        let sessions = registry.list_sessions().await;
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].session_id, second);
        assert_eq!(sessions[0].state, SessionState::Running);

        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_reconnect_stops_previous_first() {
        let registry = sh_registry();
        let (first_events, mut first_rx) = EventSender::channel();
        let (second_events, _second_rx) = EventSender::channel();

        assert_ok!(registry.on_connect("A", first_events).await);
        assert_ok!(registry.on_connect("A", second_events).await);

        // 旧会话的 Exited 在新会话建立之前就已发出
        let mut exited = false;
        while let Ok(event) = first_rx.try_recv() {
            if matches!(event, SessionEvent::Exited { .. }) {
                exited = true;
            }
        }
        assert!(exited);

        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_slow_reconnect_does_not_block_other_connections() {
        let mut config = SessionConfig::default().with_shell("/bin/sh");
        config.grace_period = Duration::from_secs(1);
        let registry = Arc::new(SessionRegistry::new(config));

        let (a_events, _a_rx) = EventSender::channel();
        let (b_events, mut b_rx) = EventSender::channel();
        assert_ok!(registry.on_connect("A", a_events).await);
        assert_ok!(registry.on_connect("B", b_events).await);

        // A 的 shell 忽略 SIGTERM，停止要等满宽限期
        registry.on_input("A", b"trap '' TERM\n").await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        let reconnect = {
            let registry = registry.clone();
            tokio::spawn(async move {
                let (events, _rx) = EventSender::channel();
                registry.on_connect("A", events).await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let started = Instant::now();
        assert!(registry.contains("B").await);
        registry.on_input("B", b"echo B_ALIVE\n").await;
        let sessions = registry.list_sessions().await;
        assert!(sessions.iter().any(|info| info.connection_id == "B"));
        assert!(started.elapsed() < Duration::from_millis(300));

        let output = collect_output(&mut b_rx, "B_ALIVE\r\n", Duration::from_secs(3)).await;
        assert!(output.contains("B_ALIVE"));

        assert_ok!(reconnect.await.unwrap());
        assert_eq!(registry.session_count().await, 2);
        assert!(registry.key_locks.lock().await.is_empty());

        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_concurrent_connects_leave_one_session() {
        let registry = Arc::new(sh_registry());

        let tasks: Vec<_> = (0..4)
            .map(|_| {
                let registry = registry.clone();
                tokio::spawn(async move {
                    let (events, _rx) = EventSender::channel();
                    registry.on_connect("A", events).await
                })
            })
            .collect();
        let mut ids = Vec::new();
        for task in tasks {
            ids.push(assert_ok!(task.await.unwrap()));
        }

        let sessions = registry.list_sessions().await;
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].state, SessionState::Running);
        assert!(ids.contains(&sessions[0].session_id));
        assert!(registry.key_locks.lock().await.is_empty());

        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_resize_keeps_session_running() {
        let registry = sh_registry();
        let (events, _rx) = EventSender::channel();
        assert_ok!(registry.on_connect("A", events).await);

        registry.on_resize("A", TermSize { rows: 40, cols: 120 }).await;
        let sessions = registry.list_sessions().await;
        assert_eq!(sessions[0].state, SessionState::Running);

        registry.on_disconnect("A").await;
    }

    #[tokio::test]
    async fn test_sessions_are_isolated() {
        let registry = sh_registry();
        let (a_events, mut a_rx) = EventSender::channel();
        let (b_events, mut b_rx) = EventSender::channel();
        assert_ok!(registry.on_connect("A", a_events).await);
        assert_ok!(registry.on_connect("B", b_events).await);

        registry.on_disconnect("A").await;
        registry.on_input("B", b"echo STILL_ALIVE\n").await;

        let output = collect_output(&mut b_rx, "STILL_ALIVE\r\n", Duration::from_secs(3)).await;
        assert!(output.contains("STILL_ALIVE"));
        while let Ok(event) = a_rx.try_recv() {
            assert_eq!(event.connection_id(), "A");
        }

        registry.shutdown().await;
        assert_eq!(registry.session_count().await, 0);
    }

    #[tokio::test]
    async fn test_session_ids_are_unique() {
        let registry = sh_registry();
        let mut ids = HashSet::new();

        for i in 0..5 {
            let (events, _rx) = EventSender::channel();
            let id = assert_ok!(registry.on_connect(&format!("conn-{i}"), events).await);
            assert!(uuid::Uuid::parse_str(&id).is_ok());
            ids.insert(id);
        }
        assert_eq!(ids.len(), 5);
        assert_eq!(registry.session_count().await, 5);

        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_unknown_connection_is_ignored() {
        let registry = sh_registry();
        registry.on_input("missing", b"ls\n").await;
        registry.on_resize("missing", TermSize::default()).await;
        registry.on_disconnect("missing").await;
        assert_eq!(registry.session_count().await, 0);
    }
}
