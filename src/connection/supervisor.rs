//! 连接监管：唯一传输连接的建立、重连与终止
//!
//! 单循环顺序消费传输事件：凭据轮换立即落盘，连接更新驱动状态机，入站消息先在循环上
//! 同步交给 InboundHandler 排队，再在独立任务中处理（AI 调用不阻塞事件投递）。任一时刻只有一个会话；
//! 上一个会话 close 返回后才会再次 connect。

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;

use super::backoff::Backoff;
use super::state::{CloseClass, CloseReason, ConnectionState};
use crate::conversation::ConversationRegistry;
use crate::pairing::PairingBroadcaster;
use crate::session::SessionStore;
use crate::transport::{
    Envelope, LinkState, Transport, TransportConnection, TransportEvent, TransportSession,
};

/// 入站消息处理者（MessageRouter 实现）
pub trait InboundHandler: Send + Sync {
    /// 在事件循环上按到达顺序同步调用，同步部分须完成排队；返回的任务由监管者 spawn
    fn dispatch(
        self: Arc<Self>,
        session: Arc<dyn TransportSession>,
        envelope: Envelope,
    ) -> BoxFuture<'static, ()>;
}

/// 监管循环的退出方式
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorExit {
    /// 收到关闭信号
    Shutdown,
    /// 致命断开或本地不可恢复错误，需要运维介入
    Fatal(String),
}

/// 单个会话的结束方式
enum SessionEnd {
    Shutdown,
    Closed(CloseReason),
}

const TRANSITION_CAPACITY: usize = 64;

pub struct ConnectionSupervisor {
    transport: Arc<dyn Transport>,
    store: Arc<dyn SessionStore>,
    broadcaster: Arc<PairingBroadcaster>,
    registry: Arc<ConversationRegistry>,
    handler: Arc<dyn InboundHandler>,
    backoff: Backoff,
    state_tx: watch::Sender<ConnectionState>,
    transitions: broadcast::Sender<ConnectionState>,
    /// 本次进程运行中是否展示过配对码；进入 Open 后复位
    qr_shown: bool,
}

impl ConnectionSupervisor {
    pub fn new(
        transport: Arc<dyn Transport>,
        store: Arc<dyn SessionStore>,
        broadcaster: Arc<PairingBroadcaster>,
        registry: Arc<ConversationRegistry>,
        handler: Arc<dyn InboundHandler>,
    ) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Connecting);
        let (transitions, _) = broadcast::channel(TRANSITION_CAPACITY);
        Self {
            transport,
            store,
            broadcaster,
            registry,
            handler,
            backoff: Backoff::new(Duration::from_millis(500), Duration::from_secs(30)),
            state_tx,
            transitions,
            qr_shown: false,
        }
    }

    pub fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.backoff = Backoff::new(initial, max);
        self
    }

    /// 当前状态（只读视图）
    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// 逐条状态转移（测试与日志用；watch 会合并中间态）
    pub fn transitions(&self) -> broadcast::Receiver<ConnectionState> {
        self.transitions.subscribe()
    }

    /// 运行监管循环，直到关闭信号或致命断开
    pub async fn run(mut self, shutdown: CancellationToken) -> SupervisorExit {
        self.enter(ConnectionState::Connecting);
        self.broadcaster.loading();

        loop {
            let credentials = match self.store.load().await {
                Ok(c) => c,
                Err(e) => {
                    return self.fail(format!("Failed to load session credentials: {}", e));
                }
            };
            let resumed = credentials.is_some();

            let connected = tokio::select! {
                _ = shutdown.cancelled() => {
                    self.enter(ConnectionState::Closing);
                    return SupervisorExit::Shutdown;
                }
                r = self.transport.connect(credentials) => r,
            };

            let TransportConnection { session, mut events } = match connected {
                Ok(c) => c,
                Err(e) if e.is_fatal() => {
                    return self.fail(format!("Transport rejected the session: {}", e));
                }
                Err(e) => {
                    tracing::warn!("Connect via {} failed: {}", self.transport.name(), e);
                    self.enter(ConnectionState::ClosedRetry);
                    self.broadcaster.reconnecting(&e.to_string());
                    if !self.wait_backoff(&shutdown).await {
                        self.enter(ConnectionState::Closing);
                        return SupervisorExit::Shutdown;
                    }
                    self.enter(ConnectionState::Connecting);
                    self.broadcaster.loading();
                    continue;
                }
            };
            tracing::info!(
                "Transport {} connecting ({})",
                self.transport.name(),
                if resumed { "resuming session" } else { "new session" }
            );

            match self.drive(&session, &mut events, &shutdown).await {
                SessionEnd::Shutdown => {
                    self.enter(ConnectionState::Closing);
                    session.close().await;
                    tracing::info!("Transport session closed on shutdown");
                    return SupervisorExit::Shutdown;
                }
                SessionEnd::Closed(reason) => {
                    let class = reason.class();
                    match class {
                        CloseClass::Transient => {
                            tracing::warn!("Connection closed ({}), reconnecting", reason);
                            self.enter(ConnectionState::ClosedRetry);
                            self.broadcaster.reconnecting(&reason.to_string());
                            let dropped = self.registry.clear_all().await;
                            if dropped > 0 {
                                tracing::info!("Discarded {} conversation contexts", dropped);
                            }
                            session.close().await;
                            drop(events);
                            if !self.wait_backoff(&shutdown).await {
                                self.enter(ConnectionState::Closing);
                                return SupervisorExit::Shutdown;
                            }
                            self.enter(ConnectionState::Connecting);
                            self.broadcaster.loading();
                        }
                        CloseClass::FatalLogout | CloseClass::FatalReplaced | CloseClass::Unknown => {
                            if class == CloseClass::FatalLogout {
                                // 通知对端作废设备登记，之后本地凭据也不再可用
                                if let Err(e) = session.logout().await {
                                    tracing::warn!("Transport logout failed: {}", e);
                                }
                            }
                            session.close().await;
                            if class == CloseClass::FatalLogout {
                                if let Err(e) = self.store.clear().await {
                                    tracing::error!("Failed to clear session credentials: {}", e);
                                }
                            }
                            return self.fail(fatal_message(&reason, class));
                        }
                    }
                }
            }
        }
    }

    /// 消费单个会话的事件，直到断开或关闭信号
    async fn drive(
        &mut self,
        session: &Arc<dyn TransportSession>,
        events: &mut mpsc::UnboundedReceiver<TransportEvent>,
        shutdown: &CancellationToken,
    ) -> SessionEnd {
        loop {
            let event = tokio::select! {
                _ = shutdown.cancelled() => return SessionEnd::Shutdown,
                ev = events.recv() => ev,
            };
            let Some(event) = event else {
                tracing::warn!("Transport event stream ended without a close update");
                return SessionEnd::Closed(CloseReason::ConnectionLost);
            };

            match event {
                TransportEvent::CredentialsRotated(credentials) => {
                    if let Err(e) = self.store.save(&credentials).await {
                        tracing::error!("Failed to persist rotated credentials: {}", e);
                    }
                }
                TransportEvent::ConnectionUpdate(update) => {
                    if let Some(code) = update.pairing_code {
                        self.enter(ConnectionState::QrPending);
                        if self.broadcaster.qr(&code) {
                            self.qr_shown = true;
                        }
                    }
                    match update.link {
                        Some(LinkState::Open) => {
                            self.enter(ConnectionState::Open);
                            self.broadcaster.opened(self.qr_shown);
                            self.qr_shown = false;
                            self.backoff.reset();
                        }
                        Some(LinkState::Close) => {
                            let reason = update
                                .close_reason
                                .unwrap_or_else(|| CloseReason::Unknown("unspecified".to_string()));
                            return SessionEnd::Closed(reason);
                        }
                        Some(LinkState::Connecting) | None => {}
                    }
                }
                TransportEvent::MessageReceived(envelope) => {
                    let task = Arc::clone(&self.handler).dispatch(Arc::clone(session), envelope);
                    tokio::spawn(task);
                }
            }
        }
    }

    /// 按退避等待；期间收到关闭信号返回 false
    async fn wait_backoff(&mut self, shutdown: &CancellationToken) -> bool {
        let delay = self.backoff.next_delay();
        tracing::debug!("Reconnecting in {:?}", delay);
        tokio::select! {
            _ = shutdown.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }

    fn fail(&mut self, message: String) -> SupervisorExit {
        tracing::error!("{}", message);
        self.enter(ConnectionState::ClosedFatal);
        self.broadcaster.fatal(message.clone());
        SupervisorExit::Fatal(message)
    }

    fn enter(&self, state: ConnectionState) {
        let previous = *self.state_tx.borrow();
        if previous != state {
            tracing::info!("Connection state: {} -> {}", previous, state);
        }
        self.state_tx.send_replace(state);
        let _ = self.transitions.send(state);
    }
}

fn fatal_message(reason: &CloseReason, class: CloseClass) -> String {
    match class {
        CloseClass::FatalLogout => format!(
            "Connection closed ({}): device logged out, delete the session and scan again",
            reason
        ),
        CloseClass::FatalReplaced => format!(
            "Connection closed ({}): another session was opened, close it and restart",
            reason
        ),
        _ => format!("Connection closed ({}): unrecognised reason, restart required", reason),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::SeedPolicy;
    use crate::pairing::{OperatorEvent, StatusAssets, SvgQrEncoder};
    use crate::session::{MemorySessionStore, SessionCredentials};
    use crate::transport::{MockSession, MockTransport, TransportError};
    use std::sync::Mutex;

    const WAIT: Duration = Duration::from_secs(2);

    #[derive(Default)]
    struct RecordingHandler {
        seen: Mutex<Vec<String>>,
    }

    impl InboundHandler for RecordingHandler {
        fn dispatch(
            self: Arc<Self>,
            _session: Arc<dyn TransportSession>,
            envelope: Envelope,
        ) -> BoxFuture<'static, ()> {
            self.seen.lock().unwrap().push(envelope.message.id);
            Box::pin(async {})
        }
    }

    struct Harness {
        transport: Arc<MockTransport>,
        store: Arc<MemorySessionStore>,
        broadcaster: Arc<PairingBroadcaster>,
        registry: Arc<ConversationRegistry>,
        handler: Arc<RecordingHandler>,
    }

    impl Harness {
        fn new(store: MemorySessionStore) -> Self {
            Self {
                transport: Arc::new(MockTransport::new()),
                store: Arc::new(store),
                broadcaster: Arc::new(PairingBroadcaster::new(
                    Arc::new(SvgQrEncoder::default()),
                    StatusAssets::default(),
                )),
                registry: Arc::new(ConversationRegistry::new(SeedPolicy::default(), 20)),
                handler: Arc::new(RecordingHandler::default()),
            }
        }

        fn supervisor(&self) -> ConnectionSupervisor {
            ConnectionSupervisor::new(
                self.transport.clone(),
                self.store.clone(),
                self.broadcaster.clone(),
                self.registry.clone(),
                self.handler.clone(),
            )
            .with_backoff(Duration::from_millis(10), Duration::from_millis(40))
        }

        async fn session(&self, n: usize) -> Arc<MockSession> {
            self.transport
                .wait_for_session(n, WAIT)
                .await
                .expect("session not established")
        }
    }

    async fn wait_state(rx: &mut watch::Receiver<ConnectionState>, want: ConnectionState) {
        tokio::time::timeout(WAIT, rx.wait_for(|s| *s == want))
            .await
            .expect("state not reached")
            .expect("supervisor dropped");
    }

    #[tokio::test]
    async fn test_credentials_rotation_is_persisted() {
        let h = Harness::new(MemorySessionStore::new());
        let sup = h.supervisor();
        let token = CancellationToken::new();
        let run = tokio::spawn(sup.run(token.clone()));

        let s = h.session(1).await;
        s.emit(TransportEvent::CredentialsRotated(
            SessionCredentials::new().with_part("creds.json", b"{}".to_vec()),
        ));
        s.emit_open();

        tokio::time::sleep(Duration::from_millis(50)).await;
        let saved = h.store.load().await.unwrap().unwrap();
        assert_eq!(saved.get("creds.json"), Some(&b"{}"[..]));

        token.cancel();
        assert_eq!(run.await.unwrap(), SupervisorExit::Shutdown);
        assert!(s.is_closed());
    }

    #[tokio::test]
    async fn test_qr_then_open_reports_paired() {
        let h = Harness::new(MemorySessionStore::new());
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        h.broadcaster.attach(tx);

        let sup = h.supervisor();
        let mut state = sup.state();
        let token = CancellationToken::new();
        let run = tokio::spawn(sup.run(token.clone()));

        let s = h.session(1).await;
        s.emit_qr("2@pairing-code");
        wait_state(&mut state, ConnectionState::QrPending).await;
        assert!(h.broadcaster.pending_qr().is_some());

        s.emit_open();
        wait_state(&mut state, ConnectionState::Open).await;
        assert!(h.broadcaster.pending_qr().is_none());

        token.cancel();
        run.await.unwrap();

        let mut frames = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            frames.push(ev);
        }
        assert!(frames
            .iter()
            .any(|e| matches!(e, OperatorEvent::Qr(uri) if uri.starts_with("data:image/svg+xml;base64,"))));
        assert!(frames
            .iter()
            .any(|e| matches!(e, OperatorEvent::Log(l) if l == "QR Code has been scanned!")));
    }

    #[tokio::test]
    async fn test_transient_close_reconnects_once_after_teardown() {
        let h = Harness::new(MemorySessionStore::new());
        let sup = h.supervisor();
        let mut transitions = sup.transitions();
        let token = CancellationToken::new();
        let run = tokio::spawn(sup.run(token.clone()));

        let s1 = h.session(1).await;
        s1.emit_open();
        let id = crate::conversation::ConversationId::new("6281@s.whatsapp.net");
        tokio::time::sleep(Duration::from_millis(20)).await;
        h.registry.get_or_create(&id, None).await;

        s1.emit_close(CloseReason::TimedOut);
        let s2 = h.session(2).await;
        assert!(s1.is_closed());
        assert!(h.registry.is_empty().await);
        assert_eq!(h.transport.overlapping_connects(), 0);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(h.transport.connect_count(), 2);

        token.cancel();
        run.await.unwrap();
        assert!(s2.is_closed());

        let mut seen = Vec::new();
        while let Ok(st) = transitions.try_recv() {
            seen.push(st);
        }
        let open_at = seen.iter().position(|s| *s == ConnectionState::Open).unwrap();
        assert_eq!(
            &seen[open_at..open_at + 3],
            &[
                ConnectionState::Open,
                ConnectionState::ClosedRetry,
                ConnectionState::Connecting
            ]
        );
    }

    #[tokio::test]
    async fn test_logged_out_is_fatal_and_clears_credentials() {
        let creds = SessionCredentials::new().with_part("creds.json", b"x".to_vec());
        let h = Harness::new(MemorySessionStore::with_credentials(creds));
        let sup = h.supervisor();
        let mut state = sup.state();
        let run = tokio::spawn(sup.run(CancellationToken::new()));

        let s = h.session(1).await;
        s.emit_open();
        wait_state(&mut state, ConnectionState::Open).await;
        s.emit_close(CloseReason::LoggedOut);

        let exit = tokio::time::timeout(WAIT, run).await.unwrap().unwrap();
        assert!(matches!(exit, SupervisorExit::Fatal(_)));
        assert_eq!(*state.borrow(), ConnectionState::ClosedFatal);
        assert!(s.is_closed());
        assert!(s.is_logged_out());
        assert!(h.store.load().await.unwrap().is_none());

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(h.transport.connect_count(), 1);
        assert_eq!(
            h.broadcaster.current().status,
            crate::pairing::PairingStatus::Fatal
        );
    }

    #[tokio::test]
    async fn test_unknown_close_keeps_credentials() {
        let creds = SessionCredentials::new().with_part("creds.json", b"x".to_vec());
        let h = Harness::new(MemorySessionStore::with_credentials(creds));
        let run = tokio::spawn(h.supervisor().run(CancellationToken::new()));

        let s = h.session(1).await;
        s.emit_close(CloseReason::from_status_code(403));

        let exit = tokio::time::timeout(WAIT, run).await.unwrap().unwrap();
        assert!(matches!(exit, SupervisorExit::Fatal(msg) if msg.contains("unknown(403)")));
        assert!(h.store.load().await.unwrap().is_some());
        assert!(!s.is_logged_out());
        assert_eq!(h.transport.connect_count(), 1);
    }

    #[tokio::test]
    async fn test_connect_errors_classified() {
        let h = Harness::new(MemorySessionStore::new());
        h.transport
            .fail_next_connect(TransportError::Network("refused".into()));
        let token = CancellationToken::new();
        let run = tokio::spawn(h.supervisor().run(token.clone()));

        // 网络错误退避后重试
        h.session(1).await;
        assert_eq!(h.transport.connect_count(), 2);
        token.cancel();
        assert_eq!(run.await.unwrap(), SupervisorExit::Shutdown);

        let h = Harness::new(MemorySessionStore::new());
        h.transport
            .fail_next_connect(TransportError::Credentials("corrupt".into()));
        let exit = tokio::time::timeout(WAIT, h.supervisor().run(CancellationToken::new()))
            .await
            .unwrap();
        assert!(matches!(exit, SupervisorExit::Fatal(_)));
        assert_eq!(h.transport.connect_count(), 1);
    }

    #[tokio::test]
    async fn test_messages_are_dispatched() {
        let h = Harness::new(MemorySessionStore::new());
        let token = CancellationToken::new();
        let run = tokio::spawn(h.supervisor().run(token.clone()));

        let s = h.session(1).await;
        s.emit_open();
        s.emit_message(crate::transport::text_envelope("m1", "62811@s.whatsapp.net", "hi"));
        s.emit_message(crate::transport::text_envelope("m2", "62812@s.whatsapp.net", "yo"));

        tokio::time::sleep(Duration::from_millis(100)).await;
        let mut seen = h.handler.seen.lock().unwrap().clone();
        seen.sort();
        assert_eq!(seen, vec!["m1".to_string(), "m2".to_string()]);

        token.cancel();
        run.await.unwrap();
    }
}
