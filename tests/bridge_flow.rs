//! 端到端：Mock 传输 + 脚本化 AI，经完整装配（监管循环、路由、注册表、运维服务）验证行为

use std::sync::Arc;
use std::time::Duration;

use chatbridge::config::{AccessScope, AppConfig};
use chatbridge::connection::{CloseReason, ConnectionState, SupervisorExit};
use chatbridge::conversation::ConversationId;
use chatbridge::core::{BridgeBuilder, BridgeError};
use chatbridge::llm::{LlmError, ScriptedLlmClient};
use chatbridge::pairing::PairingStatus;
use chatbridge::session::{MemorySessionStore, SessionCredentials, SessionStore};
use chatbridge::transport::{group_envelope, text_envelope, MockSession, MockTransport, TransportEvent};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const WAIT: Duration = Duration::from_secs(2);
const ALICE: &str = "6281111@s.whatsapp.net";
const BOB: &str = "6282222@s.whatsapp.net";

struct Running {
    transport: Arc<MockTransport>,
    llm: Arc<ScriptedLlmClient>,
    store: Arc<MemorySessionStore>,
    registry: Arc<chatbridge::conversation::ConversationRegistry>,
    broadcaster: Arc<chatbridge::pairing::PairingBroadcaster>,
    state: watch::Receiver<ConnectionState>,
    transitions: broadcast::Receiver<ConnectionState>,
    shutdown: CancellationToken,
    handle: JoinHandle<Result<SupervisorExit, BridgeError>>,
}

impl Running {
    async fn session(&self, n: usize) -> Arc<MockSession> {
        self.transport
            .wait_for_session(n, WAIT)
            .await
            .expect("session not established")
    }

    async fn wait_state(&mut self, want: ConnectionState) {
        tokio::time::timeout(WAIT, self.state.wait_for(|s| *s == want))
            .await
            .expect("state not reached")
            .expect("bridge stopped");
    }

    fn drain_transitions(&mut self) -> Vec<ConnectionState> {
        let mut out = Vec::new();
        while let Ok(s) = self.transitions.try_recv() {
            out.push(s);
        }
        out
    }

    async fn stop(self) -> SupervisorExit {
        self.shutdown.cancel();
        tokio::time::timeout(WAIT, self.handle)
            .await
            .expect("bridge did not stop")
            .unwrap()
            .unwrap()
    }
}

async fn start(config: AppConfig, llm: ScriptedLlmClient, store: MemorySessionStore) -> Running {
    let mut config = config;
    config.reconnect.initial_backoff_ms = 10;
    config.reconnect.max_backoff_ms = 50;

    let transport = Arc::new(MockTransport::new());
    let llm = Arc::new(llm);
    let store = Arc::new(store);
    let bridge = BridgeBuilder::new(config)
        .with_transport(transport.clone())
        .with_llm(llm.clone())
        .with_store(store.clone())
        .build();

    let registry = bridge.registry.clone();
    let broadcaster = bridge.broadcaster.clone();
    let state = bridge.state();
    let transitions = bridge.transitions();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let shutdown = CancellationToken::new();
    let handle = tokio::spawn(bridge.run_with_listener(listener, shutdown.clone()));

    Running {
        transport,
        llm,
        store,
        registry,
        broadcaster,
        state,
        transitions,
        shutdown,
        handle,
    }
}

fn paired_store() -> MemorySessionStore {
    MemorySessionStore::with_credentials(
        SessionCredentials::new().with_part("creds.json", b"{\"me\":1}".to_vec()),
    )
}

#[tokio::test]
async fn hello_from_new_identity_gets_quoted_reply() {
    let llm = ScriptedLlmClient::new();
    llm.push(Ok("Hi **there**".to_string()));
    let mut bridge = start(AppConfig::default(), llm, paired_store()).await;

    let s = bridge.session(1).await;
    s.emit_open();
    bridge.wait_state(ConnectionState::Open).await;
    s.emit_message(text_envelope("m1", ALICE, "hello"));

    let sent = s.wait_for_sent(1, WAIT).await;
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].text, "Hi *there*");
    assert_eq!(sent[0].quoted.as_deref(), Some("m1"));

    let calls = bridge.llm.calls();
    assert_eq!(calls[0].len(), 3);
    let ctx = bridge.registry.snapshot(&ConversationId::new(ALICE)).await.unwrap();
    assert_eq!(ctx.len(), 4);

    assert_eq!(bridge.stop().await, SupervisorExit::Shutdown);
}

#[tokio::test]
async fn reset_from_unknown_identity_confirms_without_ai() {
    let mut bridge = start(AppConfig::default(), ScriptedLlmClient::new(), paired_store()).await;
    let s = bridge.session(1).await;
    s.emit_open();
    bridge.wait_state(ConnectionState::Open).await;

    s.emit_message(text_envelope("m1", BOB, "/new"));
    let sent = s.wait_for_sent(1, WAIT).await;
    assert!(sent[0].text.contains("+6282222"));
    assert_eq!(bridge.llm.call_count(), 0);
    assert!(!bridge.registry.contains(&ConversationId::new(BOB)).await);

    bridge.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn back_to_back_messages_run_in_arrival_order() {
    for round in 0..20 {
        let llm = ScriptedLlmClient::new().with_delay(Duration::from_millis(5));
        let mut bridge = start(AppConfig::default(), llm, paired_store()).await;
        let s = bridge.session(1).await;
        s.emit_open();
        bridge.wait_state(ConnectionState::Open).await;

        s.emit_message(text_envelope("m1", ALICE, "first"));
        s.emit_message(text_envelope("m2", ALICE, "second"));
        let sent = s.wait_for_sent(2, WAIT).await;
        assert_eq!(sent.len(), 2, "round {round}");
        assert_eq!(sent[0].quoted.as_deref(), Some("m1"), "round {round}");
        assert_eq!(sent[1].quoted.as_deref(), Some("m2"), "round {round}");

        // 第二个轮次看到的历史包含第一个轮次的完整问答
        let calls = bridge.llm.calls();
        assert_eq!(calls.len(), 2, "round {round}");
        assert_eq!(calls[0].len(), 3);
        assert_eq!(calls[0][2].text, "first", "round {round}");
        assert_eq!(calls[1].len(), 5);
        assert_eq!(calls[1][2].text, "first", "round {round}");
        assert_eq!(calls[1][4].text, "second", "round {round}");
        let ctx = bridge.registry.snapshot(&ConversationId::new(ALICE)).await.unwrap();
        assert_eq!(ctx.len(), 6);

        bridge.stop().await;
    }
}

#[tokio::test]
async fn ai_failure_leaves_no_context_and_apologises() {
    let llm = ScriptedLlmClient::new();
    llm.push(Err(LlmError::Api("quota".to_string())));
    let mut bridge = start(AppConfig::default(), llm, paired_store()).await;
    let s = bridge.session(1).await;
    s.emit_open();
    bridge.wait_state(ConnectionState::Open).await;

    s.emit_message(text_envelope("m1", ALICE, "hello"));
    let sent = s.wait_for_sent(1, WAIT).await;
    assert_eq!(sent[0].text, AppConfig::default().assistant.failure_reply);
    assert_eq!(sent[0].quoted.as_deref(), Some("m1"));
    assert!(!bridge.registry.contains(&ConversationId::new(ALICE)).await);

    // 下一条消息从种子对重新开始
    s.emit_message(text_envelope("m2", ALICE, "again"));
    s.wait_for_sent(2, WAIT).await;
    assert_eq!(bridge.llm.calls()[1].len(), 3);

    bridge.stop().await;
}

#[tokio::test]
async fn timed_out_reconnects_and_clears_contexts() {
    let mut bridge = start(AppConfig::default(), ScriptedLlmClient::new(), paired_store()).await;
    let s1 = bridge.session(1).await;
    s1.emit_open();
    bridge.wait_state(ConnectionState::Open).await;
    s1.emit_message(text_envelope("m1", ALICE, "hello"));
    s1.wait_for_sent(1, WAIT).await;
    assert_eq!(bridge.registry.len().await, 1);

    bridge.drain_transitions();
    s1.emit_close(CloseReason::TimedOut);
    let s2 = bridge.session(2).await;

    assert!(bridge.registry.is_empty().await);
    assert!(s1.is_closed());
    assert_eq!(
        bridge.drain_transitions(),
        vec![ConnectionState::ClosedRetry, ConnectionState::Connecting]
    );

    // 新会话恢复后正常工作，并且没有额外的重连
    s2.emit_open();
    bridge.wait_state(ConnectionState::Open).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(bridge.transport.connect_count(), 2);
    assert_eq!(bridge.transport.overlapping_connects(), 0);
    assert!(bridge.transport.credentials_seen()[1].is_some());

    bridge.stop().await;
}

#[tokio::test]
async fn logged_out_is_fatal_and_server_stays_up() {
    let mut bridge = start(AppConfig::default(), ScriptedLlmClient::new(), paired_store()).await;
    let s = bridge.session(1).await;
    s.emit_open();
    bridge.wait_state(ConnectionState::Open).await;
    bridge.drain_transitions();

    s.emit_close(CloseReason::LoggedOut);
    bridge.wait_state(ConnectionState::ClosedFatal).await;
    assert_eq!(bridge.drain_transitions(), vec![ConnectionState::ClosedFatal]);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(bridge.transport.connect_count(), 1);
    assert!(!bridge.handle.is_finished());
    assert!(bridge.store.load().await.unwrap().is_none());
    assert_eq!(bridge.broadcaster.current().status, PairingStatus::Fatal);

    assert!(matches!(bridge.stop().await, SupervisorExit::Fatal(_)));
}

#[tokio::test]
async fn pairing_flow_persists_credentials_and_reports_paired() {
    let mut bridge = start(AppConfig::default(), ScriptedLlmClient::new(), MemorySessionStore::new()).await;

    let s1 = bridge.session(1).await;
    s1.emit_qr("2@first");
    bridge.wait_state(ConnectionState::QrPending).await;
    s1.emit(TransportEvent::CredentialsRotated(
        SessionCredentials::new().with_part("creds.json", b"{}".to_vec()),
    ));
    s1.emit_close(CloseReason::RestartRequired);

    let s2 = bridge.session(2).await;
    assert!(bridge.transport.credentials_seen()[1].is_some());
    s2.emit_open();
    bridge.wait_state(ConnectionState::Open).await;
    assert_eq!(bridge.broadcaster.current().status, PairingStatus::Paired);
    assert!(bridge.broadcaster.pending_qr().is_none());

    bridge.stop().await;
}

#[tokio::test]
async fn non_allow_listed_group_gets_nothing() {
    let mut config = AppConfig::default();
    config.access.allowed_groups = vec!["1111@g.us".to_string()];
    config.access.scope = AccessScope::Groups;
    let mut bridge = start(config, ScriptedLlmClient::new(), paired_store()).await;
    let s = bridge.session(1).await;
    s.emit_open();
    bridge.wait_state(ConnectionState::Open).await;

    s.emit_message(group_envelope("g1", "2222@g.us", ALICE, "hey bot"));
    s.emit_message(group_envelope("g2", "1111@g.us", ALICE, "hey bot"));

    let sent = s.wait_for_sent(1, WAIT).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(sent.len(), 1);
    assert_eq!(s.sent().len(), 1);
    assert_eq!(s.sent()[0].conversation, ConversationId::new("1111@g.us"));
    assert!(!bridge.registry.contains(&ConversationId::new("2222@g.us")).await);
    assert_eq!(bridge.llm.call_count(), 1);

    bridge.stop().await;
}
