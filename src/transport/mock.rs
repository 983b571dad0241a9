//! Mock 传输层（用于测试，无需真实网络）
//!
//! 每次 connect 生成一个 MockSession：测试通过 `emit` 注入事件，
//! 通过 `sent()` 等检查 Router 写回的消息、已读回执与在线状态。

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Notify};

use super::traits::{
    ConnectionUpdate, Envelope, MessageRef, Presence, Transport, TransportConnection,
    TransportError, TransportEvent, TransportSession,
};
use crate::connection::CloseReason;
use crate::conversation::ConversationId;
use crate::session::SessionCredentials;

/// 已发送的一条文本
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentText {
    pub conversation: ConversationId,
    pub text: String,
    pub quoted: Option<String>,
}

#[derive(Default)]
struct SessionLog {
    sent: Vec<SentText>,
    read: Vec<String>,
    presence: Vec<(ConversationId, Presence)>,
}

/// Mock 会话：记录所有出站操作
pub struct MockSession {
    events: mpsc::UnboundedSender<TransportEvent>,
    log: Mutex<SessionLog>,
    closed: AtomicBool,
    logged_out: AtomicBool,
    changed: Notify,
}

impl MockSession {
    fn new(events: mpsc::UnboundedSender<TransportEvent>) -> Self {
        Self {
            events,
            log: Mutex::new(SessionLog::default()),
            closed: AtomicBool::new(false),
            logged_out: AtomicBool::new(false),
            changed: Notify::new(),
        }
    }

    /// 注入一个传输事件；会话已被拆除时静默丢弃
    pub fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }

    pub fn emit_open(&self) {
        self.emit(TransportEvent::ConnectionUpdate(ConnectionUpdate::open()));
    }

    pub fn emit_close(&self, reason: CloseReason) {
        self.emit(TransportEvent::ConnectionUpdate(ConnectionUpdate::closed(reason)));
    }

    pub fn emit_qr(&self, code: &str) {
        self.emit(TransportEvent::ConnectionUpdate(ConnectionUpdate::pairing(code)));
    }

    pub fn emit_message(&self, envelope: Envelope) {
        self.emit(TransportEvent::MessageReceived(envelope));
    }

    pub fn sent(&self) -> Vec<SentText> {
        self.lock_log().sent.clone()
    }

    pub fn read_receipts(&self) -> Vec<String> {
        self.lock_log().read.clone()
    }

    pub fn presence_updates(&self) -> Vec<(ConversationId, Presence)> {
        self.lock_log().presence.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn is_logged_out(&self) -> bool {
        self.logged_out.load(Ordering::SeqCst)
    }

    /// 等待已发送条数达到 n；超时返回当前记录
    pub async fn wait_for_sent(&self, n: usize, timeout: Duration) -> Vec<SentText> {
        let _ = tokio::time::timeout(timeout, async {
            loop {
                let notified = self.changed.notified();
                if self.lock_log().sent.len() >= n {
                    return;
                }
                notified.await;
            }
        })
        .await;
        self.sent()
    }

    fn lock_log(&self) -> std::sync::MutexGuard<'_, SessionLog> {
        self.log.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl TransportSession for MockSession {
    async fn mark_read(&self, message: &MessageRef) -> Result<(), TransportError> {
        self.lock_log().read.push(message.id.clone());
        Ok(())
    }

    async fn set_presence(
        &self,
        conversation: &ConversationId,
        presence: Presence,
    ) -> Result<(), TransportError> {
        self.lock_log().presence.push((conversation.clone(), presence));
        Ok(())
    }

    async fn send_text(
        &self,
        conversation: &ConversationId,
        text: &str,
        quoting: Option<&MessageRef>,
    ) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        self.lock_log().sent.push(SentText {
            conversation: conversation.clone(),
            text: text.to_string(),
            quoted: quoting.map(|m| m.id.clone()),
        });
        self.changed.notify_waiters();
        Ok(())
    }

    async fn logout(&self) -> Result<(), TransportError> {
        self.logged_out.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.changed.notify_waiters();
    }
}

#[derive(Default)]
struct TransportLog {
    sessions: Vec<Arc<MockSession>>,
    credentials_seen: Vec<Option<SessionCredentials>>,
    failures: VecDeque<TransportError>,
    overlapping_connects: usize,
}

/// Mock 传输层
#[derive(Default)]
pub struct MockTransport {
    log: Mutex<TransportLog>,
    connected: Notify,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// 让接下来的 connect 依次失败
    pub fn fail_next_connect(&self, err: TransportError) {
        self.lock_log().failures.push_back(err);
    }

    /// connect 调用次数（含失败）
    pub fn connect_count(&self) -> usize {
        self.lock_log().credentials_seen.len()
    }

    /// 每次 connect 收到的凭据
    pub fn credentials_seen(&self) -> Vec<Option<SessionCredentials>> {
        self.lock_log().credentials_seen.clone()
    }

    /// 上一个会话尚未拆除就再次 connect 的次数（应始终为 0）
    pub fn overlapping_connects(&self) -> usize {
        self.lock_log().overlapping_connects
    }

    pub fn session(&self, index: usize) -> Option<Arc<MockSession>> {
        self.lock_log().sessions.get(index).cloned()
    }

    pub fn session_count(&self) -> usize {
        self.lock_log().sessions.len()
    }

    /// 等待第 n 个（从 1 开始）会话建立；超时返回 None
    pub async fn wait_for_session(&self, n: usize, timeout: Duration) -> Option<Arc<MockSession>> {
        let waited = tokio::time::timeout(timeout, async {
            loop {
                let notified = self.connected.notified();
                if let Some(s) = self.session(n - 1) {
                    return s;
                }
                notified.await;
            }
        })
        .await;
        waited.ok()
    }

    fn lock_log(&self) -> std::sync::MutexGuard<'_, TransportLog> {
        self.log.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn name(&self) -> &str {
        "mock"
    }

    async fn connect(
        &self,
        credentials: Option<SessionCredentials>,
    ) -> Result<TransportConnection, TransportError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let session = Arc::new(MockSession::new(tx));
        {
            let mut log = self.lock_log();
            log.credentials_seen.push(credentials);
            if let Some(err) = log.failures.pop_front() {
                return Err(err);
            }
            // 新会话建立前，上一个会话必须已拆除
            if log.sessions.last().is_some_and(|prev| !prev.is_closed()) {
                log.overlapping_connects += 1;
            }
            log.sessions.push(Arc::clone(&session));
        }
        self.connected.notify_waiters();
        Ok(TransportConnection {
            session,
            events: rx,
        })
    }
}

/// 便捷构造：私聊文本消息
pub fn text_envelope(id: &str, from: &str, text: &str) -> Envelope {
    let conversation = ConversationId::new(from);
    Envelope {
        message: MessageRef {
            id: id.to_string(),
            conversation: conversation.clone(),
            from_me: false,
        },
        sender: conversation.clone(),
        conversation,
        text: Some(text.to_string()),
        display_name: Some("Tester".to_string()),
        from_me: false,
    }
}

/// 便捷构造：群聊文本消息
pub fn group_envelope(id: &str, group: &str, sender: &str, text: &str) -> Envelope {
    let conversation = ConversationId::new(group);
    Envelope {
        message: MessageRef {
            id: id.to_string(),
            conversation: conversation.clone(),
            from_me: false,
        },
        sender: ConversationId::new(sender),
        conversation,
        text: Some(text.to_string()),
        display_name: Some("Member".to_string()),
        from_me: false,
    }
}
