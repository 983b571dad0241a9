//! 消息网络传输层抽象
//!
//! 协议实现不在本 crate 内：外部客户端实现 Transport / TransportSession，
//! 通过事件通道把凭据轮换、连接状态变化和入站消息推给 ConnectionSupervisor。

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::connection::CloseReason;
use crate::conversation::ConversationId;
use crate::session::SessionCredentials;

/// 传输层错误
#[derive(Error, Debug, Clone)]
pub enum TransportError {
    /// 凭据无法使用（损坏、格式不符），重连无意义
    #[error("Invalid credentials: {0}")]
    Credentials(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Session closed")]
    Closed,

    #[error("Send failed: {0}")]
    Send(String),
}

impl TransportError {
    /// 连接阶段出现该错误时是否应终止而非重试
    pub fn is_fatal(&self) -> bool {
        matches!(self, TransportError::Credentials(_))
    }
}

/// 消息引用：用于已读回执与引用回复
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRef {
    pub id: String,
    pub conversation: ConversationId,
    pub from_me: bool,
}

/// 入站消息信封
#[derive(Debug, Clone)]
pub struct Envelope {
    pub message: MessageRef,
    /// 实际发送者（群聊中与 conversation 不同）
    pub sender: ConversationId,
    pub conversation: ConversationId,
    /// 纯文本正文；媒体等非文本消息为 None
    pub text: Option<String>,
    pub display_name: Option<String>,
    pub from_me: bool,
}

/// 在线状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Presence {
    Available,
    Composing,
    Paused,
}

/// 传输层报告的链路状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Connecting,
    Open,
    Close,
}

/// 连接状态更新（字段均可选，与底层库一致）
#[derive(Debug, Clone, Default)]
pub struct ConnectionUpdate {
    pub link: Option<LinkState>,
    pub close_reason: Option<CloseReason>,
    pub pairing_code: Option<String>,
}

impl ConnectionUpdate {
    pub fn open() -> Self {
        Self {
            link: Some(LinkState::Open),
            ..Default::default()
        }
    }

    pub fn closed(reason: CloseReason) -> Self {
        Self {
            link: Some(LinkState::Close),
            close_reason: Some(reason),
            ..Default::default()
        }
    }

    pub fn pairing(code: impl Into<String>) -> Self {
        Self {
            pairing_code: Some(code.into()),
            ..Default::default()
        }
    }
}

/// 传输层事件
#[derive(Debug, Clone)]
pub enum TransportEvent {
    CredentialsRotated(SessionCredentials),
    ConnectionUpdate(ConnectionUpdate),
    MessageReceived(Envelope),
}

/// 一次已建立的传输会话
#[async_trait]
pub trait TransportSession: Send + Sync {
    async fn mark_read(&self, message: &MessageRef) -> Result<(), TransportError>;

    async fn set_presence(
        &self,
        conversation: &ConversationId,
        presence: Presence,
    ) -> Result<(), TransportError>;

    async fn send_text(
        &self,
        conversation: &ConversationId,
        text: &str,
        quoting: Option<&MessageRef>,
    ) -> Result<(), TransportError>;

    async fn logout(&self) -> Result<(), TransportError>;

    /// 拆除会话；返回时底层资源已释放，可以安全发起下一次 connect
    async fn close(&self);
}

/// connect 的结果：会话句柄 + 按序投递的事件流
pub struct TransportConnection {
    pub session: Arc<dyn TransportSession>,
    pub events: mpsc::UnboundedReceiver<TransportEvent>,
}

/// 传输层客户端
#[async_trait]
pub trait Transport: Send + Sync {
    fn name(&self) -> &str;

    async fn connect(
        &self,
        credentials: Option<SessionCredentials>,
    ) -> Result<TransportConnection, TransportError>;
}
