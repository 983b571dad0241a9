//! 消息路由：过滤入站消息，分派重置命令或在独占轮次内转发给 AI

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;

use super::access::{AccessDecision, AccessPolicy};
use super::format::{chunk_reply, format_reply};
use crate::config::AppConfig;
use crate::connection::InboundHandler;
use crate::conversation::{ConversationRegistry, Role, TurnPermit, TurnTicket};
use crate::llm::{GenerationConfig, LlmClient, LlmError};
use crate::transport::{Envelope, MessageRef, Presence, TransportSession};

/// 路由配置（固定回复文本、命令与 AI 参数）
#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub reset_command: String,
    pub failure_reply: String,
    pub unauthorized_reply: String,
    pub max_reply_chars: usize,
    pub generation: GenerationConfig,
    /// 单次 AI 调用上限，超时按失败处理
    pub ai_timeout: Duration,
}

impl RouterConfig {
    pub fn from_app(cfg: &AppConfig) -> Self {
        Self {
            reset_command: cfg.assistant.reset_command.clone(),
            failure_reply: cfg.assistant.failure_reply.clone(),
            unauthorized_reply: cfg.assistant.unauthorized_reply.clone(),
            max_reply_chars: cfg.assistant.max_reply_chars,
            generation: cfg.generation.clone(),
            ai_timeout: Duration::from_secs(cfg.llm.request_timeout_secs),
        }
    }
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self::from_app(&AppConfig::default())
    }
}

/// 单条消息的处理结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteOutcome {
    /// 自己发的、广播地址或非文本
    Ignored,
    /// 重置命令已执行并回复确认
    Reset,
    Denied,
    Replied,
    /// AI 失败：上下文已重置并发送致歉
    Failed,
    /// 轮次开始后发生重连，结果丢弃
    Discarded,
}

/// 同步分类的结果；轮次类消息已持有排队票据
enum Accepted {
    Ignored,
    Denied { reply: bool },
    Reset(TurnTicket),
    Turn { ticket: TurnTicket, text: String },
}

pub struct MessageRouter {
    registry: Arc<ConversationRegistry>,
    llm: Arc<dyn LlmClient>,
    access: AccessPolicy,
    config: RouterConfig,
}

impl MessageRouter {
    pub fn new(
        registry: Arc<ConversationRegistry>,
        llm: Arc<dyn LlmClient>,
        access: AccessPolicy,
        config: RouterConfig,
    ) -> Self {
        Self {
            registry,
            llm,
            access,
            config,
        }
    }

    fn is_reset_command(&self, text: &str) -> bool {
        text.trim().eq_ignore_ascii_case(self.config.reset_command.trim())
    }

    /// 处理单条消息（先排队再执行）
    pub async fn route(&self, session: &dyn TransportSession, envelope: &Envelope) -> RouteOutcome {
        let accepted = self.accept(envelope);
        self.process(session, envelope, accepted).await
    }

    /// 同步分类；需要轮次的消息在此领取排队票据，调用顺序即同一会话的执行顺序
    fn accept(&self, envelope: &Envelope) -> Accepted {
        if envelope.from_me || envelope.message.from_me || envelope.conversation.is_broadcast() {
            return Accepted::Ignored;
        }
        let Some(text) = envelope.text.as_deref().filter(|t| !t.trim().is_empty()) else {
            return Accepted::Ignored;
        };
        let id = &envelope.conversation;
        let decision = self.access.check(envelope);

        if self.is_reset_command(text) {
            // 未授权的群组连重置确认也不回复；私聊仍按命令优先处理
            if id.is_group() && matches!(decision, AccessDecision::Denied { .. }) {
                return Accepted::Denied { reply: false };
            }
            return Accepted::Reset(self.registry.reserve_turn(id));
        }

        match decision {
            AccessDecision::Denied { reply } => Accepted::Denied { reply },
            AccessDecision::Allowed => Accepted::Turn {
                ticket: self.registry.reserve_turn(id),
                text: text.to_string(),
            },
        }
    }

    async fn process(
        &self,
        session: &dyn TransportSession,
        envelope: &Envelope,
        accepted: Accepted,
    ) -> RouteOutcome {
        let id = &envelope.conversation;
        match accepted {
            Accepted::Ignored => RouteOutcome::Ignored,
            Accepted::Denied { reply } => {
                tracing::debug!(conversation = %id, sender = %envelope.sender, "Message not allow-listed");
                if reply {
                    send(session, envelope, &self.config.unauthorized_reply, Some(&envelope.message)).await;
                }
                RouteOutcome::Denied
            }
            Accepted::Reset(ticket) => {
                self.registry
                    .with_turn(ticket, |_permit| async move {
                        mark_read(session, &envelope.message).await;
                        let existed = self.registry.reset(id).await;
                        tracing::info!(conversation = %id, existed, "Conversation reset");
                        let reply = format!("Conversation ID: {}", id.canonical());
                        send(session, envelope, &reply, Some(&envelope.message)).await;
                    })
                    .await;
                RouteOutcome::Reset
            }
            Accepted::Turn { ticket, text } => {
                self.registry
                    .with_turn(ticket, |permit| self.run_turn(permit, session, envelope, &text))
                    .await
            }
        }
    }

    async fn run_turn(
        &self,
        permit: TurnPermit,
        session: &dyn TransportSession,
        envelope: &Envelope,
        text: &str,
    ) -> RouteOutcome {
        mark_read(session, &envelope.message).await;
        set_presence(session, envelope, Presence::Composing).await;
        let outcome = self.compose(&permit, session, envelope, text).await;
        set_presence(session, envelope, Presence::Paused).await;
        outcome
    }

    async fn compose(
        &self,
        permit: &TurnPermit,
        session: &dyn TransportSession,
        envelope: &Envelope,
        text: &str,
    ) -> RouteOutcome {
        let id = permit.id();
        if let Err(e) = self
            .registry
            .get_or_create_in(permit, envelope.display_name.as_deref())
            .await
        {
            tracing::debug!("Dropping turn: {}", e);
            return RouteOutcome::Discarded;
        }
        let history = match self.registry.append_turn_in(permit, Role::User, text).await {
            Ok(ctx) => ctx.turns().to_vec(),
            Err(e) => {
                tracing::debug!("Dropping turn: {}", e);
                return RouteOutcome::Discarded;
            }
        };

        let result = match tokio::time::timeout(
            self.config.ai_timeout,
            self.llm.respond(&history, &self.config.generation),
        )
        .await
        {
            Ok(r) => r,
            Err(_) => Err(LlmError::Timeout(self.config.ai_timeout.as_secs())),
        };
        let result = result.and_then(|reply| {
            if reply.trim().is_empty() {
                Err(LlmError::Empty)
            } else {
                Ok(reply)
            }
        });

        match result {
            Ok(reply) => {
                if let Err(e) = self
                    .registry
                    .append_turn_in(permit, Role::Assistant, reply.as_str())
                    .await
                {
                    tracing::debug!("Discarding stale reply: {}", e);
                    return RouteOutcome::Discarded;
                }
                let formatted = format_reply(&reply);
                for (i, chunk) in chunk_reply(&formatted, self.config.max_reply_chars)
                    .iter()
                    .enumerate()
                {
                    let quoting = (i == 0).then_some(&envelope.message);
                    send(session, envelope, chunk, quoting).await;
                }
                RouteOutcome::Replied
            }
            Err(e) => {
                if self.registry.epoch() != permit.epoch() {
                    tracing::debug!(conversation = %id, "AI call failed after reconnect, discarding: {}", e);
                    return RouteOutcome::Discarded;
                }
                tracing::warn!(conversation = %id, "AI call via {} failed: {}", self.llm.name(), e);
                self.registry.reset(id).await;
                send(session, envelope, &self.config.failure_reply, Some(&envelope.message)).await;
                RouteOutcome::Failed
            }
        }
    }
}

impl InboundHandler for MessageRouter {
    fn dispatch(
        self: Arc<Self>,
        session: Arc<dyn TransportSession>,
        envelope: Envelope,
    ) -> BoxFuture<'static, ()> {
        let accepted = self.accept(&envelope);
        Box::pin(async move {
            let outcome = self.process(session.as_ref(), &envelope, accepted).await;
            tracing::debug!(conversation = %envelope.conversation, ?outcome, "Message routed");
        })
    }
}

async fn mark_read(session: &dyn TransportSession, message: &MessageRef) {
    if let Err(e) = session.mark_read(message).await {
        tracing::debug!("Read receipt failed: {}", e);
    }
}

async fn set_presence(session: &dyn TransportSession, envelope: &Envelope, presence: Presence) {
    if let Err(e) = session.set_presence(&envelope.conversation, presence).await {
        tracing::debug!("Presence update failed: {}", e);
    }
}

async fn send(
    session: &dyn TransportSession,
    envelope: &Envelope,
    text: &str,
    quoting: Option<&MessageRef>,
) {
    if let Err(e) = session.send_text(&envelope.conversation, text, quoting).await {
        tracing::warn!(conversation = %envelope.conversation, "Failed to send reply: {}", e);
    }
}
