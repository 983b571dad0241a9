//! 会话注册表：ConversationId -> ConversationContext
//!
//! - 首条消息时懒创建种子上下文，并发下幂等（不会重复插种子）
//! - 每个会话同一时刻至多一个轮次在途：`reserve_turn` 同步领取排队票据，票据按领取顺序
//!   依次执行（前一张票据完成或被丢弃后下一张才开始），不依赖任务被调度的先后
//! - `clear_all` 推进失效纪元；纪元之前开始的轮次写回时失败（结果由调用方丢弃）

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex as StdMutex;

use thiserror::Error;
use tokio::sync::{oneshot, RwLock};

use super::context::ConversationContext;
use super::identity::ConversationId;
use super::turn::{Role, Turn};

/// 注册表错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("No such conversation: {0}")]
    NoSuchConversation(ConversationId),

    /// 轮次开始后发生了全局清空（重连），上下文已不属于本轮
    #[error("Conversation invalidated by reconnect: {0}")]
    Invalidated(ConversationId),
}

/// 种子问候对：`{name}` 会被替换为对端显示名
#[derive(Debug, Clone)]
pub struct SeedPolicy {
    pub user_template: String,
    pub reply: String,
}

impl SeedPolicy {
    pub fn seed_user(&self, display_name: Option<&str>) -> String {
        self.user_template
            .replace("{name}", display_name.unwrap_or("friend"))
    }
}

impl Default for SeedPolicy {
    fn default() -> Self {
        Self {
            user_template: "Hello, my name is: {name}".to_string(),
            reply: "Hello! I am your personal assistant: helpful, creative, smart and friendly."
                .to_string(),
        }
    }
}

/// 排队票据：在消息到达时同步领取，决定同一会话内的执行顺序
///
/// 丢弃未执行的票据等同于空轮次：前一个轮次结束后立即放行后继。
#[derive(Debug)]
pub struct TurnTicket {
    id: ConversationId,
    seq: u64,
    previous: Option<oneshot::Receiver<()>>,
    done: Option<oneshot::Sender<()>>,
}

impl TurnTicket {
    pub fn id(&self) -> &ConversationId {
        &self.id
    }
}

impl Drop for TurnTicket {
    fn drop(&mut self) {
        let (Some(previous), Some(done)) = (self.previous.take(), self.done.take()) else {
            return;
        };
        // 仍有前驱在途：由后台任务等它结束再放行，保持队列顺序
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                let _ = previous.await;
                drop(done);
            });
        }
    }
}

/// 队尾：最近一张票据的完成信号
struct QueueTail {
    seq: u64,
    done: oneshot::Receiver<()>,
}

/// 轮次许可：会话标识 + 轮次开始时的纪元；票据在 `with_turn` 的闭包完成后才释放
#[derive(Debug, Clone)]
pub struct TurnPermit {
    id: ConversationId,
    epoch: u64,
}

impl TurnPermit {
    pub fn id(&self) -> &ConversationId {
        &self.id
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }
}

/// 会话注册表（显式持有，无全局状态）
pub struct ConversationRegistry {
    contexts: RwLock<HashMap<ConversationId, ConversationContext>>,
    turn_queues: StdMutex<HashMap<ConversationId, QueueTail>>,
    next_ticket: AtomicU64,
    epoch: AtomicU64,
    seed: SeedPolicy,
    max_turns: usize,
}

impl ConversationRegistry {
    pub fn new(seed: SeedPolicy, max_turns: usize) -> Self {
        Self {
            contexts: RwLock::new(HashMap::new()),
            turn_queues: StdMutex::new(HashMap::new()),
            next_ticket: AtomicU64::new(0),
            epoch: AtomicU64::new(0),
            seed,
            max_turns,
        }
    }

    /// 当前失效纪元（每次 clear_all 加一）
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    /// 获取或创建上下文，返回快照
    pub async fn get_or_create(
        &self,
        id: &ConversationId,
        display_name: Option<&str>,
    ) -> ConversationContext {
        let mut contexts = self.contexts.write().await;
        contexts
            .entry(id.clone())
            .or_insert_with(|| self.new_context(display_name))
            .clone()
    }

    /// 在轮次许可内获取或创建；许可已过期时不再创建
    pub async fn get_or_create_in(
        &self,
        permit: &TurnPermit,
        display_name: Option<&str>,
    ) -> Result<ConversationContext, RegistryError> {
        let mut contexts = self.contexts.write().await;
        if self.epoch() != permit.epoch {
            return Err(RegistryError::Invalidated(permit.id.clone()));
        }
        Ok(contexts
            .entry(permit.id.clone())
            .or_insert_with(|| self.new_context(display_name))
            .clone())
    }

    /// 追加轮次，返回追加后的长度；上下文不存在时返回 NoSuchConversation
    pub async fn append_turn(
        &self,
        id: &ConversationId,
        role: Role,
        text: impl Into<String>,
    ) -> Result<usize, RegistryError> {
        let mut contexts = self.contexts.write().await;
        let ctx = contexts
            .get_mut(id)
            .ok_or_else(|| RegistryError::NoSuchConversation(id.clone()))?;
        ctx.push(role, text);
        Ok(ctx.len())
    }

    /// 在轮次许可内追加：纪元变化返回 Invalidated，上下文被删返回 NoSuchConversation
    pub async fn append_turn_in(
        &self,
        permit: &TurnPermit,
        role: Role,
        text: impl Into<String>,
    ) -> Result<ConversationContext, RegistryError> {
        let mut contexts = self.contexts.write().await;
        if self.epoch() != permit.epoch {
            return Err(RegistryError::Invalidated(permit.id.clone()));
        }
        let ctx = contexts
            .get_mut(&permit.id)
            .ok_or_else(|| RegistryError::NoSuchConversation(permit.id.clone()))?;
        ctx.push(role, text);
        Ok(ctx.clone())
    }

    /// 删除会话上下文；返回之前是否存在
    pub async fn reset(&self, id: &ConversationId) -> bool {
        self.contexts.write().await.remove(id).is_some()
    }

    /// 删除全部上下文并推进纪元；返回删除数量
    pub async fn clear_all(&self) -> usize {
        let mut contexts = self.contexts.write().await;
        let n = contexts.len();
        contexts.clear();
        self.epoch.fetch_add(1, Ordering::SeqCst);
        n
    }

    pub async fn snapshot(&self, id: &ConversationId) -> Option<Vec<Turn>> {
        self.contexts
            .read()
            .await
            .get(id)
            .map(|c| c.turns().to_vec())
    }

    pub async fn contains(&self, id: &ConversationId) -> bool {
        self.contexts.read().await.contains_key(id)
    }

    /// 当前上下文数量
    pub async fn len(&self) -> usize {
        self.contexts.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.contexts.read().await.is_empty()
    }

    /// 同步领取排队票据：同一会话按领取顺序执行，不同会话互不阻塞
    pub fn reserve_turn(&self, id: &ConversationId) -> TurnTicket {
        let (done, waiter) = oneshot::channel();
        let seq = self.next_ticket.fetch_add(1, Ordering::SeqCst);
        let mut queues = self.turn_queues.lock().unwrap_or_else(|e| e.into_inner());
        let previous = queues
            .insert(id.clone(), QueueTail { seq, done: waiter })
            .map(|tail| tail.done);
        TurnTicket {
            id: id.clone(),
            seq,
            previous,
            done: Some(done),
        }
    }

    /// 等到票据排到队首后执行一个轮次
    pub async fn with_turn<F, Fut, R>(&self, mut ticket: TurnTicket, f: F) -> R
    where
        F: FnOnce(TurnPermit) -> Fut,
        Fut: Future<Output = R>,
    {
        let previous = ticket.previous.take();
        let done = ticket.done.take();
        let (id, seq) = (ticket.id.clone(), ticket.seq);
        drop(ticket);
        if let Some(previous) = previous {
            // 发送端被丢弃即代表前一个轮次已结束
            let _ = previous.await;
        }
        let permit = TurnPermit {
            id: id.clone(),
            epoch: self.epoch(),
        };
        let out = f(permit).await;
        drop(done);
        self.release_tail(&id, seq);
        out
    }

    /// 独占一个轮次：领取票据并立即排队执行
    pub async fn with_exclusive_turn<F, Fut, R>(&self, id: &ConversationId, f: F) -> R
    where
        F: FnOnce(TurnPermit) -> Fut,
        Fut: Future<Output = R>,
    {
        let ticket = self.reserve_turn(id);
        self.with_turn(ticket, f).await
    }

    /// 自己仍是队尾（后面没人排队）时回收该会话的队列
    fn release_tail(&self, id: &ConversationId, seq: u64) {
        let mut queues = self.turn_queues.lock().unwrap_or_else(|e| e.into_inner());
        if queues.get(id).is_some_and(|tail| tail.seq == seq) {
            queues.remove(id);
        }
    }

    fn new_context(&self, display_name: Option<&str>) -> ConversationContext {
        ConversationContext::seeded(
            self.seed.seed_user(display_name),
            self.seed.reply.clone(),
            self.max_turns,
        )
    }
}

impl Default for ConversationRegistry {
    fn default() -> Self {
        Self::new(SeedPolicy::default(), 20)
    }
}
