//! 会话上下文：种子问候对 + 最近 N 轮对话
//!
//! 种子对（user 问候 + assistant 人设回复）在首条真实消息时懒插入，永不被剪枝；
//! 其后的 user/assistant 对超过 max_turns 时丢弃最旧的一对。

use super::turn::{Role, Turn};

/// 种子对固定占用的条数
pub const SEED_LEN: usize = 2;

/// 单个会话的有序轮次历史
#[derive(Clone, Debug)]
pub struct ConversationContext {
    turns: Vec<Turn>,
    max_turns: usize,
}

impl ConversationContext {
    /// 以种子对创建上下文（创建后永不为空）；max_turns 至少为 1，最新一轮永不被剪掉
    pub fn seeded(seed_user: impl Into<String>, seed_reply: impl Into<String>, max_turns: usize) -> Self {
        Self {
            turns: vec![Turn::user(seed_user), Turn::assistant(seed_reply)],
            max_turns: max_turns.max(1),
        }
    }

    pub fn push(&mut self, role: Role, text: impl Into<String>) {
        self.turns.push(Turn {
            role,
            text: text.into(),
        });
        self.prune();
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    /// 超出 max_turns*2 条（不含种子）时，从种子之后成对丢弃最旧的消息
    fn prune(&mut self) {
        let limit = self.max_turns * 2;
        let body = self.turns.len().saturating_sub(SEED_LEN);
        if body > limit {
            let mut excess = body - limit;
            // 成对丢弃，避免历史以 assistant 开头
            excess += excess % 2;
            let excess = excess.min(body);
            self.turns.drain(SEED_LEN..SEED_LEN + excess);
        }
    }
}
