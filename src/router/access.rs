//! 白名单：按群组或联系人放行
//!
//! scope 决定哪类会话受限；受限类别的列表为空时该类全部拒绝。两个列表都为空则不启用。

use std::collections::HashSet;

use crate::config::{AccessScope, AccessSection};
use crate::transport::Envelope;

/// 白名单判定结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessDecision {
    Allowed,
    /// reply 为 true 时回复一条未授权提示
    Denied { reply: bool },
}

#[derive(Debug, Clone, Default)]
pub struct AccessPolicy {
    groups: HashSet<String>,
    /// 完整地址（含 `@`）
    contact_addresses: HashSet<String>,
    /// 纯号码
    contact_numbers: HashSet<String>,
    scope: AccessScope,
    reply_unauthorized_direct: bool,
}

impl AccessPolicy {
    /// 不做任何限制
    pub fn open() -> Self {
        Self::default()
    }

    pub fn from_config(cfg: &AccessSection) -> Self {
        let mut contact_addresses = HashSet::new();
        let mut contact_numbers = HashSet::new();
        for entry in &cfg.allowed_contacts {
            let entry = entry.trim();
            if entry.contains('@') {
                contact_addresses.insert(entry.to_string());
            } else {
                let digits: String = entry.chars().filter(|c| c.is_ascii_digit()).collect();
                if !digits.is_empty() {
                    contact_numbers.insert(digits);
                }
            }
        }
        Self {
            groups: cfg
                .allowed_groups
                .iter()
                .map(|g| g.trim().to_string())
                .filter(|g| !g.is_empty())
                .collect(),
            contact_addresses,
            contact_numbers,
            scope: cfg.scope,
            reply_unauthorized_direct: cfg.reply_unauthorized_direct,
        }
    }

    pub fn is_enabled(&self) -> bool {
        !self.groups.is_empty() || !self.contact_addresses.is_empty() || !self.contact_numbers.is_empty()
    }

    pub fn check(&self, envelope: &Envelope) -> AccessDecision {
        if !self.is_enabled() {
            return AccessDecision::Allowed;
        }
        if envelope.conversation.is_group() {
            if !matches!(self.scope, AccessScope::Groups | AccessScope::Both) {
                return AccessDecision::Allowed;
            }
            if self.groups.contains(envelope.conversation.as_str()) {
                AccessDecision::Allowed
            } else {
                // 群聊永不回复
                AccessDecision::Denied { reply: false }
            }
        } else {
            if !matches!(self.scope, AccessScope::Direct | AccessScope::Both) {
                return AccessDecision::Allowed;
            }
            let sender = &envelope.sender;
            if self.contact_addresses.contains(sender.as_str())
                || self.contact_numbers.contains(sender.user_part())
            {
                AccessDecision::Allowed
            } else {
                AccessDecision::Denied {
                    reply: self.reply_unauthorized_direct,
                }
            }
        }
    }
}
