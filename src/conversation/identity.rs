//! 会话标识：对端网络地址（如 `6281234@s.whatsapp.net`、`1203630@g.us`）

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

const GROUP_SUFFIX: &str = "@g.us";
const BROADCAST_SUFFIX: &str = "@broadcast";

fn digits_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\d+").expect("static regex"))
}

/// 对端的稳定标识（个人或群组），会话生命周期内不可变
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationId(String);

impl ConversationId {
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_group(&self) -> bool {
        self.0.ends_with(GROUP_SUFFIX)
    }

    /// 广播地址（状态更新等），不作为会话处理
    pub fn is_broadcast(&self) -> bool {
        self.0.ends_with(BROADCAST_SUFFIX)
    }

    /// 规范展示形式：`+` 加地址中第一段数字；没有数字时原样返回
    pub fn canonical(&self) -> String {
        match digits_re().find(&self.0) {
            Some(m) => format!("+{}", m.as_str()),
            None => self.0.clone(),
        }
    }

    /// 地址的用户部分（`@` 之前），用于白名单匹配
    pub fn user_part(&self) -> &str {
        self.0.split('@').next().unwrap_or(&self.0)
    }
}

impl std::fmt::Display for ConversationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ConversationId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}
